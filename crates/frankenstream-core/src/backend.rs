//! Collaborators the engine consumes through narrow traits.
//!
//! The engine never issues syscalls itself. Descriptor I/O, buffer sizing,
//! pool reordering, child reaping, and exit-hook registration are supplied by
//! the embedder; `frankenstream-os` provides the libc-backed versions and
//! [`crate::memio`] an in-memory descriptor table.

use std::io;
use std::sync::Weak;

use crate::buffer::{BufferGrant, BufferKind};
use crate::engine::Engine;
use crate::error::Result;
use crate::pool::Pool;
use crate::stream::StreamId;

/// Seek origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

/// Low-level descriptor primitives.
pub trait LowLevelIo: Send + Sync {
    fn read(&self, fd: i32, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, fd: i32, buf: &[u8]) -> io::Result<usize>;

    /// Reposition `fd`; returns the resulting absolute offset.
    fn seek(&self, fd: i32, offset: i64, whence: Whence) -> io::Result<i64>;

    fn close(&self, fd: i32) -> io::Result<()>;

    /// Release a mapped window of `len` bytes backing `fd`.
    fn unmap(&self, _fd: i32, _len: usize) -> io::Result<()> {
        Ok(())
    }
}

/// What a sizing policy knows about the stream it is sizing.
#[derive(Debug, Clone, Copy)]
pub struct SizeRequest {
    pub fd: Option<i32>,
    pub readable: bool,
    pub writable: bool,
    /// The descriptor supports seeking.
    pub seekable: bool,
    /// Caller-requested size, if any.
    pub hint: Option<usize>,
    /// The engine's configured default size.
    pub default_size: usize,
    /// The process is exiting; new write buffering is refused.
    pub exiting: bool,
}

/// Pluggable buffer-sizing policy, consulted when a stream first initializes.
pub trait BufferSizer: Send + Sync {
    fn size_for(&self, request: &SizeRequest) -> io::Result<BufferGrant>;
}

/// Allocates `hint` or the configured default, unbuffered once exiting.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSizer;

impl BufferSizer for DefaultSizer {
    fn size_for(&self, request: &SizeRequest) -> io::Result<BufferGrant> {
        if request.exiting && request.writable {
            return Ok(BufferGrant::unbuffered());
        }
        let size = request.hint.unwrap_or(request.default_size);
        if size == 0 {
            return Ok(BufferGrant::unbuffered());
        }
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        data.resize(size, 0);
        Ok(BufferGrant {
            data,
            kind: BufferKind::Owned,
        })
    }
}

/// Pluggable policy that moves a stream to the head of its pool.
pub trait PoolMover: Send + Sync {
    fn move_to_head(&self, pool: &Pool, id: StreamId) -> Result<()>;
}

/// Swaps the stream with the current head; the displaced head is flagged to
/// request promotion on its next mode switch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SwapToHead;

impl PoolMover for SwapToHead {
    fn move_to_head(&self, pool: &Pool, id: StreamId) -> Result<()> {
        pool.swap_to_head(id)
    }
}

/// Waits for a child process.
pub trait ProcessReaper: Send + Sync {
    /// Block until `pid` exits; returns the raw wait status. Interrupted waits
    /// surface as `ErrorKind::Interrupted` and are retried by the caller.
    fn wait(&self, pid: i32) -> io::Result<i32>;
}

/// Reaper for engines without process support: every wait fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReaper;

impl ProcessReaper for NoReaper {
    fn wait(&self, _pid: i32) -> io::Result<i32> {
        Err(io::Error::from_raw_os_error(crate::errno::ECHILD))
    }
}

/// Registers the process-exit flusher with the host.
pub trait ExitHook: Send + Sync {
    /// Called once per engine, the first time a stream joins a pool. The
    /// hook must run [`Engine::run_exit_flush`] on `engine` at exit if it
    /// is still alive then.
    ///
    /// [`Engine::run_exit_flush`]: crate::Engine::run_exit_flush
    fn install(&self, engine: Weak<Engine>) -> bool;
}

/// Leaves exit flushing to explicit [`Engine::run_exit_flush`] calls.
///
/// [`Engine::run_exit_flush`]: crate::Engine::run_exit_flush
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualExit;

impl ExitHook for ManualExit {
    fn install(&self, _engine: Weak<Engine>) -> bool {
        false
    }
}

/// Descriptor I/O for engines that only host string streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedIo;

impl LowLevelIo for DetachedIo {
    fn read(&self, _fd: i32, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(crate::errno::EBADF))
    }

    fn write(&self, _fd: i32, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(crate::errno::EBADF))
    }

    fn seek(&self, _fd: i32, _offset: i64, _whence: Whence) -> io::Result<i64> {
        Err(io::Error::from_raw_os_error(crate::errno::ESPIPE))
    }

    fn close(&self, _fd: i32) -> io::Result<()> {
        Ok(())
    }
}
