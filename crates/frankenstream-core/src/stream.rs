//! Stream state and the caller-facing stream handle.
//!
//! A [`Stream`] pairs an immutable identity with a `parking_lot` mutex around
//! its [`StreamState`]. Buffer offsets are only touched by the thread holding
//! that mutex. Callers that already hold the lock (disciplines, the exit
//! flusher) use the `*_local` entry points on [`StreamState`] directly.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::buffer::{BufferGrant, BufferKind, Window};
use crate::coproc::{Coprocess, ExitStatus};
use crate::disc::Discipline;
use crate::engine::Engine;
use crate::error::{Result, StreamError};
use crate::pool::Pool;
use crate::reserve::ReserveBuffer;

// ---------------------------------------------------------------------------
// Identity and flags
// ---------------------------------------------------------------------------

/// Engine-unique stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// I/O direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// A mode request: an optional direction plus the synchronization flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wanted {
    pub direction: Option<Direction>,
    /// Discard read data buffered before an external sync.
    pub synced: bool,
}

impl Wanted {
    /// Initialize and resynchronize without choosing a direction.
    pub const NONE: Self = Self {
        direction: None,
        synced: false,
    };
    pub const READ: Self = Self {
        direction: Some(Direction::Read),
        synced: false,
    };
    pub const WRITE: Self = Self {
        direction: Some(Direction::Write),
        synced: false,
    };

    #[must_use]
    pub const fn synced(self) -> Self {
        Self {
            direction: self.direction,
            synced: true,
        }
    }
}

/// Observable state of the mode machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Buffer not yet sized.
    Uninitialized,
    Read,
    /// Read mode after an external sync; buffered bytes may be stale.
    ReadSynced,
    Write,
}

/// Capabilities fixed when the stream is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub readable: bool,
    pub writable: bool,
    /// The buffer is the entire content; no descriptor behind it.
    pub string: bool,
    /// The descriptor may be moved by other processes.
    pub shared: bool,
    /// Track the descriptor's position when it moves underneath us.
    pub public: bool,
}

impl Capabilities {
    #[must_use]
    pub const fn read_only() -> Self {
        Self {
            readable: true,
            writable: false,
            string: false,
            shared: false,
            public: false,
        }
    }

    #[must_use]
    pub const fn write_only() -> Self {
        Self {
            readable: false,
            writable: true,
            string: false,
            shared: false,
            public: false,
        }
    }

    #[must_use]
    pub const fn read_write() -> Self {
        Self {
            readable: true,
            writable: true,
            string: false,
            shared: false,
            public: false,
        }
    }

    #[must_use]
    pub const fn string(mut self) -> Self {
        self.string = true;
        self
    }

    #[must_use]
    pub const fn shared_public(mut self) -> Self {
        self.shared = true;
        self.public = true;
        self
    }

    /// True when `direction` is within the declared capability set.
    #[must_use]
    pub const fn supports(&self, direction: Direction) -> bool {
        match direction {
            Direction::Read => self.readable,
            Direction::Write => self.writable,
        }
    }
}

/// Mutable mode bits, protected by the stream lock.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ModeBits {
    /// Buffer not yet sized.
    pub init: bool,
    /// Read buffer reflects a position other processes may have written past.
    pub synced: bool,
    /// Exclusive access held across a call.
    pub lock: bool,
    /// A peek reservation is outstanding.
    pub peek: bool,
    /// Stacked underneath another stream.
    pub push: bool,
    /// A held-back byte must be restored before the next operation.
    pub getr: bool,
    pub closed: bool,
}

/// Sticky status indicators.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StatusFlags {
    pub eof: bool,
    pub error: bool,
}

/// What holds a stream frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freeze {
    /// Exclusive lock held by a higher-level operation.
    Lock,
    /// Outstanding peek reservation.
    Peek,
    /// Stacked underneath another stream.
    Push,
}

/// Pool-visible identity of a stream. The pool keeps these so it can flag a
/// displaced head without taking that stream's lock.
#[derive(Debug)]
pub struct StreamKey {
    id: StreamId,
    awaiting_head: AtomicBool,
}

impl StreamKey {
    pub(crate) fn new(id: StreamId) -> Self {
        Self {
            id,
            awaiting_head: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// True when the stream must be promoted to its pool's head before use.
    pub fn awaiting_head(&self) -> bool {
        self.awaiting_head.load(Ordering::Acquire)
    }

    pub(crate) fn set_awaiting_head(&self, value: bool) {
        self.awaiting_head.store(value, Ordering::Release);
    }

    pub(crate) fn take_awaiting_head(&self) -> bool {
        self.awaiting_head.swap(false, Ordering::AcqRel)
    }
}

// ---------------------------------------------------------------------------
// Stream state
// ---------------------------------------------------------------------------

/// Everything the mode engine mutates. Only reachable through the stream lock.
pub struct StreamState {
    pub(crate) key: Arc<StreamKey>,
    pub(crate) this: Weak<Stream>,
    pub(crate) engine: Arc<Engine>,
    pub(crate) caps: Capabilities,
    /// Active descriptor; swapped with the coprocess's alternate on switches.
    pub(crate) fd: Option<i32>,
    pub(crate) direction: Direction,
    pub(crate) bits: ModeBits,
    pub(crate) status: StatusFlags,
    pub(crate) window: Window,
    /// Logical end of content; `None` for non-seekable descriptors.
    pub(crate) extent: Option<i64>,
    /// Descriptor position. In write mode it is where the window start will
    /// land; in read mode it is just past the last byte read into the window.
    pub(crate) here: i64,
    pub(crate) size_hint: Option<usize>,
    pub(crate) pool: Option<Arc<Pool>>,
    pub(crate) coproc: Option<Coprocess>,
    pub(crate) reserve: Option<ReserveBuffer>,
    pub(crate) discipline: Option<Arc<dyn Discipline>>,
    pub(crate) held_back: Option<u8>,
    pub(crate) ngetr: u32,
}

impl fmt::Debug for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamState")
            .field("id", &self.key.id())
            .field("caps", &self.caps)
            .field("fd", &self.fd)
            .field("phase", &self.phase())
            .field("window", &self.window)
            .field("extent", &self.extent)
            .field("here", &self.here)
            .field("coproc", &self.coproc.is_some())
            .finish_non_exhaustive()
    }
}

impl StreamState {
    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> StreamId {
        self.key.id()
    }

    pub fn caps(&self) -> Capabilities {
        self.caps
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn fd(&self) -> Option<i32> {
        self.fd
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn phase(&self) -> Phase {
        match (self.bits.init, self.direction, self.bits.synced) {
            (true, _, _) => Phase::Uninitialized,
            (false, Direction::Read, true) => Phase::ReadSynced,
            (false, Direction::Read, false) => Phase::Read,
            (false, Direction::Write, _) => Phase::Write,
        }
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Bytes buffered for reading but not yet consumed.
    pub fn unread(&self) -> usize {
        match self.direction {
            Direction::Read => self.window.unread(),
            Direction::Write => 0,
        }
    }

    /// Bytes written into the buffer but not yet flushed.
    pub fn pending(&self) -> usize {
        match self.direction {
            Direction::Write if !self.caps.string => self.window.next(),
            _ => 0,
        }
    }

    /// Bytes that can still be buffered before a flush is needed.
    pub fn write_room(&self) -> usize {
        self.window.room()
    }

    pub fn extent(&self) -> Option<i64> {
        self.extent
    }

    pub fn here(&self) -> i64 {
        self.here
    }

    pub fn pool(&self) -> Option<&Arc<Pool>> {
        self.pool.as_ref()
    }

    pub fn coprocess(&self) -> Option<&Coprocess> {
        self.coproc.as_ref()
    }

    pub fn reserve_buffer(&self) -> Option<&ReserveBuffer> {
        self.reserve.as_ref()
    }

    pub fn is_frozen(&self) -> bool {
        self.bits.lock || self.bits.peek || self.bits.push
    }

    pub fn is_eof(&self) -> bool {
        self.status.eof
    }

    pub fn is_error(&self) -> bool {
        self.status.error
    }

    pub fn clear_err(&mut self) {
        self.status.eof = false;
        self.status.error = false;
    }

    /// A descriptor-backed stream without a descriptor, or a closed stream.
    pub(crate) fn is_detached(&self) -> bool {
        self.bits.closed || (!self.caps.string && self.fd.is_none())
    }

    pub(crate) fn require_fd(&self) -> Result<i32> {
        self.fd.ok_or(StreamError::Closed)
    }

    // -----------------------------------------------------------------------
    // Controls
    // -----------------------------------------------------------------------

    pub fn freeze(&mut self, how: Freeze) {
        match how {
            Freeze::Lock => self.bits.lock = true,
            Freeze::Peek => self.bits.peek = true,
            Freeze::Push => self.bits.push = true,
        }
    }

    pub fn thaw(&mut self, how: Freeze) {
        match how {
            Freeze::Lock => self.bits.lock = false,
            Freeze::Peek => self.bits.peek = false,
            Freeze::Push => self.bits.push = false,
        }
    }

    pub fn set_discipline(&mut self, discipline: Option<Arc<dyn Discipline>>) {
        self.discipline = discipline;
    }

    /// Ask for a specific buffer size at initialization (0 = unbuffered).
    pub fn set_buffer_size(&mut self, size: usize) {
        self.size_hint = Some(size);
    }

    /// Record a separator byte a record reader overwrote just before the
    /// cursor; the next mode request puts it back.
    pub fn hold_back(&mut self, byte: u8) {
        self.held_back = Some(byte);
        self.bits.getr = true;
    }

    /// Move the stream into `pool`, leaving its previous pool.
    pub fn join_pool(&mut self, pool: &Arc<Pool>) -> Result<()> {
        if let Some(current) = &self.pool {
            if Arc::ptr_eq(current, pool) {
                return Ok(());
            }
            current.remove(self.id());
            self.pool = None;
        }
        let engine = Arc::clone(&self.engine);
        engine.register(self, Some(Arc::clone(pool)))?;
        if !pool.is_head(self.id()) {
            self.key.set_awaiting_head(true);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Buffered primitives
    // -----------------------------------------------------------------------

    fn ensure(&mut self, direction: Direction) -> Result<()> {
        let ready = self.phase()
            == match direction {
                Direction::Read => Phase::Read,
                Direction::Write => Phase::Write,
            };
        if ready
            && !self.bits.getr
            && !self.key.awaiting_head()
            && !self.is_frozen()
            && !self.is_detached()
        {
            return Ok(());
        }
        self.request_mode(Wanted {
            direction: Some(direction),
            synced: false,
        })
    }

    /// Read up to `out.len()` bytes, refilling from the descriptor once when
    /// the window is empty. Returns 0 at end of data.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        self.ensure(Direction::Read)?;
        let mut n = self.window.take(out);
        if n == 0 && !out.is_empty() && !self.caps.string && self.fill()? > 0 {
            n = self.window.take(out);
        }
        Ok(n)
    }

    /// Buffer `bytes`, flushing whenever the window fills. String streams
    /// stop at the end of their buffer.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        self.ensure(Direction::Write)?;
        if self.caps.string {
            return Ok(self.window.put(bytes));
        }
        if self.window.is_unbuffered() {
            let fd = self.require_fd()?;
            let n = write_all(self.engine.io(), fd, bytes).inspect_err(|_| {
                self.status.error = true;
            })?;
            self.here += n as i64;
            return Ok(n);
        }
        let mut done = 0;
        while done < bytes.len() {
            done += self.window.put(&bytes[done..]);
            if done < bytes.len() {
                self.flush_local()?;
                if self.window.room() == 0 {
                    self.status.error = true;
                    return Err(StreamError::io("write", io::ErrorKind::WriteZero.into()));
                }
            }
        }
        Ok(done)
    }

    /// Write out pending bytes of a write-mode stream.
    pub fn flush_local(&mut self) -> Result<()> {
        if self.direction != Direction::Write || self.caps.string || self.window.next() == 0 {
            return Ok(());
        }
        let fd = self.require_fd()?;
        while self.window.next() > 0 {
            match self.engine.io().write(fd, self.window.pending()) {
                Ok(0) => {
                    self.status.error = true;
                    return Err(StreamError::io("flush", io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    self.window.mark_flushed(n);
                    self.here += n as i64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.status.error = true;
                    return Err(StreamError::io("flush", e));
                }
            }
        }
        Ok(())
    }

    /// Refill an exhausted read window from the descriptor.
    pub(crate) fn fill(&mut self) -> Result<usize> {
        let fd = self.require_fd()?;
        if self.window.is_unbuffered() {
            let tiny = self.engine.tiny_grant()?;
            self.window.replace(tiny);
        }
        let n = loop {
            match self.engine.io().read(fd, self.window.raw_mut()) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.status.error = true;
                    return Err(StreamError::io("read", e));
                }
            }
        };
        self.window.set_read_window(n);
        self.window.settle(Direction::Read);
        self.here += n as i64;
        if n == 0 {
            self.status.eof = true;
        }
        Ok(n)
    }

    /// Synchronize with the descriptor: flush a write stream, or move the
    /// descriptor back to the logical read position of a seekable read
    /// stream and mark its buffered bytes as possibly stale.
    pub fn sync_local(&mut self) -> Result<()> {
        if self.bits.init || self.caps.string {
            return Ok(());
        }
        match self.direction {
            Direction::Write => self.flush_local(),
            Direction::Read => {
                if self.extent.is_none() || self.bits.synced {
                    return Ok(());
                }
                let fd = self.require_fd()?;
                let pos = self.here - self.window.unread() as i64;
                self.engine
                    .io()
                    .seek(fd, pos, crate::backend::Whence::Set)
                    .map_err(|e| StreamError::io("seek", e))?;
                self.here = pos;
                self.bits.synced = true;
                Ok(())
            }
        }
    }

    /// Drop the buffer: afterwards every write goes straight to the
    /// descriptor and write room is zero.
    pub fn set_unbuffered_local(&mut self) -> Result<()> {
        if self.window.is_unbuffered() {
            return Ok(());
        }
        self.flush_local()?;
        if self.direction == Direction::Read {
            self.rewind_unread()?;
        }
        self.release_mapping()?;
        self.window.replace(BufferGrant::unbuffered());
        self.window.settle(self.direction);
        Ok(())
    }

    /// Seek a seekable read stream back over its unread bytes and drop them.
    pub(crate) fn rewind_unread(&mut self) -> Result<()> {
        let unread = self.window.unread();
        if unread > 0 && self.extent.is_some() {
            let fd = self.require_fd()?;
            let pos = self.here - unread as i64;
            self.engine
                .io()
                .seek(fd, pos, crate::backend::Whence::Set)
                .map_err(|e| StreamError::io("seek", e))?;
            self.here = pos;
        }
        self.window.discard_unread();
        Ok(())
    }

    /// Unmap a mapped window; the window itself is left for the caller to
    /// replace.
    pub(crate) fn release_mapping(&mut self) -> Result<()> {
        if !self.window.is_mapped() {
            return Ok(());
        }
        if let Some(fd) = self.fd {
            self.engine
                .io()
                .unmap(fd, self.window.size())
                .map_err(|e| StreamError::io("unmap", e))?;
        }
        Ok(())
    }

    /// Flush, close the descriptor, reap an attached coprocess, and leave the
    /// pool. The first failure is reported after all steps ran.
    pub fn close_local(&mut self) -> Result<Option<ExitStatus>> {
        if self.bits.closed {
            return Ok(None);
        }
        let mut first_err = self.flush_local().err();
        if let Some(fd) = self.fd.take()
            && let Err(e) = self.engine.io().close(fd)
        {
            first_err.get_or_insert(StreamError::io("close", e));
        }
        let status = self.detach_coprocess();
        if let Some(pool) = self.pool.take() {
            pool.remove(self.id());
        }
        self.key.set_awaiting_head(false);
        self.reserve = None;
        self.window.replace(BufferGrant::unbuffered());
        self.bits.closed = true;
        match first_err {
            Some(e) => Err(e),
            None => Ok(status),
        }
    }
}

pub(crate) fn write_all(io: &dyn crate::backend::LowLevelIo, fd: i32, bytes: &[u8]) -> Result<usize> {
    let mut done = 0;
    while done < bytes.len() {
        match io.write(fd, &bytes[done..]) {
            Ok(0) => return Err(StreamError::io("write", io::ErrorKind::WriteZero.into())),
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(StreamError::io("write", e)),
        }
    }
    Ok(done)
}

// ---------------------------------------------------------------------------
// Stream handle
// ---------------------------------------------------------------------------

/// Caller-owned stream handle. Pools hold only weak references to it.
pub struct Stream {
    key: Arc<StreamKey>,
    state: Mutex<StreamState>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.key.id()).finish()
    }
}

/// A stream dropped without [`Stream::close`] flushes what it can and leaves
/// its pool. The descriptor stays open and a coprocess is not reaped.
impl Drop for Stream {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Err(e) = state.flush_local() {
            log::debug!("{}: flush on drop failed: {e}", state.id());
        }
        if let Some(pool) = state.pool.take() {
            pool.remove(state.id());
        }
    }
}

impl Stream {
    pub(crate) fn create(
        engine: &Arc<Engine>,
        caps: Capabilities,
        fd: Option<i32>,
        window: Window,
        extent: Option<i64>,
    ) -> Arc<Self> {
        let key = Arc::new(StreamKey::new(engine.allocate_id()));
        let direction = if caps.readable {
            Direction::Read
        } else {
            Direction::Write
        };
        Arc::new_cyclic(|this| Self {
            key: Arc::clone(&key),
            state: Mutex::new(StreamState {
                key,
                this: this.clone(),
                engine: Arc::clone(engine),
                caps,
                fd,
                direction,
                bits: ModeBits {
                    init: true,
                    ..ModeBits::default()
                },
                status: StatusFlags::default(),
                window,
                extent,
                here: 0,
                size_hint: None,
                pool: None,
                coproc: None,
                reserve: None,
                discipline: None,
                held_back: None,
                ngetr: 0,
            }),
        })
    }

    pub fn id(&self) -> StreamId {
        self.key.id()
    }

    pub fn key(&self) -> &Arc<StreamKey> {
        &self.key
    }

    /// Acquire the stream lock, blocking while another thread holds it.
    pub fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, StreamState>> {
        self.state.try_lock()
    }

    /// Make the stream ready for `wanted`, taking the stream lock.
    pub fn request_mode(&self, wanted: Wanted) -> Result<()> {
        self.lock().request_mode(wanted)
    }

    pub fn read(&self, out: &mut [u8]) -> Result<usize> {
        self.lock().read(out)
    }

    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        self.lock().write(bytes)
    }

    pub fn flush(&self) -> Result<()> {
        self.lock().flush_local()
    }

    pub fn sync(&self) -> Result<()> {
        self.lock().sync_local()
    }

    pub fn set_unbuffered(&self) -> Result<()> {
        self.lock().set_unbuffered_local()
    }

    /// Run `f` over a reserve buffer of at least `size` bytes.
    pub fn with_reserve<R>(&self, size: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut state = self.lock();
        let buf = state.reserve(size)?;
        Ok(f(buf))
    }

    pub fn attach_coprocess(&self, fd: Option<i32>, pid: Option<i32>, is_std: bool) -> Result<()> {
        self.lock().attach_coprocess(fd, pid, is_std)
    }

    pub fn detach_coprocess(&self) -> Option<ExitStatus> {
        self.lock().detach_coprocess()
    }

    pub fn set_discipline(&self, discipline: Option<Arc<dyn Discipline>>) {
        self.lock().set_discipline(discipline);
    }

    pub fn join_pool(&self, pool: &Arc<Pool>) -> Result<()> {
        self.lock().join_pool(pool)
    }

    pub fn close(&self) -> Result<Option<ExitStatus>> {
        self.lock().close_local()
    }

    /// Kind of buffer currently backing the stream.
    pub fn buffer_kind(&self) -> BufferKind {
        self.lock().window.kind()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
