//! Coprocess streams.
//!
//! A coprocess stream talks to a child over two descriptors: the active one
//! and an alternate the stream swaps in when it changes direction. Read-ahead
//! bytes still in the window when the stream turns to writing are saved and
//! handed back when it turns to reading again.

use std::io;

use crate::errno;
use crate::error::{Result, StreamError};
use crate::process;
use crate::sigpipe::SigpipeGuard;
use crate::stream::{Direction, StreamState};

/// How a reaped coprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
    /// The wait failed for a reason other than interruption.
    WaitFailed,
}

impl ExitStatus {
    /// Decode a raw wait status.
    #[must_use]
    pub const fn from_wait_status(status: i32) -> Self {
        if process::wifsignaled(status) {
            Self::Signaled(process::wtermsig(status))
        } else {
            Self::Exited(process::wexitstatus(status))
        }
    }

    /// Shell-style encoding: the exit code, `0x100 | signal` for a signal
    /// death, or 255 when the wait failed.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Exited(code) => code & 0xff,
            Self::Signaled(sig) => 0x100 | sig,
            Self::WaitFailed => 255,
        }
    }

    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

/// Per-stream coprocess record.
#[derive(Debug)]
pub struct Coprocess {
    /// `None` for a stream that only pairs descriptors.
    pid: Option<i32>,
    /// Alternate descriptor, swapped with the active one on a switch.
    file: Option<i32>,
    saved: Vec<u8>,
    ndata: usize,
    sigpipe: Option<SigpipeGuard>,
}

impl Coprocess {
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn alternate_fd(&self) -> Option<i32> {
        self.file
    }

    /// Saved read-ahead bytes awaiting the next switch back to read mode.
    pub fn saved(&self) -> &[u8] {
        &self.saved[..self.ndata]
    }

    pub fn saved_capacity(&self) -> usize {
        self.saved.len()
    }

    pub fn suppresses_sigpipe(&self) -> bool {
        self.sigpipe.is_some()
    }

    /// Make room for `n` saved bytes. The old contents are not kept.
    pub(crate) fn reserve_save(&mut self, n: usize) -> Result<()> {
        if n <= self.saved.len() {
            return Ok(());
        }
        let mut fresh = Vec::new();
        fresh
            .try_reserve_exact(n)
            .map_err(|_| StreamError::exhausted("coprocess save buffer", n))?;
        fresh.resize(n, 0);
        self.saved = fresh;
        Ok(())
    }

    /// Copy `bytes` into the save area reserved by [`Self::reserve_save`].
    pub(crate) fn commit_save(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.saved.len());
        self.saved[..n].copy_from_slice(&bytes[..n]);
        self.ndata = n;
    }

    /// Exchange the active descriptor with the alternate. Only a real
    /// coprocess has a second descriptor to swap in.
    pub(crate) fn swap_descriptor(&mut self, active: &mut Option<i32>) {
        if self.pid.is_some() {
            std::mem::swap(active, &mut self.file);
        }
    }
}

impl StreamState {
    /// Pair the stream with a child process reached through `fd`. Does
    /// nothing if a coprocess is already attached.
    pub fn attach_coprocess(&mut self, fd: Option<i32>, pid: Option<i32>, is_std: bool) -> Result<()> {
        if self.coproc.is_some() {
            return Ok(());
        }
        let sigpipe = (pid.is_some() && !is_std && self.caps.writable)
            .then(|| self.engine.sigpipe().acquire());
        log::debug!(
            "{}: coprocess attached pid={pid:?} alt_fd={fd:?} sigpipe={}",
            self.id(),
            sigpipe.is_some()
        );
        self.coproc = Some(Coprocess {
            pid,
            file: fd,
            saved: Vec::new(),
            ndata: 0,
            sigpipe,
        });
        Ok(())
    }

    /// Preserve or restore read-ahead across a direction change, swapping in
    /// the descriptor for the new direction.
    ///
    /// Turning to `Write` saves the window's unread bytes and empties the
    /// window. Turning to `Read` loads saved bytes back, truncated to the
    /// window size.
    pub fn save_or_restore(&mut self, to: Direction) -> Result<()> {
        let Some(cp) = self.coproc.as_mut() else {
            return Ok(());
        };
        match to {
            Direction::Write => {
                let unread = self.window.unread_bytes();
                cp.reserve_save(unread.len())?;
                cp.commit_save(unread);
                self.window.discard_unread();
                cp.swap_descriptor(&mut self.fd);
            }
            Direction::Read => {
                cp.swap_descriptor(&mut self.fd);
                if cp.ndata > 0 {
                    let kept = self.window.load(&cp.saved[..cp.ndata]);
                    if kept < cp.ndata {
                        log::warn!(
                            "{}: coprocess read-ahead truncated {} -> {kept} bytes",
                            self.key.id(),
                            cp.ndata
                        );
                    }
                    cp.ndata = 0;
                }
            }
        }
        Ok(())
    }

    /// Detach the coprocess: close both pipe ends, reap the child, then drop
    /// SIGPIPE suppression. Pending output is flushed first. The stream is
    /// left without a descriptor. A descriptor-only pairing reports
    /// `Exited(0)` and keeps its descriptor. Returns `None` if nothing was
    /// attached.
    pub fn detach_coprocess(&mut self) -> Option<ExitStatus> {
        let pid = self.coproc.as_ref()?.pid;
        let Some(pid) = pid else {
            self.coproc = None;
            return Some(ExitStatus::Exited(0));
        };
        if let Err(e) = self.flush_local() {
            log::debug!("{}: flush before detach failed: {e}", self.key.id());
        }
        let mut cp = self.coproc.take()?;
        // A child reading its input sees EOF only once our write end closes.
        for fd in [cp.file.take(), self.fd.take()].into_iter().flatten() {
            if let Err(e) = self.engine.io().close(fd) {
                log::debug!("{}: closing coprocess fd {fd}: {e}", self.key.id());
            }
        }
        let status = loop {
            match self.engine.reaper().wait(pid) {
                Ok(raw) => break ExitStatus::from_wait_status(raw),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("{}: wait for pid {pid} failed: {e}", self.key.id());
                    errno::set_errno(e.raw_os_error().unwrap_or(errno::ECHILD));
                    break ExitStatus::WaitFailed;
                }
            }
        };
        drop(cp.sigpipe.take());
        log::debug!("{}: coprocess {pid} reaped: {status:?}", self.key.id());
        Some(status)
    }
}
