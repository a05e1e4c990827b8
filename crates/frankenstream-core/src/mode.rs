//! The mode state machine.
//!
//! Every read or write first asks for a mode. A request runs these steps in
//! order, stopping at the first failure:
//!
//! 1. With `synced`, drop read data buffered before an external sync.
//! 2. A frozen stream is handed to its discipline, or the request fails.
//! 3. A held-back separator byte is put back in the window.
//! 4. A stream flagged by its pool is promoted to the pool head.
//! 5. The stream is locked for the rest of the request.
//! 6. The first request sizes the buffer.
//! 7. A request for the current direction returns.
//! 8. Otherwise the stream switches direction.
//!
//! Failures leave direction and buffered bytes as they were, raise the
//! engine's [`Notify`](crate::disc::Notify) hook and return an error.

use crate::backend::{SizeRequest, Whence};
use crate::buffer::{BufferGrant, Window};
use crate::disc::Event;
use crate::errno;
use crate::error::{Result, StreamError};
use crate::stream::{Direction, Phase, StreamState, Wanted};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// The caller took the stream lock just for this request.
    Public,
    /// The caller already runs under the stream lock.
    Local,
}

impl StreamState {
    /// Make the stream ready for `wanted`.
    pub fn request_mode(&mut self, wanted: Wanted) -> Result<()> {
        self.transition(wanted, Entry::Public)
    }

    /// Like [`request_mode`](Self::request_mode), for code already running
    /// inside a locked operation on this stream (disciplines, the exit
    /// flusher). Freeze bits are ignored and the lock bit is left alone.
    pub fn request_mode_local(&mut self, wanted: Wanted) -> Result<()> {
        self.transition(wanted, Entry::Local)
    }

    fn transition(&mut self, wanted: Wanted, entry: Entry) -> Result<()> {
        if wanted.synced && self.phase() == Phase::ReadSynced {
            self.window.reset();
            self.bits.synced = false;
        }

        if self.blocked(entry) {
            match self.resolve_blocked(entry) {
                Ok(()) => {}
                Err(e @ StreamError::Aborted(_)) => return Err(e),
                Err(e) => return self.fail(wanted.direction, e),
            }
        }

        if self.bits.getr
            && let Err(e) = self.restore_held_back()
        {
            return self.fail(wanted.direction, e);
        }

        if self.key.awaiting_head()
            && let Err(e) = self.promote()
        {
            return self.fail(wanted.direction, e);
        }

        if entry == Entry::Public {
            self.bits.lock = true;
        }
        let before = self.phase();
        let result = self.switch(wanted.direction);
        if entry == Entry::Public {
            self.bits.lock = false;
        }
        match result {
            Ok(()) => {
                self.window.settle(self.direction);
                if before != self.phase() {
                    log::trace!("{}: {before:?} -> {:?}", self.id(), self.phase());
                }
                Ok(())
            }
            Err(e) => self.fail(wanted.direction, e),
        }
    }

    fn blocked(&self, entry: Entry) -> bool {
        (entry == Entry::Public && self.is_frozen()) || self.is_detached()
    }

    fn resolve_blocked(&mut self, entry: Entry) -> Result<()> {
        let refusal = if self.is_detached() {
            StreamError::Closed
        } else {
            StreamError::Blocked
        };
        let Some(discipline) = self.discipline.clone() else {
            return Err(refusal);
        };
        if entry == Entry::Local {
            return Err(refusal);
        }
        loop {
            let rv = discipline.exception(self, Event::Locked);
            if rv < 0 {
                log::debug!("{}: discipline aborted mode request with {rv}", self.id());
                return Err(StreamError::Aborted(rv));
            }
            if !self.blocked(entry) {
                return Ok(());
            }
            if rv == 0 {
                return Err(if self.is_detached() {
                    StreamError::Closed
                } else {
                    StreamError::Blocked
                });
            }
        }
    }

    fn restore_held_back(&mut self) -> Result<()> {
        self.bits.getr = false;
        if let Some(byte) = self.held_back.take()
            && !self.window.restore_before_cursor(byte)
        {
            log::debug!("{}: held-back byte {byte:#04x} dropped, cursor at window start", self.id());
        }
        if self.window.is_mapped() {
            self.ngetr += 1;
            if self.ngetr >= self.engine.config().getr_threshold() {
                log::debug!("{}: too many held-back restores, leaving mapped mode", self.id());
                self.fall_back_to_tiny()?;
                self.ngetr = 0;
            }
        }
        Ok(())
    }

    /// Replace a mapped window with the inline buffer, giving the descriptor
    /// back the bytes not yet consumed.
    fn fall_back_to_tiny(&mut self) -> Result<()> {
        match self.direction {
            Direction::Read => {
                let tiny = self.engine.tiny_grant()?;
                self.rewind_unread()?;
                self.release_mapping()?;
                self.window.replace(tiny);
            }
            Direction::Write => {
                // The inline buffer has no write room; writers go straight out.
                self.flush_local()?;
                self.release_mapping()?;
                self.window.replace(BufferGrant::unbuffered());
            }
        }
        Ok(())
    }

    fn promote(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.clone() {
            pool.promote_to_head(self.id(), self.engine.mover())?;
        }
        self.key.set_awaiting_head(false);
        Ok(())
    }

    fn switch(&mut self, wanted: Option<Direction>) -> Result<()> {
        if self.bits.init {
            if self.pool.is_none() {
                let engine = std::sync::Arc::clone(&self.engine);
                engine.register(self, None)?;
            }
            let Some(dir) = wanted else {
                return Ok(());
            };
            if !self.caps.supports(dir) {
                return Err(self.mismatch(dir));
            }
            self.init_buffer()?;
        }

        match (self.phase(), wanted) {
            (Phase::Write, Some(Direction::Read)) => self.write_to_read(),
            (Phase::ReadSynced, w) if w != Some(Direction::Write) => self.resync(),
            (Phase::Read | Phase::ReadSynced, Some(Direction::Write)) => self.read_to_write(),
            _ => Ok(()),
        }
    }

    fn mismatch(&self, wanted: Direction) -> StreamError {
        StreamError::CapabilityMismatch {
            wanted,
            readable: self.caps.readable,
            writable: self.caps.writable,
        }
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    fn init_buffer(&mut self) -> Result<()> {
        if self.caps.string {
            self.here = 0;
            let len = self.extent.unwrap_or(0).max(0) as usize;
            match self.direction {
                Direction::Read => self.window.set_read_window(len),
                Direction::Write => self.window.set_write_window(),
            }
            self.bits.init = false;
            return Ok(());
        }

        let fd = self.require_fd()?;
        let io = self.engine.io();
        let seekable = match io.seek(fd, 0, Whence::Current) {
            Ok(pos) => {
                let end = io.seek(fd, 0, Whence::End).map_err(|e| StreamError::io("seek", e))?;
                io.seek(fd, pos, Whence::Set).map_err(|e| StreamError::io("seek", e))?;
                self.here = pos;
                self.extent = Some(end);
                true
            }
            Err(_) => {
                self.here = 0;
                self.extent = None;
                false
            }
        };

        let request = SizeRequest {
            fd: Some(fd),
            readable: self.caps.readable,
            writable: self.caps.writable,
            seekable,
            hint: self.size_hint,
            default_size: self.engine.config().buffer_size,
            exiting: self.engine.is_exiting(),
        };
        let grant = self.engine.sizer().size_for(&request).map_err(|e| {
            if e.kind() == std::io::ErrorKind::OutOfMemory {
                StreamError::exhausted("stream buffer", request.hint.unwrap_or(request.default_size))
            } else {
                StreamError::io("size", e)
            }
        })?;
        self.window = Window::from_grant(grant);
        match self.direction {
            Direction::Read => self.window.reset(),
            Direction::Write => self.window.set_write_window(),
        }
        self.bits.init = false;
        log::debug!(
            "{}: initialized {:?} buffer of {} bytes (seekable={seekable})",
            self.id(),
            self.window.kind(),
            self.window.size()
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn write_to_read(&mut self) -> Result<()> {
        if !self.caps.readable {
            return Err(self.mismatch(Direction::Read));
        }

        if self.caps.string {
            // The write cursor may have extended the content.
            let s = self.window.next() as i64;
            if s > self.here {
                self.here = s;
                if self.extent.is_none_or(|e| s > e) {
                    self.extent = Some(s);
                }
            }
            let end = self.extent.unwrap_or(0).max(0) as usize;
            self.window.set_endb(end);
            self.direction = Direction::Read;
            self.bits.synced = false;
            return Ok(());
        }

        if self.window.next() > 0 {
            self.flush_local()?;
        }
        if self.window.is_unbuffered() {
            let tiny = self.engine.tiny_grant()?;
            self.window.replace(tiny);
        }
        self.window.reset();
        self.direction = Direction::Read;
        self.bits.synced = false;
        self.save_or_restore(Direction::Read)
    }

    fn resync(&mut self) -> Result<()> {
        let fd = self.require_fd()?;
        if self.caps.shared && self.caps.public {
            let addr = self
                .engine
                .io()
                .seek(fd, 0, Whence::Current)
                .map_err(|e| StreamError::io("seek", e))?;
            if addr != self.here {
                log::debug!("{}: descriptor moved {} -> {addr}, dropping buffer", self.id(), self.here);
                if self.window.is_mapped() {
                    self.release_mapping()?;
                    self.window.replace(BufferGrant::unbuffered());
                }
                self.window.reset();
                self.here = addr;
                self.bits.synced = false;
                return Ok(());
            }
        }
        let addr = self.here + self.window.unread() as i64;
        self.engine
            .io()
            .seek(fd, addr, Whence::Set)
            .map_err(|e| StreamError::io("seek", e))?;
        self.here = addr;
        self.bits.synced = false;
        Ok(())
    }

    fn read_to_write(&mut self) -> Result<()> {
        if !self.caps.writable {
            return Err(self.mismatch(Direction::Write));
        }

        if self.caps.string {
            let size = self.window.size();
            self.window.set_endb(size);
            self.direction = Direction::Write;
            self.bits.synced = false;
            return Ok(());
        }

        // Everything fallible happens before any state changes.
        let unread = self.window.unread();
        let saving = self.coproc.is_some();
        if let Some(cp) = self.coproc.as_mut() {
            cp.reserve_save(unread)?;
        }
        let rollback = if saving { 0 } else { unread };
        if !self.bits.synced && self.extent.is_some() && (rollback > 0 || self.window.is_mapped()) {
            let fd = self.require_fd()?;
            let addr = self.here - rollback as i64;
            self.engine
                .io()
                .seek(fd, addr, Whence::Set)
                .map_err(|e| StreamError::io("seek", e))?;
            self.here = addr;
            if !saving {
                self.window.discard_unread();
            }
        }
        // The window keeps its bytes until it is replaced, so the save below
        // still sees them after the unmap.
        if let Err(e) = self.release_mapping() {
            self.window.discard_unread();
            return Err(e);
        }
        self.save_or_restore(Direction::Write)?;
        if self.window.is_mapped() {
            self.window.replace(BufferGrant::unbuffered());
        }

        self.direction = Direction::Write;
        self.bits.synced = false;
        if self.window.is_tiny() {
            self.window.replace(BufferGrant::unbuffered());
        } else {
            self.window.set_write_window();
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Failure
    // -----------------------------------------------------------------------

    fn fail(&mut self, wanted: Option<Direction>, err: StreamError) -> Result<()> {
        let wanted = wanted.unwrap_or(if self.caps.readable {
            Direction::Read
        } else {
            Direction::Write
        });
        if matches!(err, StreamError::CapabilityMismatch { .. }) && self.fd.is_some() {
            errno::set_errno(errno::EBADF);
        }
        log::debug!("{}: {wanted:?} request failed in {:?}: {err}", self.id(), self.phase());
        if let Some(notifier) = self.engine.notifier() {
            notifier.mode_failed(self.id(), wanted, self.fd);
        }
        Err(err)
    }
}
