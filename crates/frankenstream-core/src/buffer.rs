//! Stream buffer window.
//!
//! One owned byte buffer with four logical offsets instead of raw pointers:
//! - `next`: read/write cursor.
//! - `endb`: end of valid data (read mode) or end of the buffer (write mode).
//! - `endr`: limit for fast-path reads, equal to `endb` only in read mode.
//! - `endw`: limit for fast-path writes, equal to `endb` only in write mode.
//!
//! Invariants, checked at every mutation:
//! - `next <= endb <= data.len()`
//! - `endr <= endb` and `endw <= endb`

use std::fmt;

use crate::stream::Direction;

/// Where the window's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// No buffer at all; every write goes straight to the descriptor.
    Unbuffered,
    /// Allocated by the engine's sizing policy.
    Owned,
    /// Supplied by the caller (string streams).
    External,
    /// A memory-mapped region handed out by the sizing policy.
    Mapped,
    /// The small inline fallback buffer.
    Tiny,
}

/// Buffer granted by a [`BufferSizer`](crate::backend::BufferSizer).
#[derive(Debug)]
pub struct BufferGrant {
    pub data: Vec<u8>,
    pub kind: BufferKind,
}

impl BufferGrant {
    /// A zero-sized grant: the stream runs unbuffered.
    #[must_use]
    pub fn unbuffered() -> Self {
        Self {
            data: Vec::new(),
            kind: BufferKind::Unbuffered,
        }
    }
}

/// The buffer window of a single stream.
pub struct Window {
    data: Vec<u8>,
    kind: BufferKind,
    next: usize,
    endb: usize,
    endr: usize,
    endw: usize,
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("kind", &self.kind)
            .field("size", &self.data.len())
            .field("next", &self.next)
            .field("endb", &self.endb)
            .field("endr", &self.endr)
            .field("endw", &self.endw)
            .finish()
    }
}

impl Window {
    /// A window with no buffer.
    #[must_use]
    pub fn unbuffered() -> Self {
        Self::from_grant(BufferGrant::unbuffered())
    }

    /// Wrap a granted buffer; all offsets start at zero.
    #[must_use]
    pub fn from_grant(grant: BufferGrant) -> Self {
        let kind = if grant.data.is_empty() {
            BufferKind::Unbuffered
        } else {
            grant.kind
        };
        Self {
            data: grant.data,
            kind,
            next: 0,
            endb: 0,
            endr: 0,
            endw: 0,
        }
    }

    /// Swap in a new buffer, returning the old one. Offsets are reset.
    pub fn replace(&mut self, grant: BufferGrant) -> BufferGrant {
        let old = std::mem::replace(self, Self::from_grant(grant));
        BufferGrant {
            data: old.data,
            kind: old.kind,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Allocated window size.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_unbuffered(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_mapped(&self) -> bool {
        self.kind == BufferKind::Mapped
    }

    pub fn is_tiny(&self) -> bool {
        self.kind == BufferKind::Tiny
    }

    pub fn next(&self) -> usize {
        self.next
    }

    pub fn endb(&self) -> usize {
        self.endb
    }

    pub fn endr(&self) -> usize {
        self.endr
    }

    pub fn endw(&self) -> usize {
        self.endw
    }

    /// Bytes buffered but not yet consumed (read mode).
    pub fn unread(&self) -> usize {
        self.endb - self.next
    }

    /// Unread bytes as a slice.
    pub fn unread_bytes(&self) -> &[u8] {
        &self.data[self.next..self.endb]
    }

    /// Bytes written into the buffer but not yet flushed (write mode).
    pub fn pending(&self) -> &[u8] {
        &self.data[..self.next]
    }

    /// Bytes a writer may still copy in before a flush is required.
    pub fn room(&self) -> usize {
        self.endw.saturating_sub(self.next)
    }

    /// The whole valid window `[0, endb)`.
    pub fn window(&self) -> &[u8] {
        &self.data[..self.endb]
    }

    /// The entire allocation, for callers that fill it directly.
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    // -----------------------------------------------------------------------
    // Offset updates
    // -----------------------------------------------------------------------

    /// Empty the window: every offset back to the buffer start.
    pub fn reset(&mut self) {
        self.next = 0;
        self.endb = 0;
        self.endr = 0;
        self.endw = 0;
    }

    /// Mark `[0, len)` as valid read data with the cursor at the start.
    pub fn set_read_window(&mut self, len: usize) {
        self.next = 0;
        self.endb = len.min(self.data.len());
        self.endr = 0;
        self.endw = 0;
        self.check();
    }

    /// Open the whole buffer for writing with the cursor at the start.
    pub fn set_write_window(&mut self) {
        self.next = 0;
        self.endb = self.data.len();
        self.endr = 0;
        self.endw = 0;
        self.check();
    }

    /// Move the end of valid data, keeping the cursor within it.
    pub fn set_endb(&mut self, endb: usize) {
        self.endb = endb.min(self.data.len());
        self.next = self.next.min(self.endb);
        self.endr = self.endr.min(self.endb);
        self.endw = self.endw.min(self.endb);
        self.check();
    }

    /// Move the cursor, clamped to the valid data.
    pub fn set_next(&mut self, next: usize) {
        self.next = next.min(self.endb);
        self.check();
    }

    /// Drop unread bytes: the window becomes empty at the current cursor.
    pub fn discard_unread(&mut self) {
        self.endb = self.next;
        self.endr = self.endr.min(self.endb);
        self.endw = self.endw.min(self.endb);
        self.check();
    }

    /// Recompute the fast-path limits for the direction now in effect.
    pub fn settle(&mut self, direction: Direction) {
        self.endr = if direction == Direction::Read {
            self.endb
        } else {
            0
        };
        self.endw = if direction == Direction::Write {
            self.endb
        } else {
            0
        };
        self.check();
    }

    // -----------------------------------------------------------------------
    // Data movement
    // -----------------------------------------------------------------------

    /// Copy out up to `out.len()` unread bytes, advancing the cursor.
    pub fn take(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.unread());
        out[..n].copy_from_slice(&self.data[self.next..self.next + n]);
        self.next += n;
        n
    }

    /// Copy `bytes` into the write room, advancing the cursor.
    pub fn put(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.room());
        self.data[self.next..self.next + n].copy_from_slice(&bytes[..n]);
        self.next += n;
        n
    }

    /// Drop the first `n` pending bytes after they reached the descriptor.
    pub fn mark_flushed(&mut self, n: usize) {
        let n = n.min(self.next);
        self.data.copy_within(n..self.next, 0);
        self.next -= n;
    }

    /// Copy `bytes` to the buffer start as fresh read data. Returns how many
    /// fit; the rest is dropped.
    pub fn load(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.set_read_window(n);
        n
    }

    /// Put a held-back byte back in front of the cursor.
    pub fn restore_before_cursor(&mut self, byte: u8) -> bool {
        if self.next == 0 {
            return false;
        }
        self.data[self.next - 1] = byte;
        true
    }

    fn check(&self) {
        debug_assert!(self.next <= self.endb, "cursor past valid data: {self:?}");
        debug_assert!(self.endb <= self.data.len(), "endb past buffer: {self:?}");
        debug_assert!(self.endr <= self.endb, "read limit past endb: {self:?}");
        debug_assert!(self.endw <= self.endb, "write limit past endb: {self:?}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
