//! Per-stream reserve buffer.
//!
//! Scratch space for callers that need a contiguous region larger than the
//! stream window, e.g. a record spanning two refills. It only grows, in
//! multiples of the configured grain.

use crate::error::{Result, StreamError};
use crate::stream::StreamState;

/// Growable scratch buffer owned by one stream.
#[derive(Debug, Default)]
pub struct ReserveBuffer {
    data: Vec<u8>,
    /// Bytes the current holder marked valid.
    slen: usize,
}

impl ReserveBuffer {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Valid-data marker; reset by every [`ReserveBuffer::ensure`].
    pub fn len(&self) -> usize {
        self.slen
    }

    pub fn is_empty(&self) -> bool {
        self.slen == 0
    }

    pub fn set_len(&mut self, n: usize) {
        self.slen = n.min(self.data.len());
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.slen]
    }

    /// Make `slot` hold at least `size` bytes rounded up to `grain`. A larger
    /// replacement inherits the valid prefix of the old buffer. The valid
    /// marker is reset either way.
    pub fn ensure(slot: &mut Option<Self>, size: usize, grain: usize) -> Result<&mut [u8]> {
        let grain = grain.max(1);
        let rounded = size.div_ceil(grain).saturating_mul(grain);
        if slot.as_ref().is_none_or(|old| rounded > old.size()) {
            let mut data = Vec::new();
            data.try_reserve_exact(rounded)
                .map_err(|_| StreamError::exhausted("reserve buffer", rounded))?;
            data.resize(rounded, 0);
            if let Some(old) = slot.as_ref() {
                data[..old.slen].copy_from_slice(old.payload());
            }
            *slot = Some(Self { data, slen: 0 });
        }
        let buf = slot.get_or_insert_with(Self::default);
        buf.slen = 0;
        Ok(&mut buf.data)
    }
}

impl StreamState {
    /// Reserve at least `size` bytes of scratch space for this stream.
    pub fn reserve(&mut self, size: usize) -> Result<&mut [u8]> {
        let grain = self.engine.config().grain;
        ReserveBuffer::ensure(&mut self.reserve, size, grain)
    }
}
