//! Stream pools.
//!
//! A pool is an ordered group of streams sharing one underlying resource; its
//! head is the stream currently allowed to use it. Entries hold weak
//! references: the caller owns the stream, the pool only finds it.
//!
//! The slot array starts empty, takes [`INLINE_SLOTS`] on first use and then
//! grows by `max(4, capacity / 4)`. Appends always land at the end, so a walk
//! that re-reads the length between items sees streams added mid-walk.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::PoolMover;
use crate::error::{Result, StreamError};
use crate::stream::{Stream, StreamId, StreamKey};

/// Slots reserved by the first append.
pub const INLINE_SLOTS: usize = 3;

/// Engine-unique pool identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub usize);

/// One pool member.
#[derive(Clone)]
pub struct PoolEntry {
    key: Arc<StreamKey>,
    stream: Weak<Stream>,
}

impl PoolEntry {
    pub fn id(&self) -> StreamId {
        self.key.id()
    }

    pub fn key(&self) -> &Arc<StreamKey> {
        &self.key
    }

    /// The stream, if its owner still holds it.
    pub fn stream(&self) -> Option<Arc<Stream>> {
        self.stream.upgrade()
    }
}

impl fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.key.id())
            .field("alive", &(self.stream.strong_count() > 0))
            .finish()
    }
}

#[derive(Debug, Default)]
struct Slots {
    entries: Vec<PoolEntry>,
    capacity: usize,
}

/// Growth step for a slot array of `capacity`.
#[must_use]
pub const fn grown_capacity(capacity: usize) -> usize {
    if capacity == 0 {
        INLINE_SLOTS
    } else {
        let quarter = capacity / 4;
        capacity + if quarter > 4 { quarter } else { 4 }
    }
}

/// An ordered group of streams.
pub struct Pool {
    id: PoolId,
    slots: Mutex<Slots>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("len", &slots.entries.len())
            .field("capacity", &slots.capacity)
            .finish()
    }
}

impl Pool {
    pub(crate) fn new(id: PoolId) -> Self {
        Self {
            id,
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots available before the next growth.
    pub fn capacity(&self) -> usize {
        self.slots.lock().capacity
    }

    /// Append a stream at the end, growing the slot array if it is full.
    pub fn append(&self, key: Arc<StreamKey>, stream: Weak<Stream>) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots.entries.len() >= slots.capacity {
            let target = grown_capacity(slots.capacity);
            let extra = target - slots.entries.len();
            slots
                .entries
                .try_reserve_exact(extra)
                .map_err(|_| StreamError::exhausted("pool slots", target))?;
            log::debug!("pool {:?} grows {} -> {target} slots", self.id, slots.capacity);
            slots.capacity = target;
        }
        slots.entries.push(PoolEntry { key, stream });
        Ok(())
    }

    /// Remove a stream, closing the gap. Returns false if it was not a member.
    pub fn remove(&self, id: StreamId) -> bool {
        let mut slots = self.slots.lock();
        match slots.entries.iter().position(|e| e.id() == id) {
            Some(i) => {
                slots.entries.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.position(id).is_some()
    }

    pub fn position(&self, id: StreamId) -> Option<usize> {
        self.slots.lock().entries.iter().position(|e| e.id() == id)
    }

    pub fn head(&self) -> Option<StreamId> {
        self.slots.lock().entries.first().map(PoolEntry::id)
    }

    pub fn is_head(&self, id: StreamId) -> bool {
        self.head() == Some(id)
    }

    /// Member ids in pool order.
    pub fn order(&self) -> Vec<StreamId> {
        self.slots.lock().entries.iter().map(PoolEntry::id).collect()
    }

    /// The entry at `index`, if the pool is still that long.
    pub fn entry_at(&self, index: usize) -> Option<PoolEntry> {
        self.slots.lock().entries.get(index).cloned()
    }

    /// Visit every live member. The pool lock is released between visits, so
    /// `f` may lock the stream and may append to this pool.
    pub fn walk(&self, mut f: impl FnMut(&Arc<Stream>)) {
        let mut index = 0;
        while let Some(entry) = self.entry_at(index) {
            if let Some(stream) = entry.stream() {
                f(&stream);
            }
            index += 1;
        }
    }

    /// Swap `id` with the current head. The displaced head is flagged so its
    /// next mode request promotes it back.
    pub fn swap_to_head(&self, id: StreamId) -> Result<()> {
        let mut slots = self.slots.lock();
        let Some(i) = slots.entries.iter().position(|e| e.id() == id) else {
            return Err(StreamError::Blocked);
        };
        if i > 0 {
            slots.entries.swap(0, i);
            slots.entries[i].key.set_awaiting_head(true);
        }
        Ok(())
    }

    /// Move `id` to the head through `mover`; a no-op if it already is.
    pub fn promote_to_head(&self, id: StreamId, mover: &dyn PoolMover) -> Result<()> {
        if self.is_head(id) {
            return Ok(());
        }
        mover.move_to_head(self, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SwapToHead;

    fn key(n: u64) -> Arc<StreamKey> {
        Arc::new(StreamKey::new(StreamId(n)))
    }

    fn fill(pool: &Pool, n: u64) -> Vec<Arc<StreamKey>> {
        (0..n)
            .map(|i| {
                let k = key(i);
                pool.append(Arc::clone(&k), Weak::new()).unwrap();
                k
            })
            .collect()
    }

    #[test]
    fn growth_schedule() {
        assert_eq!(grown_capacity(0), 3);
        assert_eq!(grown_capacity(3), 7);
        assert_eq!(grown_capacity(7), 11);
        assert_eq!(grown_capacity(16), 20);
        assert_eq!(grown_capacity(100), 125);
    }

    #[test]
    fn append_past_inline_capacity_keeps_order() {
        let pool = Pool::new(PoolId(0));
        fill(&pool, 3);
        assert_eq!(pool.capacity(), 3);
        let k = key(3);
        pool.append(k, Weak::new()).unwrap();
        assert_eq!(pool.capacity(), 7);
        assert_eq!(pool.order(), vec![StreamId(0), StreamId(1), StreamId(2), StreamId(3)]);
    }

    #[test]
    fn remove_compacts() {
        let pool = Pool::new(PoolId(0));
        fill(&pool, 4);
        assert!(pool.remove(StreamId(1)));
        assert!(!pool.remove(StreamId(1)));
        assert_eq!(pool.order(), vec![StreamId(0), StreamId(2), StreamId(3)]);
    }

    #[test]
    fn swap_flags_displaced_head() {
        let pool = Pool::new(PoolId(0));
        let keys = fill(&pool, 3);
        pool.promote_to_head(StreamId(2), &SwapToHead).unwrap();
        assert_eq!(pool.head(), Some(StreamId(2)));
        assert!(keys[0].awaiting_head());
        assert!(!keys[1].awaiting_head());
    }

    #[test]
    fn promoting_the_head_is_a_no_op() {
        let pool = Pool::new(PoolId(0));
        let keys = fill(&pool, 2);
        pool.promote_to_head(StreamId(0), &SwapToHead).unwrap();
        assert_eq!(pool.order(), vec![StreamId(0), StreamId(1)]);
        assert!(!keys[1].awaiting_head());
    }

    #[test]
    fn swap_of_non_member_fails() {
        let pool = Pool::new(PoolId(0));
        fill(&pool, 1);
        assert!(pool.swap_to_head(StreamId(9)).unwrap_err().is_blocked());
    }
}
