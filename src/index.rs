//! Bounded block index
//!
//! Maps cache keys to block locations in recency order. Inserting past the
//! capacity synchronously evicts the least recently used entry and hands it to
//! the registered [`EvictionListener`] before the insert returns. Explicit
//! removals go through the same listener, so every location that leaves the
//! index is released exactly once.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Where a cached block lives in the slab pool
#[derive(Debug)]
pub struct BlockLocation {
    bank_id: usize,
    block: usize,
    /// Set once the location has been released; never cleared
    removed: AtomicBool,
    /// Index clock value at the last access
    last_touched: AtomicU64,
}

impl BlockLocation {
    pub fn new(bank_id: usize, block: usize) -> Self {
        BlockLocation {
            bank_id,
            block,
            removed: AtomicBool::new(false),
            last_touched: AtomicU64::new(0),
        }
    }

    pub fn bank_id(&self) -> usize {
        self.bank_id
    }

    pub fn block(&self) -> usize {
        self.block
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Mark as removed; returns `false` if it already was
    pub fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }

    pub fn last_touched(&self) -> u64 {
        self.last_touched.load(Ordering::Relaxed)
    }

    fn touch(&self, ordinal: u64) {
        self.last_touched.store(ordinal, Ordering::Relaxed);
    }
}

/// Called once for every entry the index drops
pub trait EvictionListener<K>: Send + Sync {
    fn on_eviction(&self, key: &K, location: &BlockLocation);
}

impl<K, F> EvictionListener<K> for F
where
    F: Fn(&K, &BlockLocation) + Send + Sync,
{
    fn on_eviction(&self, key: &K, location: &BlockLocation) {
        self(key, location)
    }
}

/// Capacity-bounded LRU map from key to [`BlockLocation`]
pub struct BoundedBlockIndex<K: Hash + Eq + 'static> {
    map: Mutex<LruCache<K, Arc<BlockLocation>, ahash::RandomState>>,
    clock: AtomicU64,
    listener: Box<dyn EvictionListener<K>>,
}

impl<K: Hash + Eq + 'static> BoundedBlockIndex<K> {
    pub fn new(capacity: NonZeroUsize, listener: Box<dyn EvictionListener<K>>) -> Self {
        BoundedBlockIndex {
            map: Mutex::new(LruCache::with_hasher(capacity, ahash::RandomState::new())),
            clock: AtomicU64::new(0),
            listener,
        }
    }

    /// Look up `key`, promoting it to most recently used
    pub fn get(&self, key: &K) -> Option<Arc<BlockLocation>> {
        let mut map = self.map.lock();
        let location = map.get(key)?;
        location.touch(self.clock.fetch_add(1, Ordering::Relaxed) + 1);
        Some(Arc::clone(location))
    }

    /// Look up `key` without changing its recency
    pub fn peek(&self, key: &K) -> Option<Arc<BlockLocation>> {
        self.map.lock().peek(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.lock().contains(key)
    }

    /// Insert `location` under `key`.
    ///
    /// If the index is full, the least recently used entry is evicted and
    /// passed to the listener. If `key` was already present, the displaced
    /// location is returned and the listener is *not* called for it.
    pub fn insert(&self, key: K, location: Arc<BlockLocation>) -> Option<Arc<BlockLocation>> {
        let mut map = self.map.lock();
        location.touch(self.clock.fetch_add(1, Ordering::Relaxed) + 1);

        let replacing = map.contains(&key);
        match map.push(key, location) {
            Some((_, displaced)) if replacing => Some(displaced),
            Some((evicted_key, evicted)) => {
                self.listener.on_eviction(&evicted_key, &evicted);
                None
            }
            None => None,
        }
    }

    /// Remove `key`, releasing its location through the listener
    pub fn remove(&self, key: &K) -> bool {
        let mut map = self.map.lock();
        match map.pop_entry(key) {
            Some((removed_key, location)) => {
                self.listener.on_eviction(&removed_key, &location);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.map.lock().cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    type Evictions = Arc<PlMutex<Vec<(u32, usize)>>>;

    fn recording_index(capacity: usize) -> (BoundedBlockIndex<u32>, Evictions) {
        let evicted: Evictions = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let index = BoundedBlockIndex::new(
            NonZeroUsize::new(capacity).unwrap(),
            Box::new(move |key: &u32, loc: &BlockLocation| {
                sink.lock().push((*key, loc.block()));
            }),
        );
        (index, evicted)
    }

    #[test]
    fn test_insert_and_get() {
        let (index, evicted) = recording_index(4);
        assert!(index.insert(1, Arc::new(BlockLocation::new(0, 7))).is_none());

        let loc = index.get(&1).unwrap();
        assert_eq!(loc.bank_id(), 0);
        assert_eq!(loc.block(), 7);
        assert!(index.get(&2).is_none());
        assert!(evicted.lock().is_empty());
    }

    #[test]
    fn test_lru_eviction_calls_listener() {
        let (index, evicted) = recording_index(2);
        index.insert(1, Arc::new(BlockLocation::new(0, 0)));
        index.insert(2, Arc::new(BlockLocation::new(0, 1)));

        // Touch 1 so 2 becomes the eviction candidate
        index.get(&1);
        index.insert(3, Arc::new(BlockLocation::new(0, 2)));

        assert_eq!(index.len(), 2);
        assert_eq!(*evicted.lock(), vec![(2, 1)]);
        assert!(index.contains(&1));
        assert!(!index.contains(&2));
    }

    #[test]
    fn test_same_key_insert_returns_displaced() {
        let (index, evicted) = recording_index(2);
        index.insert(1, Arc::new(BlockLocation::new(0, 0)));
        let displaced = index.insert(1, Arc::new(BlockLocation::new(0, 1))).unwrap();

        assert_eq!(displaced.block(), 0);
        assert_eq!(index.peek(&1).unwrap().block(), 1);
        assert!(evicted.lock().is_empty());
    }

    #[test]
    fn test_remove_calls_listener() {
        let (index, evicted) = recording_index(2);
        index.insert(5, Arc::new(BlockLocation::new(1, 3)));

        assert!(index.remove(&5));
        assert!(!index.remove(&5));
        assert!(index.is_empty());
        assert_eq!(*evicted.lock(), vec![(5, 3)]);
    }

    #[test]
    fn test_touch_ordinals_increase() {
        let (index, _) = recording_index(4);
        index.insert(1, Arc::new(BlockLocation::new(0, 0)));
        let first = index.peek(&1).unwrap().last_touched();
        let second = index.get(&1).unwrap().last_touched();
        assert!(second > first);
    }

    #[test]
    fn test_mark_removed_once() {
        let loc = BlockLocation::new(0, 0);
        assert!(!loc.is_removed());
        assert!(loc.mark_removed());
        assert!(!loc.mark_removed());
        assert!(loc.is_removed());
    }
}
