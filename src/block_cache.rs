//! Fixed-block memory cache
//!
//! Composes the slab pool, one [`SlotTable`] per bank and a
//! [`BoundedBlockIndex`]. A key maps to exactly one block; values are always
//! at most one block long.
//!
//! ## Allocation
//!
//! A store for an unknown key claims a free block by scanning the banks'
//! slot tables and setting a bit with compare-and-swap. Losing a race just
//! means rescanning the same bank. The whole scan runs at most
//! [`ALLOCATION_PASSES`] times; after that the store gives up and returns
//! `false`. Giving up is normal under contention or saturation and callers
//! treat it as "not cached".
//!
//! ## Release
//!
//! Whenever the index drops an entry (LRU eviction or [`BlockCache::delete`])
//! the location is marked removed, its bit cleared and the counters adjusted.
//! The index holds its lock while doing so, so a location is never reachable
//! from the index once its bit is clear.

use crate::config::BlockCacheConfig;
use crate::error::{BlockCacheError, Result};
use crate::index::{BlockLocation, BoundedBlockIndex};
use crate::metrics::Metrics;
use crate::slab::SlabPool;
use crate::slot_table::SlotTable;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// Full passes over all banks before an allocation gives up
pub const ALLOCATION_PASSES: usize = 10;

/// Default key: one block of one cached file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockCacheKey {
    /// Numeric id assigned to the file by the caller
    pub file: u64,
    /// Block number within the file
    pub block: u64,
}

impl BlockCacheKey {
    pub fn new(file: u64, block: u64) -> Self {
        BlockCacheKey { file, block }
    }
}

/// Off-heap block cache
pub struct BlockCache<K: Hash + Eq + Clone + Send + 'static = BlockCacheKey> {
    index: BoundedBlockIndex<K>,
    pool: SlabPool,
    slots: Arc<[SlotTable]>,
    metrics: Arc<Metrics>,
}

impl<K: Hash + Eq + Clone + Send + 'static> BlockCache<K> {
    pub fn new(config: &BlockCacheConfig) -> Result<Self> {
        Self::with_metrics(config, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(config: &BlockCacheConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let pool = SlabPool::new(config)?;
        let slots: Arc<[SlotTable]> = (0..pool.bank_count())
            .map(|_| SlotTable::new(pool.blocks_per_bank()))
            .collect();

        let capacity = NonZeroUsize::new(config.max_entries()).ok_or_else(|| {
            BlockCacheError::InvalidConfig("cache must hold at least two blocks".to_string())
        })?;

        let listener_slots = Arc::clone(&slots);
        let listener_metrics = Arc::clone(&metrics);
        let index = BoundedBlockIndex::new(
            capacity,
            Box::new(move |_key: &K, location: &BlockLocation| {
                release_location(&listener_slots, &listener_metrics, location);
            }),
        );

        info!(
            "Block cache: {} banks x {} blocks of {} bytes ({} entries, direct={})",
            pool.bank_count(),
            pool.blocks_per_bank(),
            pool.block_size(),
            capacity,
            config.direct_allocation
        );

        Ok(BlockCache {
            index,
            pool,
            slots,
            metrics,
        })
    }

    /// Store `data` at `block_offset` within the block for `key`.
    ///
    /// Returns `false` if no block could be allocated or the key's block was
    /// released concurrently; the data is then simply not cached.
    ///
    /// # Panics
    ///
    /// If `block_offset + data.len()` exceeds the block size.
    pub fn store(&self, key: &K, block_offset: usize, data: &[u8]) -> bool {
        let block_size = self.pool.block_size();
        assert!(
            block_offset + data.len() <= block_size,
            "Buffer size exceeded, expecting max [{}] got length [{}] with block offset [{}]",
            block_size,
            data.len(),
            block_offset
        );

        match self.index.get(key) {
            Some(location) => self.store_at(key, location, false, block_offset, data),
            None => match self.find_empty_slot() {
                Some(location) => self.store_at(key, Arc::new(location), true, block_offset, data),
                None => {
                    self.metrics.store_failures.fetch_add(1, Ordering::Relaxed);
                    debug!("No free block after {} passes", ALLOCATION_PASSES);
                    false
                }
            },
        }
    }

    /// Write into `location` and, for a freshly claimed one, index it
    fn store_at(
        &self,
        key: &K,
        location: Arc<BlockLocation>,
        is_new: bool,
        block_offset: usize,
        data: &[u8],
    ) -> bool {
        if location.is_removed() {
            self.metrics.store_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.pool
            .write_block(location.bank_id(), location.block(), block_offset, data);

        if is_new {
            self.metrics.block_cache_size.fetch_add(1, Ordering::Relaxed);
            // A concurrent first store of the same key may have won the insert
            // race; whichever location is displaced gets released here.
            if let Some(displaced) = self.index.insert(key.clone(), location) {
                release_location(&self.slots, &self.metrics, &displaced);
            }
        }
        true
    }

    /// Copy `buffer.len()` bytes starting at `block_offset` of `key`'s block
    /// into `buffer`.
    ///
    /// Returns `false` on a miss, leaving `buffer` untouched.
    ///
    /// # Panics
    ///
    /// If `block_offset + buffer.len()` exceeds the block size.
    pub fn fetch(&self, key: &K, buffer: &mut [u8], block_offset: usize) -> bool {
        let block_size = self.pool.block_size();
        assert!(
            block_offset + buffer.len() <= block_size,
            "Fetch out of block, expecting max [{}] got length [{}] with block offset [{}]",
            block_size,
            buffer.len(),
            block_offset
        );

        let location = match self.index.get(key) {
            Some(location) if !location.is_removed() => location,
            _ => {
                self.metrics.block_cache_miss.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        self.pool
            .read_block(location.bank_id(), location.block(), block_offset, buffer);
        self.metrics.block_cache_hit.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Fetch a whole block.
    ///
    /// # Panics
    ///
    /// If `buffer.len()` is not exactly the block size.
    pub fn fetch_block(&self, key: &K, buffer: &mut [u8]) -> bool {
        assert!(
            buffer.len() == self.pool.block_size(),
            "Buffer wrong size, expecting [{}] got [{}]",
            self.pool.block_size(),
            buffer.len()
        );
        self.fetch(key, buffer, 0)
    }

    /// Drop `key` and release its block
    pub fn delete(&self, key: &K) -> bool {
        self.index.remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains(key)
    }

    /// Number of cached blocks
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Maximum number of cached blocks
    pub fn capacity(&self) -> usize {
        self.index.capacity()
    }

    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    /// Blocks currently owned according to the slot tables
    pub fn occupied_slots(&self) -> usize {
        self.slots.iter().map(SlotTable::occupied).sum()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn find_empty_slot(&self) -> Option<BlockLocation> {
        for _ in 0..ALLOCATION_PASSES {
            for (bank_id, table) in self.slots.iter().enumerate() {
                if table.is_full() {
                    continue;
                }
                // A lost claim restarts at 0: a lower block may have been
                // released in the meantime.
                let mut candidate = table.next_clear_bit(0);
                while let Some(bit) = candidate {
                    if table.claim(bit) {
                        return Some(BlockLocation::new(bank_id, bit));
                    }
                    candidate = table.next_clear_bit(0);
                }
            }
        }
        None
    }
}

fn release_location(slots: &[SlotTable], metrics: &Metrics, location: &BlockLocation) {
    if !location.mark_removed() {
        return;
    }
    slots[location.bank_id()].release(location.block());
    metrics.block_cache_eviction.fetch_add(1, Ordering::Relaxed);
    metrics.block_cache_size.fetch_sub(1, Ordering::Relaxed);
    debug!(
        "Released block {} of bank {}",
        location.block(),
        location.bank_id()
    );
}
