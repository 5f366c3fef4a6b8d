//! Cache counters
//!
//! The engine and the directory cache bump these as they work; everything
//! else only reads them through [`Metrics::snapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Shared counters for one block cache
#[derive(Debug, Default)]
pub struct Metrics {
    /// Entries currently held in the cache
    pub block_cache_size: AtomicI64,
    /// Locations released by eviction or deletion
    pub block_cache_eviction: AtomicU64,
    pub block_cache_hit: AtomicU64,
    pub block_cache_miss: AtomicU64,
    /// Stores that returned `false` (no free slot, or lost a race)
    pub store_failures: AtomicU64,
    /// Scratch buffers allocated because the pool was empty
    pub buffer_allocations: AtomicU64,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub block_cache_size: i64,
    pub block_cache_eviction: u64,
    pub block_cache_hit: u64,
    pub block_cache_miss: u64,
    pub store_failures: u64,
    pub buffer_allocations: u64,
}

impl MetricsSnapshot {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.block_cache_hit + self.block_cache_miss;
        if total == 0 {
            0.0
        } else {
            (self.block_cache_hit as f64 / total as f64) * 100.0
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            block_cache_size: self.block_cache_size.load(Ordering::Relaxed),
            block_cache_eviction: self.block_cache_eviction.load(Ordering::Relaxed),
            block_cache_hit: self.block_cache_hit.load(Ordering::Relaxed),
            block_cache_miss: self.block_cache_miss.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            buffer_allocations: self.buffer_allocations.load(Ordering::Relaxed),
        }
    }
}
