//! Pooled scratch buffers
//!
//! Cache misses read a whole block from storage into a scratch buffer before
//! publishing it. Buffers of the two common sizes are recycled through
//! bounded lock-free queues; everything else is a plain allocation.

use crate::metrics::Metrics;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Small buffer size (1 KiB)
pub const SMALL_BUFFER: usize = 1024;

/// Block buffer size (8 KiB)
pub const BLOCK_BUFFER: usize = 8192;

/// Default number of pooled buffers per size
pub const DEFAULT_POOL_DEPTH: usize = 64;

#[derive(Debug)]
pub struct BufferStore {
    small: ArrayQueue<Vec<u8>>,
    block: ArrayQueue<Vec<u8>>,
    metrics: Arc<Metrics>,
}

impl BufferStore {
    pub fn new(depth: usize, metrics: Arc<Metrics>) -> Self {
        let depth = depth.max(1);
        BufferStore {
            small: ArrayQueue::new(depth),
            block: ArrayQueue::new(depth),
            metrics,
        }
    }

    /// Take a buffer of exactly `size` bytes.
    ///
    /// Pooled buffers come back with whatever they held last.
    pub fn take_buffer(&self, size: usize) -> Vec<u8> {
        let pooled = match size {
            SMALL_BUFFER => self.small.pop(),
            BLOCK_BUFFER => self.block.pop(),
            _ => None,
        };
        pooled.unwrap_or_else(|| {
            self.metrics
                .buffer_allocations
                .fetch_add(1, Ordering::Relaxed);
            vec![0u8; size]
        })
    }

    /// Return a buffer to its pool; odd sizes and overflow are dropped
    pub fn put_buffer(&self, buffer: Vec<u8>) {
        let _ = match buffer.len() {
            SMALL_BUFFER => self.small.push(buffer),
            BLOCK_BUFFER => self.block.push(buffer),
            _ => Ok(()),
        };
    }

    /// Buffers currently pooled, `(small, block)`
    pub fn pooled(&self) -> (usize, usize) {
        (self.small.len(), self.block.len())
    }
}

impl Default for BufferStore {
    fn default() -> Self {
        BufferStore::new(DEFAULT_POOL_DEPTH, Arc::new(Metrics::new()))
    }
}
