//! Per-bank block ownership bitmap
//!
//! One bit per block: 0 = free, 1 = owned by exactly one cache key.
//! Claims and releases are single-bit compare-and-swap loops on 64-bit words,
//! so allocators in different threads never block each other. A lost race is
//! reported to the caller, which decides whether to rescan.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Atomic bit array with an occupancy counter
#[derive(Debug)]
pub struct SlotTable {
    /// Bitmap words (each word = 64 blocks)
    words: Box<[AtomicU64]>,

    /// Number of blocks tracked
    len: usize,

    /// Number of bits currently set
    occupied: AtomicUsize,
}

impl SlotTable {
    pub fn new(len: usize) -> Self {
        let num_words = (len + 63) / 64;
        SlotTable {
            words: (0..num_words).map(|_| AtomicU64::new(0)).collect(),
            len,
            occupied: AtomicUsize::new(0),
        }
    }

    /// Number of blocks tracked
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Number of blocks currently owned
    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.occupied() >= self.len
    }

    /// Whether `bit` is currently owned
    pub fn is_set(&self, bit: usize) -> bool {
        if bit >= self.len {
            return false;
        }
        let (word_idx, mask) = Self::locate(bit);
        self.words[word_idx].load(Ordering::Acquire) & mask != 0
    }

    /// Atomically set `bit`.
    ///
    /// Returns `false` when the bit was already set (another thread owns it).
    pub fn claim(&self, bit: usize) -> bool {
        if bit >= self.len {
            return false;
        }
        let (word_idx, mask) = Self::locate(bit);
        let word = &self.words[word_idx];

        let mut current = word.load(Ordering::Acquire);
        loop {
            if current & mask != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                current,
                current | mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.occupied.fetch_add(1, Ordering::AcqRel);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Atomically clear `bit`.
    ///
    /// Returns `false` if the bit was already clear.
    pub fn release(&self, bit: usize) -> bool {
        if bit >= self.len {
            return false;
        }
        let (word_idx, mask) = Self::locate(bit);
        let word = &self.words[word_idx];

        let mut current = word.load(Ordering::Acquire);
        loop {
            if current & mask == 0 {
                tracing::warn!("Double release detected for slot {}", bit);
                return false;
            }
            match word.compare_exchange_weak(
                current,
                current & !mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.occupied.fetch_sub(1, Ordering::AcqRel);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// First clear bit at or after `from`, if any
    pub fn next_clear_bit(&self, from: usize) -> Option<usize> {
        if from >= self.len {
            return None;
        }

        let mut word_idx = from / 64;
        // Treat bits below `from` in the first word as set
        let mut ignore = (1u64 << (from % 64)) - 1;

        while word_idx < self.words.len() {
            let free = !(self.words[word_idx].load(Ordering::Acquire) | ignore);
            if free != 0 {
                let bit = word_idx * 64 + free.trailing_zeros() as usize;
                return if bit < self.len { Some(bit) } else { None };
            }
            ignore = 0;
            word_idx += 1;
        }
        None
    }

    /// Population count over the whole bitmap
    pub fn count_set(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    #[inline]
    fn locate(bit: usize) -> (usize, u64) {
        (bit / 64, 1u64 << (bit % 64))
    }
}
