//! Preallocated slab pool
//!
//! A fixed number of banks, each one contiguous region of
//! `blocks_per_bank * block_size` bytes, allocated once and never resized.
//! Banks live either on the heap or in anonymous memory mappings
//! (`direct_allocation`), outside the allocator's reach.
//!
//! ## Concurrency
//!
//! Bank memory is shared and not behind a lock. Every copy is an independent
//! positioned transfer, so there is no cursor state to share. Distinct keys
//! never touch the same block because the slot tables hand each block to one
//! owner at a time. Two stores to the *same* key copy into the same bytes with
//! no synchronization. That is a data race in the strict sense, not merely a
//! torn read: in practice last write wins and a concurrent fetch may observe
//! a torn block, but no ordering or content guarantee is made.

use crate::config::BlockCacheConfig;
use crate::error::Result;
use memmap2::MmapMut;
use std::ptr;

enum BankMemory {
    /// Leaked boxed slice, reclaimed in `Drop`
    Heap,
    /// Anonymous mapping, unmapped when dropped
    Anonymous(#[allow(dead_code)] MmapMut),
}

/// One contiguous memory region
pub struct Bank {
    memory: BankMemory,
    base: *mut u8,
    len: usize,
}

// SAFETY: the base pointer is valid for `len` bytes for the bank's lifetime
// and all access goes through bounds-checked raw copies. Sharing across
// threads is only race-free for distinct blocks. Overlapping copies into the
// same block (racing stores of one key, or a store racing a fetch) are
// unsynchronized non-atomic accesses, which is a data race under the Rust
// memory model. Callers must not rely on the contents of a block that is
// written concurrently.
unsafe impl Send for Bank {}
unsafe impl Sync for Bank {}

impl Bank {
    /// Allocate a zeroed bank of `len` bytes
    pub fn new(len: usize, direct: bool) -> Result<Self> {
        if direct {
            let mut map = MmapMut::map_anon(len)?;
            let base = map.as_mut_ptr();
            Ok(Bank {
                memory: BankMemory::Anonymous(map),
                base,
                len,
            })
        } else {
            let boxed = vec![0u8; len].into_boxed_slice();
            let base = Box::into_raw(boxed) as *mut u8;
            Ok(Bank {
                memory: BankMemory::Heap,
                base,
                len,
            })
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.memory, BankMemory::Anonymous(_))
    }

    /// Copy `data` into the bank at `offset`
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        assert!(
            offset
                .checked_add(data.len())
                .is_some_and(|end| end <= self.len),
            "bank write out of range: offset {} len {} bank {}",
            offset,
            data.len(),
            self.len
        );
        // SAFETY: range checked above; the source slice cannot overlap bank
        // memory because bank memory is never handed out as a slice.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len());
        }
    }

    /// Copy `out.len()` bytes from the bank at `offset` into `out`
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        assert!(
            offset
                .checked_add(out.len())
                .is_some_and(|end| end <= self.len),
            "bank read out of range: offset {} len {} bank {}",
            offset,
            out.len(),
            self.len
        );
        // SAFETY: see `write_at`.
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset), out.as_mut_ptr(), out.len());
        }
    }
}

impl Drop for Bank {
    fn drop(&mut self) {
        if let BankMemory::Heap = self.memory {
            // SAFETY: `base`/`len` came from `Box::into_raw` in `new`.
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    self.base, self.len,
                )));
            }
        }
    }
}

impl std::fmt::Debug for Bank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bank")
            .field("len", &self.len)
            .field("direct", &self.is_direct())
            .finish()
    }
}

/// All banks of one cache, addressed by `(bank_id, block)`
#[derive(Debug)]
pub struct SlabPool {
    banks: Vec<Bank>,
    block_size: usize,
    blocks_per_bank: usize,
}

impl SlabPool {
    pub fn new(config: &BlockCacheConfig) -> Result<Self> {
        config.check()?;
        let blocks_per_bank = config.blocks_per_bank();
        let bank_len = blocks_per_bank * config.block_size;

        let banks = (0..config.bank_count())
            .map(|_| Bank::new(bank_len, config.direct_allocation))
            .collect::<Result<Vec<_>>>()?;

        Ok(SlabPool {
            banks,
            block_size: config.block_size,
            blocks_per_bank,
        })
    }

    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }

    pub fn blocks_per_bank(&self) -> usize {
        self.blocks_per_bank
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total bytes preallocated across all banks
    pub fn total_bytes(&self) -> usize {
        self.banks.iter().map(Bank::len).sum()
    }

    /// Write `data` into block `block` of bank `bank_id` at `block_offset`
    pub fn write_block(&self, bank_id: usize, block: usize, block_offset: usize, data: &[u8]) {
        debug_assert!(block < self.blocks_per_bank);
        debug_assert!(block_offset + data.len() <= self.block_size);
        self.banks[bank_id].write_at(block * self.block_size + block_offset, data);
    }

    /// Read `out.len()` bytes of block `block` of bank `bank_id` from `block_offset`
    pub fn read_block(&self, bank_id: usize, block: usize, block_offset: usize, out: &mut [u8]) {
        debug_assert!(block < self.blocks_per_bank);
        debug_assert!(block_offset + out.len() <= self.block_size);
        self.banks[bank_id].read_at(block * self.block_size + block_offset, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_bank_roundtrip() {
        let bank = Bank::new(64, false).unwrap();
        assert!(!bank.is_direct());
        bank.write_at(10, b"hello");

        let mut out = [0u8; 5];
        bank.read_at(10, &mut out);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_direct_bank_is_zeroed() {
        let bank = Bank::new(4096, true).unwrap();
        assert!(bank.is_direct());
        let mut out = [0xFFu8; 16];
        bank.read_at(4080, &mut out);
        assert_eq!(out, [0u8; 16]);
    }

    #[test]
    #[should_panic(expected = "bank write out of range")]
    fn test_write_out_of_range() {
        let bank = Bank::new(8, false).unwrap();
        bank.write_at(4, b"too long");
    }

    #[test]
    fn test_pool_layout() {
        let config = BlockCacheConfig::with_layout(3, 4, 16);
        let pool = SlabPool::new(&config).unwrap();
        assert_eq!(pool.bank_count(), 3);
        assert_eq!(pool.blocks_per_bank(), 4);
        assert_eq!(pool.block_size(), 16);
        assert_eq!(pool.total_bytes(), 3 * 4 * 16);
    }

    #[test]
    fn test_blocks_do_not_overlap() {
        let config = BlockCacheConfig::with_layout(1, 4, 8);
        let pool = SlabPool::new(&config).unwrap();

        for block in 0..4 {
            pool.write_block(0, block, 0, &[block as u8; 8]);
        }
        for block in 0..4 {
            let mut out = [0u8; 8];
            pool.read_block(0, block, 0, &mut out);
            assert_eq!(out, [block as u8; 8]);
        }
    }
}
