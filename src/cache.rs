//! File-level cache capability
//!
//! [`BlockDirectory`](crate::BlockDirectory) only talks to a [`Cache`]: it
//! asks for `(file cache name, block id)` pairs and publishes whole or
//! partial blocks. [`BlockDirectoryCache`] backs that with a [`BlockCache`];
//! [`NoCache`] always misses.

use crate::block_cache::{BlockCache, BlockCacheKey};
use crate::directory::BLOCK_SIZE;
use crate::error::{BlockCacheError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Block-granular cache addressed by file cache name
pub trait Cache: Send + Sync {
    /// Publish `buffer` at `block_offset` within block `block_id` of `name`
    fn update(&self, name: &str, block_id: u64, block_offset: usize, buffer: &[u8]);

    /// Fill `dest` from `block_offset` within block `block_id` of `name`.
    /// Returns `false` on a miss.
    fn fetch(&self, name: &str, block_id: u64, block_offset: usize, dest: &mut [u8]) -> bool;

    /// Forget every block of `name`
    fn delete(&self, name: &str);

    /// Number of cached blocks
    fn size(&self) -> u64;

    /// Make the blocks cached under `source` reachable as `dest`
    fn rename_cache_file(&self, source: &str, dest: &str);
}

/// Cache that never holds anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl Cache for NoCache {
    fn update(&self, _name: &str, _block_id: u64, _block_offset: usize, _buffer: &[u8]) {}

    fn fetch(&self, _name: &str, _block_id: u64, _block_offset: usize, _dest: &mut [u8]) -> bool {
        false
    }

    fn delete(&self, _name: &str) {}

    fn size(&self) -> u64 {
        0
    }

    fn rename_cache_file(&self, _source: &str, _dest: &str) {}
}

/// [`Cache`] over a shared [`BlockCache`].
///
/// Each file cache name gets a numeric id; blocks are keyed by
/// `(id, block)`. The blocks published for every id are tracked so that
/// deleting a name releases its slots right away.
pub struct BlockDirectoryCache {
    block_cache: Arc<BlockCache>,
    files: RwLock<FileTable>,
    next_file: AtomicU64,
}

#[derive(Debug, Default)]
struct FileTable {
    names: HashMap<String, u64>,
    /// Block ids published per file id; may include blocks since evicted
    blocks: HashMap<u64, BTreeSet<u64>>,
}

impl BlockDirectoryCache {
    /// Wrap `block_cache`; its blocks must fit a directory block
    pub fn new(block_cache: Arc<BlockCache>) -> Result<Self> {
        if block_cache.block_size() < BLOCK_SIZE {
            return Err(BlockCacheError::InvalidConfig(format!(
                "block cache block size {} is smaller than the directory block size {}",
                block_cache.block_size(),
                BLOCK_SIZE
            )));
        }
        Ok(BlockDirectoryCache {
            block_cache,
            files: RwLock::new(FileTable::default()),
            next_file: AtomicU64::new(0),
        })
    }

    pub fn block_cache(&self) -> &Arc<BlockCache> {
        &self.block_cache
    }

    /// Number of file names currently mapped
    pub fn file_count(&self) -> usize {
        self.files.read().names.len()
    }

    /// Release every block published under file id `file`
    fn release_file(&self, files: &mut FileTable, file: u64) -> usize {
        let Some(blocks) = files.blocks.remove(&file) else {
            return 0;
        };
        blocks
            .into_iter()
            .filter(|&block| self.block_cache.delete(&BlockCacheKey::new(file, block)))
            .count()
    }
}

impl Cache for BlockDirectoryCache {
    fn update(&self, name: &str, block_id: u64, block_offset: usize, buffer: &[u8]) {
        // Held across the store so a concurrent delete cannot miss the block
        let mut files = self.files.write();
        let file = match files.names.get(name) {
            Some(&id) => id,
            None => {
                let id = self.next_file.fetch_add(1, Ordering::Relaxed);
                files.names.insert(name.to_string(), id);
                id
            }
        };

        let key = BlockCacheKey::new(file, block_id);
        if self.block_cache.store(&key, block_offset, buffer) {
            files.blocks.entry(file).or_default().insert(block_id);
        }
    }

    fn fetch(&self, name: &str, block_id: u64, block_offset: usize, dest: &mut [u8]) -> bool {
        let file = self.files.read().names.get(name).copied();
        match file {
            Some(file) => {
                self.block_cache
                    .fetch(&BlockCacheKey::new(file, block_id), dest, block_offset)
            }
            None => {
                self.block_cache
                    .metrics()
                    .block_cache_miss
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn delete(&self, name: &str) {
        let mut files = self.files.write();
        if let Some(file) = files.names.remove(name) {
            let released = self.release_file(&mut files, file);
            debug!("Dropped {} cached blocks of {}", released, name);
        }
    }

    fn size(&self) -> u64 {
        self.block_cache.len() as u64
    }

    fn rename_cache_file(&self, source: &str, dest: &str) {
        let mut files = self.files.write();
        let Some(id) = files.names.remove(source) else {
            return;
        };
        if let Some(replaced) = files.names.insert(dest.to_string(), id) {
            self.release_file(&mut files, replaced);
        }
        debug!("Renamed cache file {} -> {}", source, dest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockCacheConfig;

    fn directory_cache() -> BlockDirectoryCache {
        let config = BlockCacheConfig::with_layout(1, 8, BLOCK_SIZE);
        BlockDirectoryCache::new(Arc::new(BlockCache::new(&config).unwrap())).unwrap()
    }

    #[test]
    fn test_no_cache_always_misses() {
        let cache = NoCache;
        cache.update("a:1", 0, 0, b"data");
        let mut out = [0u8; 4];
        assert!(!cache.fetch("a:1", 0, 0, &mut out));
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_update_and_fetch() {
        let cache = directory_cache();
        cache.update("dir/a:1", 3, 0, b"block three");

        let mut out = [0u8; 5];
        assert!(cache.fetch("dir/a:1", 3, 6, &mut out));
        assert_eq!(&out, b"three");
        assert!(!cache.fetch("dir/a:1", 4, 0, &mut out));
        assert!(!cache.fetch("dir/b:1", 3, 0, &mut out));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_delete_makes_blocks_unreachable() {
        let cache = directory_cache();
        cache.update("dir/a:1", 0, 0, b"old");
        cache.delete("dir/a:1");

        let mut out = [0u8; 3];
        assert!(!cache.fetch("dir/a:1", 0, 0, &mut out));
        assert_eq!(cache.file_count(), 0);

        // A new file under the same name never sees the old id
        cache.update("dir/a:1", 1, 0, b"new");
        assert!(!cache.fetch("dir/a:1", 0, 0, &mut out));
    }

    #[test]
    fn test_delete_releases_slots() {
        let cache = directory_cache();
        for block in 0..3 {
            cache.update("dir/a:1", block, 0, &[block as u8; 16]);
        }
        cache.update("dir/b:1", 0, 0, b"keep");
        assert_eq!(cache.size(), 4);

        cache.delete("dir/a:1");
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.block_cache().occupied_slots(), 1);

        let mut out = [0u8; 4];
        assert!(cache.fetch("dir/b:1", 0, 0, &mut out));
        assert_eq!(&out, b"keep");
    }

    #[test]
    fn test_delete_tolerates_evicted_blocks() {
        let cache = directory_cache();
        // Capacity is 7; the first blocks of `a` get evicted
        for block in 0..10 {
            cache.update("dir/a:1", block, 0, b"x");
        }
        assert_eq!(cache.size(), 7);

        cache.delete("dir/a:1");
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.block_cache().occupied_slots(), 0);
    }

    #[test]
    fn test_rename() {
        let cache = directory_cache();
        cache.update("dir/a", 0, 0, b"written");
        cache.rename_cache_file("dir/a", "dir/a:42");

        let mut out = [0u8; 7];
        assert!(!cache.fetch("dir/a", 0, 0, &mut out));
        assert!(cache.fetch("dir/a:42", 0, 0, &mut out));
        assert_eq!(&out, b"written");
    }

    #[test]
    fn test_rename_over_existing_name_releases_its_blocks() {
        let cache = directory_cache();
        cache.update("dir/a:42", 0, 0, b"old");
        cache.update("dir/a:42", 1, 0, b"old");
        cache.update("dir/a", 0, 0, b"new");

        cache.rename_cache_file("dir/a", "dir/a:42");
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.file_count(), 1);

        let mut out = [0u8; 3];
        assert!(cache.fetch("dir/a:42", 0, 0, &mut out));
        assert_eq!(&out, b"new");
        assert!(!cache.fetch("dir/a:42", 1, 0, &mut out));
    }

    #[test]
    fn test_rejects_small_blocks() {
        let config = BlockCacheConfig::with_layout(1, 8, 1024);
        let engine = Arc::new(BlockCache::new(&config).unwrap());
        assert!(matches!(
            BlockDirectoryCache::new(engine),
            Err(BlockCacheError::InvalidConfig(_))
        ));
    }
}
