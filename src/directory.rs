//! Block-caching storage decorator
//!
//! [`BlockDirectory`] wraps any [`Storage`] and routes reads and writes of
//! eligible files through a [`Cache`], in aligned 8 KiB blocks.
//!
//! Cached blocks are addressed by a *file cache name*:
//! `"{dir}/{file}:{last modified}"`. Replacing a file changes its stamp and
//! therefore its name, so stale blocks are never served; they simply stop
//! being reachable.

use crate::buffer_store::BufferStore;
use crate::cache::Cache;
use crate::config::DirectoryCacheConfig;
use crate::error::{BlockCacheError, Result};
use crate::storage::{IoContext, Storage, StorageInput, StorageLock, StorageOutput};
use crate::stream::{CachedInput, CachedOutput};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// log2 of the directory block size
pub const BLOCK_SHIFT: u32 = 13;

/// Directory block size (8 KiB)
pub const BLOCK_SIZE: usize = 1 << BLOCK_SHIFT;

/// Mask for the offset within a block
pub const BLOCK_MOD: u64 = 0x1FFF;

/// Block containing file position `pos`
#[inline]
pub fn block_id(pos: u64) -> u64 {
    pos >> BLOCK_SHIFT
}

/// Offset of `pos` within its block
#[inline]
pub fn block_offset(pos: u64) -> usize {
    (pos & BLOCK_MOD) as usize
}

/// File position of `offset` within `block`
#[inline]
pub fn real_position(block: u64, offset: u64) -> u64 {
    (block << BLOCK_SHIFT) + offset
}

/// Storage decorator that caches file blocks
pub struct BlockDirectory<S: Storage + 'static> {
    dir_name: String,
    storage: Arc<S>,
    cache: Arc<dyn Cache>,
    config: DirectoryCacheConfig,
    buffers: Arc<BufferStore>,
}

impl<S: Storage + 'static> BlockDirectory<S> {
    /// Decorate `storage`.
    ///
    /// Fails with [`BlockCacheError::Unsupported`] if any caching is enabled
    /// and the backend cannot report modification times.
    pub fn new(
        dir_name: impl Into<String>,
        storage: S,
        cache: Arc<dyn Cache>,
        config: DirectoryCacheConfig,
    ) -> Result<Self> {
        let config = config.normalized();
        let dir_name = dir_name.into();

        if (config.read_cache_enabled || config.write_cache_enabled)
            && !storage.supports_file_modified()
        {
            return Err(BlockCacheError::Unsupported(format!(
                "block caching for {} needs a storage backend with file modification times",
                dir_name
            )));
        }
        if !config.read_cache_enabled {
            info!("Block cache on read is disabled for {}", dir_name);
        }
        if !config.write_cache_enabled {
            info!("Block cache on write is disabled for {}", dir_name);
        }

        Ok(BlockDirectory {
            dir_name,
            storage: Arc::new(storage),
            cache,
            config,
            buffers: Arc::new(BufferStore::default()),
        })
    }

    /// Use a shared scratch buffer pool
    pub fn with_buffers(mut self, buffers: Arc<BufferStore>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn config(&self) -> &DirectoryCacheConfig {
        &self.config
    }

    /// `"{dir}/{name}"`
    pub fn file_cache_location(&self, name: &str) -> String {
        format!("{}/{}", self.dir_name, name)
    }

    /// `"{dir}/{name}:{last modified}"`
    pub fn file_cache_name(&self, name: &str) -> Result<String> {
        file_cache_name(&*self.storage, &self.dir_name, name)
    }

    /// Whether reads of `name` go through the cache
    pub fn use_read_cache(&self, name: &str, _context: IoContext) -> bool {
        self.config.read_cache_enabled && self.config.is_cacheable(name)
    }

    /// Whether writes of `name` are mirrored into the cache
    pub fn use_write_cache(&self, name: &str, context: IoContext) -> bool {
        if !self.config.write_cache_enabled || !self.config.is_cacheable(name) {
            return false;
        }
        // Merge output is read rarely; keep it out of the cache
        context != IoContext::Merge
    }

    fn caching_enabled(&self) -> bool {
        self.config.read_cache_enabled || self.config.write_cache_enabled
    }

    /// Copy `src` from this directory into `dest` on `to`
    pub fn copy_to(&self, to: &dyn Storage, src: &str, dest: &str, context: IoContext) -> Result<()> {
        let mut input = self.open_input(src, context)?;
        let mut output = to.create_output(dest, context)?;

        let mut chunk = vec![0u8; BLOCK_SIZE];
        let mut remaining = input.length();
        while remaining > 0 {
            let n = remaining.min(BLOCK_SIZE as u64) as usize;
            input.read_bytes(&mut chunk[..n])?;
            output.write_bytes(&chunk[..n])?;
            remaining -= n as u64;
        }
        output.close()
    }

    fn purge(&self, name: &str) -> Result<()> {
        match self.file_cache_name(name) {
            Ok(cache_name) => {
                debug!("Purging cache entries for {}", cache_name);
                self.cache.delete(&cache_name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!("File {} vanished before its cache entries were purged", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn file_cache_name<S: Storage + ?Sized>(storage: &S, dir_name: &str, name: &str) -> Result<String> {
    Ok(format!(
        "{}/{}:{}",
        dir_name,
        name,
        storage.file_modified(name)?
    ))
}

impl<S: Storage + 'static> Storage for BlockDirectory<S> {
    fn open_input(&self, name: &str, context: IoContext) -> Result<Box<dyn StorageInput>> {
        let source = self.storage.open_input(name, context)?;
        if !self.use_read_cache(name, context) {
            return Ok(source);
        }
        Ok(Box::new(
            CachedInput::new(
                source,
                self.file_cache_name(name)?,
                Arc::clone(&self.cache),
                Arc::clone(&self.buffers),
            ),
        ))
    }

    fn create_output(&self, name: &str, context: IoContext) -> Result<Box<dyn StorageOutput>> {
        let dest = self.storage.create_output(name, context)?;
        if !self.use_write_cache(name, context) {
            return Ok(dest);
        }

        let storage = Arc::clone(&self.storage);
        let dir_name = self.dir_name.clone();
        let file = name.to_string();
        Ok(Box::new(CachedOutput::new(
            dest,
            self.file_cache_location(name),
            Arc::clone(&self.cache),
            Box::new(move || file_cache_name(&*storage, &dir_name, &file)),
        )))
    }

    fn list_all(&self) -> Result<Vec<String>> {
        self.storage.list_all()
    }

    /// Purge the file's cache entries, then delete it from the backend
    fn delete_file(&self, name: &str) -> Result<()> {
        if self.caching_enabled() {
            self.cache.delete(&self.file_cache_name(name)?);
        }
        self.storage.delete_file(name)
    }

    fn file_exists(&self, name: &str) -> Result<bool> {
        self.storage.file_exists(name)
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        self.storage.file_length(name)
    }

    fn file_modified(&self, name: &str) -> Result<u64> {
        self.storage.file_modified(name)
    }

    fn supports_file_modified(&self) -> bool {
        self.storage.supports_file_modified()
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        self.storage.sync(names)
    }

    fn obtain_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.storage.obtain_lock(name)
    }

    /// Purge every file's cache entries, then close the backend.
    ///
    /// Files (or the whole directory) disappearing underneath are tolerated.
    /// A failed purge does not stop the others; the backend is closed either
    /// way and the first failure is returned.
    fn close(&self) -> Result<()> {
        let purged = if self.caching_enabled() {
            match self.storage.list_all() {
                // Keep purging past a failure; report the first one
                Ok(files) => files
                    .iter()
                    .fold(Ok(()), |first: Result<()>, file| first.and(self.purge(file))),
                Err(e) if e.is_not_found() => {
                    warn!("Directory {} is gone; nothing to purge", self.dir_name);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };

        self.storage.close()?;
        purged
    }
}
