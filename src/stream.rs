//! Cache-aware input and output streams
//!
//! Both adapters cut the byte stream into aligned [`BLOCK_SIZE`] chunks.
//! [`CachedInput`] serves reads from the cache and fills misses with whole
//! blocks from the backend. [`CachedOutput`] stages writes block by block and
//! mirrors every block it hands to the backend into the cache.

use crate::buffer_store::BufferStore;
use crate::cache::Cache;
use crate::directory::{block_id, block_offset, real_position, BLOCK_SIZE};
use crate::error::{BlockCacheError, Result};
use crate::storage::{StorageInput, StorageOutput};
use std::sync::Arc;

/// Read view that consults the cache before the backend.
///
/// Only a logical file pointer is tracked; the backend stream is positioned
/// on demand when a miss has to read a block.
pub struct CachedInput {
    source: Box<dyn StorageInput>,
    name: String,
    cache_name: String,
    cache: Arc<dyn Cache>,
    buffers: Arc<BufferStore>,
    file_length: u64,
    pos: u64,
}

impl CachedInput {
    pub fn new(
        source: Box<dyn StorageInput>,
        cache_name: String,
        cache: Arc<dyn Cache>,
        buffers: Arc<BufferStore>,
    ) -> Self {
        let file_length = source.length();
        CachedInput {
            name: source.name().to_string(),
            source,
            cache_name,
            cache,
            buffers,
            file_length,
            pos: 0,
        }
    }

    /// Name under which this file's blocks are cached
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Serve up to one block's worth of `dest` starting at `position`
    fn fetch_block(&mut self, position: u64, dest: &mut [u8]) -> Result<usize> {
        let block = block_id(position);
        let offset = block_offset(position);
        let len = dest.len().min(BLOCK_SIZE - offset);
        let dest = &mut dest[..len];

        if !self.cache.fetch(&self.cache_name, block, offset, dest) {
            self.read_into_cache_and_result(block, offset, dest)?;
        }
        Ok(len)
    }

    fn read_into_cache_and_result(
        &mut self,
        block: u64,
        offset: usize,
        dest: &mut [u8],
    ) -> Result<()> {
        let start = real_position(block, 0);
        let length = (BLOCK_SIZE as u64).min(self.file_length - start) as usize;
        self.source.seek(start)?;

        let mut scratch = self.buffers.take_buffer(BLOCK_SIZE);
        if let Err(e) = self.source.read_bytes(&mut scratch[..length]) {
            self.buffers.put_buffer(scratch);
            return Err(e);
        }
        scratch[length..].fill(0);

        dest.copy_from_slice(&scratch[offset..offset + dest.len()]);
        self.cache.update(&self.cache_name, block, 0, &scratch);
        self.buffers.put_buffer(scratch);
        Ok(())
    }
}

impl StorageInput for CachedInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn length(&self) -> u64 {
        self.file_length
    }

    fn file_pointer(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let past_end = self
            .pos
            .checked_add(buf.len() as u64)
            .map_or(true, |end| end > self.file_length);
        if past_end {
            return Err(BlockCacheError::ReadPastEof {
                name: self.name.clone(),
                position: self.pos,
                length: self.file_length,
            });
        }

        let mut position = self.pos;
        let mut done = 0;
        while done < buf.len() {
            let n = self.fetch_block(position, &mut buf[done..])?;
            position += n as u64;
            done += n;
        }
        self.pos = position;
        Ok(())
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(CachedInput {
            source: self.source.clone_input()?,
            name: self.name.clone(),
            cache_name: self.cache_name.clone(),
            cache: Arc::clone(&self.cache),
            buffers: Arc::clone(&self.buffers),
            file_length: self.file_length,
            pos: self.pos,
        }))
    }
}

/// Produces the final cache name once the file is complete
pub type CacheNameResolver = Box<dyn FnOnce() -> Result<String> + Send>;

/// Write view that mirrors written blocks into the cache.
///
/// Blocks are cached under the file's cache *location* while it is being
/// written (its modification stamp is not final yet). On close the entries
/// are renamed to the final cache name so readers find them.
pub struct CachedOutput {
    dest: Box<dyn StorageOutput>,
    location: String,
    cache: Arc<dyn Cache>,
    block: Vec<u8>,
    /// File position of `block[0]`
    block_start: u64,
    /// Bytes staged in `block`
    staged: usize,
    /// Bytes of `block` already handed to `dest`
    flushed: usize,
    resolver: Option<CacheNameResolver>,
}

impl CachedOutput {
    pub fn new(
        dest: Box<dyn StorageOutput>,
        location: String,
        cache: Arc<dyn Cache>,
        resolver: CacheNameResolver,
    ) -> Self {
        CachedOutput {
            dest,
            location,
            cache,
            block: vec![0u8; BLOCK_SIZE],
            block_start: 0,
            staged: 0,
            flushed: 0,
            resolver: Some(resolver),
        }
    }

    /// Write the unflushed part of the staged block and publish the block
    fn flush_block(&mut self) -> Result<()> {
        if self.staged == self.flushed {
            return Ok(());
        }
        self.dest.write_bytes(&self.block[self.flushed..self.staged])?;
        self.flushed = self.staged;
        self.cache.update(
            &self.location,
            block_id(self.block_start),
            0,
            &self.block[..self.staged],
        );
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.resolver.is_none() {
            return Err(BlockCacheError::Closed(self.dest.name().to_string()));
        }
        Ok(())
    }
}

impl StorageOutput for CachedOutput {
    fn name(&self) -> &str {
        self.dest.name()
    }

    fn write_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        while !data.is_empty() {
            let n = data.len().min(BLOCK_SIZE - self.staged);
            self.block[self.staged..self.staged + n].copy_from_slice(&data[..n]);
            self.staged += n;
            data = &data[n..];

            if self.staged == BLOCK_SIZE {
                self.flush_block()?;
                self.block_start += BLOCK_SIZE as u64;
                self.staged = 0;
                self.flushed = 0;
            }
        }
        Ok(())
    }

    fn file_pointer(&self) -> u64 {
        self.block_start + self.staged as u64
    }

    fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush_block()?;
        self.dest.flush()
    }

    fn close(&mut self) -> Result<()> {
        let Some(resolver) = self.resolver.take() else {
            return Ok(());
        };
        self.flush_block()?;
        self.dest.close()?;

        match resolver() {
            Ok(cache_name) => {
                self.cache.rename_cache_file(&self.location, &cache_name);
                Ok(())
            }
            Err(e) => {
                // Nobody can reach the staged blocks without a final name
                self.cache.delete(&self.location);
                Err(e)
            }
        }
    }
}
