//! Block Cache
//!
//! A fixed-block memory cache for file-backed index storage, and the storage
//! decorator that turns file reads and writes into block-aligned cache
//! operations.
//!
//! ## Layers
//!
//! - [`slab`] - preallocated banks of fixed-size blocks (heap or anonymous mmap)
//! - [`slot_table`] - lock-free per-bank ownership bitmaps
//! - [`index`] - bounded LRU map from key to block location with an eviction hook
//! - [`block_cache`] - the engine: `store` / `fetch` over single blocks
//! - [`cache`] - the file-level [`Cache`] capability and its implementations
//! - [`directory`] - [`BlockDirectory`], the caching [`Storage`] decorator
//! - [`stream`] - cached input/output adapters used by the decorator
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use blockcache::{
//!     BlockCache, BlockCacheConfig, BlockDirectory, BlockDirectoryCache, DirectoryCacheConfig,
//!     FsStorage, IoContext, Storage,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> blockcache::Result<()> {
//! let engine = Arc::new(BlockCache::new(&BlockCacheConfig {
//!     block_size: blockcache::BLOCK_SIZE,
//!     ..BlockCacheConfig::with_total_memory(256 * 1024 * 1024)
//! })?);
//! let cache = Arc::new(BlockDirectoryCache::new(engine)?);
//!
//! let dir = BlockDirectory::new(
//!     "/var/index",
//!     FsStorage::open("/var/index")?,
//!     cache,
//!     DirectoryCacheConfig::default(),
//! )?;
//!
//! let mut input = dir.open_input("_0.fdt", IoContext::Default)?;
//! let mut header = [0u8; 16];
//! input.read_bytes(&mut header)?;
//! dir.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! read(pos, len)
//!   │
//!   ▼
//! CachedInput ── block id / offset ──► Cache::fetch ──hit──► bank memory
//!   │                                      │
//!   │ miss                                 ▼
//!   ▼                               BlockCache::fetch
//! backend read of the whole block          │
//!   │                                      ▼
//!   └──────────► Cache::update ──► BoundedBlockIndex ─evict─► SlotTable::release
//! ```

pub mod block_cache;
pub mod buffer_store;
pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod index;
pub mod metrics;
pub mod slab;
pub mod slot_table;
pub mod storage;
pub mod stream;

// Re-export commonly used types
pub use block_cache::{BlockCache, BlockCacheKey, ALLOCATION_PASSES};
pub use buffer_store::BufferStore;
pub use cache::{BlockDirectoryCache, Cache, NoCache};
pub use config::{BlockCacheConfig, CacheSettings, DirectoryCacheConfig};
pub use directory::{BlockDirectory, BLOCK_SHIFT, BLOCK_SIZE};
pub use error::{BlockCacheError, Result};
pub use index::{BlockLocation, BoundedBlockIndex, EvictionListener};
pub use metrics::{Metrics, MetricsSnapshot};
pub use storage::{
    FsStorage, IoContext, MemoryStorage, Storage, StorageInput, StorageLock, StorageOutput,
};
pub use stream::{CachedInput, CachedOutput};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
