//! Cache configuration
//!
//! Settings are plain immutable structs handed to constructors. They can be
//! built in code or parsed from TOML:
//!
//! ```toml
//! [block_cache]
//! slab_size = 134217728
//! block_size = 8192
//! total_memory = 268435456
//! direct_allocation = true
//!
//! [directory]
//! cacheable_extensions = [".fdt", ".tim"]
//! read_cache_enabled = true
//! write_cache_enabled = false
//! ```

use crate::error::{BlockCacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use validator::Validate;

/// Default slab (bank) size: 128 MiB
pub const DEFAULT_SLAB_SIZE: usize = 128 * 1024 * 1024;

/// Default engine block size: 32 KiB
pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

/// Sizing of the slab pool behind a [`BlockCache`](crate::BlockCache)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BlockCacheConfig {
    /// Size of one bank in bytes
    #[validate(range(min = 1))]
    pub slab_size: usize,

    /// Size of one cached block in bytes
    #[validate(range(min = 1))]
    pub block_size: usize,

    /// Total memory to preallocate; truncated to a whole number of slabs
    #[validate(range(min = 1))]
    pub total_memory: u64,

    /// Back banks with anonymous mappings instead of the heap
    pub direct_allocation: bool,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        BlockCacheConfig {
            slab_size: DEFAULT_SLAB_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            total_memory: DEFAULT_SLAB_SIZE as u64,
            direct_allocation: true,
        }
    }
}

impl BlockCacheConfig {
    /// Config with the default slab and block size for `total_memory` bytes
    pub fn with_total_memory(total_memory: u64) -> Self {
        BlockCacheConfig {
            total_memory,
            ..Default::default()
        }
    }

    /// Config laid out as exactly `banks` banks of `blocks_per_bank` blocks
    pub fn with_layout(banks: usize, blocks_per_bank: usize, block_size: usize) -> Self {
        let slab_size = blocks_per_bank * block_size;
        BlockCacheConfig {
            slab_size,
            block_size,
            total_memory: (banks * slab_size) as u64,
            direct_allocation: false,
        }
    }

    pub fn blocks_per_bank(&self) -> usize {
        self.slab_size / self.block_size
    }

    pub fn bank_count(&self) -> usize {
        (self.total_memory / self.slab_size as u64) as usize
    }

    /// Maximum number of entries in the block index.
    ///
    /// One block is held back so an allocation can always find a free slot
    /// while the evicting insert is still in flight.
    pub fn max_entries(&self) -> usize {
        (self.blocks_per_bank() * self.bank_count()).saturating_sub(1)
    }

    /// Validate sizes and their relationships
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| BlockCacheError::InvalidConfig(e.to_string()))?;

        if self.block_size > self.slab_size {
            return Err(BlockCacheError::InvalidConfig(format!(
                "block_size {} exceeds slab_size {}",
                self.block_size, self.slab_size
            )));
        }
        if self.total_memory < self.slab_size as u64 {
            return Err(BlockCacheError::InvalidConfig(format!(
                "total_memory {} is smaller than one slab ({})",
                self.total_memory, self.slab_size
            )));
        }
        if self.max_entries() == 0 {
            return Err(BlockCacheError::InvalidConfig(
                "cache must hold at least two blocks".to_string(),
            ));
        }
        Ok(())
    }
}

/// Caching policy for a [`BlockDirectory`](crate::BlockDirectory)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryCacheConfig {
    /// File name suffixes eligible for caching; `None` caches every file
    pub cacheable_extensions: Option<BTreeSet<String>>,

    pub read_cache_enabled: bool,

    pub write_cache_enabled: bool,
}

impl Default for DirectoryCacheConfig {
    fn default() -> Self {
        DirectoryCacheConfig {
            cacheable_extensions: None,
            read_cache_enabled: true,
            write_cache_enabled: true,
        }
    }
}

impl DirectoryCacheConfig {
    /// Both read and write caching off
    pub fn disabled() -> Self {
        DirectoryCacheConfig {
            cacheable_extensions: None,
            read_cache_enabled: false,
            write_cache_enabled: false,
        }
    }

    /// Restrict caching to files ending in one of `extensions`
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cacheable_extensions = Some(extensions.into_iter().map(Into::into).collect());
        self.normalized()
    }

    /// An empty extension set means "cache everything"
    pub fn normalized(mut self) -> Self {
        if matches!(&self.cacheable_extensions, Some(set) if set.is_empty()) {
            self.cacheable_extensions = None;
        }
        self
    }

    /// Whether `name` passes the extension allow-list
    pub fn is_cacheable(&self, name: &str) -> bool {
        match &self.cacheable_extensions {
            None => true,
            Some(exts) => exts.iter().any(|ext| name.ends_with(ext.as_str())),
        }
    }
}

/// Complete cache settings as loaded from a TOML file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub block_cache: BlockCacheConfig,
    pub directory: DirectoryCacheConfig,
}

impl CacheSettings {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut settings: CacheSettings = toml::from_str(s)?;
        settings.directory = settings.directory.normalized();
        settings.block_cache.check()?;
        Ok(settings)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BlockCacheConfig::default();
        assert_eq!(config.blocks_per_bank(), 4096);
        assert_eq!(config.bank_count(), 1);
        assert_eq!(config.max_entries(), 4095);
        config.check().unwrap();
    }

    #[test]
    fn test_layout() {
        let config = BlockCacheConfig::with_layout(1, 4, 8);
        assert_eq!(config.slab_size, 32);
        assert_eq!(config.bank_count(), 1);
        assert_eq!(config.blocks_per_bank(), 4);
        assert_eq!(config.max_entries(), 3);
    }

    #[test]
    fn test_invalid_configs() {
        let zero = BlockCacheConfig {
            block_size: 0,
            ..Default::default()
        };
        assert!(matches!(zero.check(), Err(BlockCacheError::InvalidConfig(_))));

        let oversized = BlockCacheConfig {
            slab_size: 1024,
            block_size: 2048,
            total_memory: 4096,
            direct_allocation: false,
        };
        assert!(oversized.check().is_err());

        let single = BlockCacheConfig::with_layout(1, 1, 64);
        assert!(single.check().is_err());
    }

    #[test]
    fn test_extension_filter() {
        let config = DirectoryCacheConfig::default().with_extensions([".fdt", ".tim"]);
        assert!(config.is_cacheable("_0.fdt"));
        assert!(!config.is_cacheable("segments_1"));

        let all = DirectoryCacheConfig::default().with_extensions(Vec::<String>::new());
        assert!(all.cacheable_extensions.is_none());
        assert!(all.is_cacheable("segments_1"));
    }

    #[test]
    fn test_from_toml() {
        let settings = CacheSettings::from_toml_str(
            r#"
            [block_cache]
            slab_size = 65536
            block_size = 8192
            total_memory = 131072
            direct_allocation = false

            [directory]
            cacheable_extensions = []
            write_cache_enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(settings.block_cache.bank_count(), 2);
        assert_eq!(settings.block_cache.blocks_per_bank(), 8);
        assert!(settings.directory.cacheable_extensions.is_none());
        assert!(settings.directory.read_cache_enabled);
        assert!(!settings.directory.write_cache_enabled);
    }

    #[test]
    fn test_from_toml_rejects_bad_sizes() {
        let result = CacheSettings::from_toml_str(
            r#"
            [block_cache]
            slab_size = 1024
            block_size = 4096
            total_memory = 1024
            "#,
        );
        assert!(matches!(result, Err(BlockCacheError::InvalidConfig(_))));

        let garbage = CacheSettings::from_toml_str("block_cache = 3");
        assert!(matches!(garbage, Err(BlockCacheError::ConfigParse(_))));
    }
}
