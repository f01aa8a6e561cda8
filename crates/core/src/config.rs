//! Store configuration via `tessera.toml`
//!
//! A store is configured by a small TOML file (or programmatically through the
//! `with_*` setters). The block size and capacity are fixed for the lifetime of
//! a store file; the remaining options only affect runtime behavior.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Config file name placed next to a store file.
pub const CONFIG_FILE_NAME: &str = "tessera.toml";

/// Smallest supported block size in bytes.
pub const MIN_BLOCK_SIZE: usize = 128;

/// Largest supported block size in bytes (offsets are stored in two bytes).
pub const MAX_BLOCK_SIZE: usize = 65_536;

/// Bounds of an in-memory catalog cache, in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBounds {
    /// Refill below this size
    pub min: u64,
    /// Flush above this size
    pub max: u64,
}

impl CacheBounds {
    /// Create cache bounds
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    /// Target size after refilling or flushing
    pub fn avg(&self) -> u64 {
        (self.min + self.max) / 2
    }
}

/// Store configuration loaded from `tessera.toml`.
///
/// # Example
///
/// ```toml
/// block_size = 4096
/// max_total_size = 67108864
/// worker_threads = 4
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Bytes per block
    pub block_size: usize,
    /// Capacity of the store file in bytes
    pub max_total_size: u64,
    /// Idle time after which unreferenced cached blocks are written back and dropped
    pub close_unused_blocks_after_millis: u64,
    /// Idle time after which an unused open container is closed
    pub close_unused_sequences_after_millis: u64,
    /// Minimum interval between two maintenance runs of one cleanup manager
    pub cleanup_interval_millis: u64,
    /// Worker threads of the shared operation pool
    pub worker_threads: usize,
    /// Maximum number of queued jobs in the shared pool
    pub max_queue_depth: usize,
    /// Cache bounds of the root allocator's catalog
    pub root_cache: CacheBounds,
    /// Cache bounds of every shard allocator's catalog
    pub secondary_cache: CacheBounds,
    /// Bytes per chunk when streaming values
    pub stream_chunk_size: usize,
    /// Chunks buffered between a stream producer and consumer
    pub stream_channel_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_total_size: 64 * 1024 * 1024,
            close_unused_blocks_after_millis: 60_000,
            close_unused_sequences_after_millis: 300_000,
            cleanup_interval_millis: 1_000,
            worker_threads: 4,
            max_queue_depth: 65_536,
            root_cache: CacheBounds::new(16, 256),
            secondary_cache: CacheBounds::new(4, 64),
            stream_chunk_size: 16 * 1024,
            stream_channel_capacity: 4,
        }
    }
}

impl StoreConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the block size
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the store capacity in bytes
    pub fn with_max_total_size(mut self, max_total_size: u64) -> Self {
        self.max_total_size = max_total_size;
        self
    }

    /// Set the number of pool workers
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Set the maintenance interval
    pub fn with_cleanup_interval_millis(mut self, millis: u64) -> Self {
        self.cleanup_interval_millis = millis;
        self
    }

    /// Set the idle threshold for cached blocks
    pub fn with_close_unused_blocks_after_millis(mut self, millis: u64) -> Self {
        self.close_unused_blocks_after_millis = millis;
        self
    }

    /// Set the idle threshold for open containers
    pub fn with_close_unused_sequences_after_millis(mut self, millis: u64) -> Self {
        self.close_unused_sequences_after_millis = millis;
        self
    }

    /// Set both catalog cache bounds
    pub fn with_cache_bounds(mut self, root: CacheBounds, secondary: CacheBounds) -> Self {
        self.root_cache = root;
        self.secondary_cache = secondary;
        self
    }

    /// Set the streaming chunk size
    pub fn with_stream_chunk_size(mut self, chunk_size: usize) -> Self {
        self.stream_chunk_size = chunk_size;
        self
    }

    /// Number of blocks in the store
    pub fn total_blocks(&self) -> u64 {
        self.max_total_size / self.block_size as u64
    }

    /// Cleanup interval as a duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_millis)
    }

    /// Idle threshold for cached blocks
    pub fn close_unused_blocks_after(&self) -> Duration {
        Duration::from_millis(self.close_unused_blocks_after_millis)
    }

    /// Idle threshold for open containers
    pub fn close_unused_sequences_after(&self) -> Duration {
        Duration::from_millis(self.close_unused_sequences_after_millis)
    }

    /// Check that the configuration describes a usable store.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::invalid_argument(format!(
                "block_size {} outside [{}, {}]",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if self.total_blocks() < 64 {
            return Err(Error::invalid_argument(format!(
                "max_total_size {} holds only {} blocks, need at least 64",
                self.max_total_size,
                self.total_blocks()
            )));
        }
        if self.worker_threads == 0 {
            return Err(Error::invalid_argument("worker_threads must be positive"));
        }
        for (name, bounds) in [("root_cache", self.root_cache), ("secondary_cache", self.secondary_cache)] {
            if bounds.min > bounds.max {
                return Err(Error::invalid_argument(format!(
                    "{}: min {} exceeds max {}",
                    name, bounds.min, bounds.max
                )));
            }
        }
        if self.stream_chunk_size == 0 || self.stream_channel_capacity == 0 {
            return Err(Error::invalid_argument("stream sizes must be positive"));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tessera store configuration
#
# Bytes per block. Fixed for the lifetime of a store file.
block_size = 4096

# Capacity of the store file in bytes. Fixed at creation.
max_total_size = 67108864

# Unreferenced cached blocks idle this long are written back and dropped.
close_unused_blocks_after_millis = 60000

# Open containers idle this long are closed and reopened on next access.
close_unused_sequences_after_millis = 300000

# Minimum interval between two expiry sweeps of a shard.
cleanup_interval_millis = 1000

# Worker threads executing key and value operations.
worker_threads = 4
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StoreConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this config to `path` as TOML.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load the config next to a store, writing the default file if none exists.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            std::fs::write(&path, Self::default_toml())?;
        }
        Self::from_file(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.total_blocks(), 16_384);
    }

    #[test]
    fn test_default_toml_parses_to_default() {
        let parsed: StoreConfig = toml::from_str(StoreConfig::default_toml()).unwrap();
        assert_eq!(parsed, StoreConfig::default());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: StoreConfig = toml::from_str("block_size = 512").unwrap();
        assert_eq!(parsed.block_size, 512);
        assert_eq!(parsed.worker_threads, 4);
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let err = StoreConfig::new().with_block_size(64).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = StoreConfig::new().with_block_size(1 << 20).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_rejects_tiny_store() {
        let err = StoreConfig::new()
            .with_block_size(4096)
            .with_max_total_size(4096 * 10)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = StoreConfig::new().with_block_size(512).with_worker_threads(2);
        config.write_to_file(&path).unwrap();
        assert_eq!(StoreConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_cache_bounds_avg() {
        assert_eq!(CacheBounds::new(4, 64).avg(), 34);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
    }
}
