//! Container metadata and wall-clock helpers

use serde::{Deserialize, Serialize};

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Per-container settings fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMeta {
    /// Number of shards keys are routed across
    pub shard_number: u32,
    /// Storage quota in bytes, 0 = unlimited
    pub max_size: u64,
    /// Upper bound on record time-to-live in seconds, 0 = unlimited
    pub max_ttl: u64,
    /// Unix seconds at creation
    pub creation_time: u64,
}

impl ContainerMeta {
    /// Unlimited container with `shard_number` shards, created now
    pub fn new(shard_number: u32) -> Self {
        Self {
            shard_number,
            max_size: 0,
            max_ttl: 0,
            creation_time: now_secs(),
        }
    }

    /// Set the storage quota in bytes
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the maximum record time-to-live in seconds
    pub fn with_max_ttl(mut self, max_ttl: u64) -> Self {
        self.max_ttl = max_ttl;
        self
    }

    /// Per-shard block limit derived from `max_size`, `None` when unlimited.
    pub fn shard_block_limit(&self, block_size: usize) -> Option<u64> {
        if self.max_size == 0 {
            return None;
        }
        let shards = u64::from(self.shard_number.max(1));
        let blocks = self.max_size / block_size as u64;
        Some((blocks + shards - 1) / shards)
    }
}
