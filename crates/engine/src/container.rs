//! Containers: named groups of shards
//!
//! A container is fixed at creation: its `ContainerMeta` and one
//! `ShardDescriptor` per shard are all that is persisted, serialized together
//! as a `ContainerDescriptor` in the container list.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tessera_core::{CacheBounds, ContainerMeta, Error, Result};
use tessera_storage::{BlockAllocator, BlockArena};
use tracing::warn;

use crate::routing::shard_for_key;
use crate::shard::{ContainerShard, ShardDescriptor};

/// Largest shard count; the routing hash is one byte wide.
pub const MAX_SHARDS: u32 = 256;

/// Everything needed to reopen a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    /// Settings fixed at creation
    pub meta: ContainerMeta,
    /// One entry per shard, in shard order
    pub shards: Vec<ShardDescriptor>,
}

impl ContainerDescriptor {
    /// Serialized form stored in the container list
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse a stored descriptor
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let descriptor: Self = bincode::deserialize(bytes)?;
        if descriptor.shards.len() != descriptor.meta.shard_number as usize {
            return Err(Error::corruption(format!(
                "container descriptor lists {} shards, meta says {}",
                descriptor.shards.len(),
                descriptor.meta.shard_number
            )));
        }
        Ok(descriptor)
    }
}

/// Usage of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStats {
    /// Number of shards
    pub shards: usize,
    /// Entries across every key index, expired ones not yet swept included
    pub keys: usize,
    /// Blocks held by the container's shards
    pub owned_blocks: u64,
}

/// The shards of one container.
pub struct Container {
    name: String,
    meta: ContainerMeta,
    shards: Vec<Arc<ContainerShard>>,
}

fn shard_name(container: &str, index: usize) -> String {
    format!("{}/{}", container, index)
}

impl Container {
    /// Create a container with `meta.shard_number` empty shards.
    ///
    /// If any shard cannot be created, the ones already created are removed.
    pub fn create(
        name: &str,
        meta: ContainerMeta,
        arena: &Arc<BlockArena>,
        root: &Arc<dyn BlockAllocator>,
        bounds: CacheBounds,
    ) -> Result<Self> {
        if meta.shard_number == 0 || meta.shard_number > MAX_SHARDS {
            return Err(Error::invalid_argument(format!(
                "shard number must be within 1..={}, got {}",
                MAX_SHARDS, meta.shard_number
            )));
        }
        let mut shards = Vec::with_capacity(meta.shard_number as usize);
        for index in 0..meta.shard_number as usize {
            match ContainerShard::create(
                shard_name(name, index),
                Arc::clone(arena),
                Arc::clone(root),
                bounds,
                &meta,
            ) {
                Ok(shard) => shards.push(Arc::new(shard)),
                Err(e) => {
                    for created in &shards {
                        if let Err(cleanup) = created.remove() {
                            warn!(shard = %created.name(), error = %cleanup, "rollback of partial container failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            name: name.to_string(),
            meta,
            shards,
        })
    }

    /// Reopen a container from its descriptor.
    pub fn load(
        name: &str,
        descriptor: &ContainerDescriptor,
        arena: &Arc<BlockArena>,
        root: &Arc<dyn BlockAllocator>,
        bounds: CacheBounds,
    ) -> Result<Self> {
        let shards = descriptor
            .shards
            .iter()
            .enumerate()
            .map(|(index, shard)| {
                ContainerShard::load(
                    shard_name(name, index),
                    Arc::clone(arena),
                    Arc::clone(root),
                    bounds,
                    &descriptor.meta,
                    *shard,
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: name.to_string(),
            meta: descriptor.meta,
            shards,
        })
    }

    /// Container name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Settings fixed at creation
    pub fn meta(&self) -> &ContainerMeta {
        &self.meta
    }

    /// Descriptor to persist in the container list
    pub fn descriptor(&self) -> Result<ContainerDescriptor> {
        Ok(ContainerDescriptor {
            meta: self.meta,
            shards: self
                .shards
                .iter()
                .map(|shard| shard.descriptor())
                .collect::<Result<Vec<_>>>()?,
        })
    }

    /// Every shard, in shard order
    pub fn shards(&self) -> &[Arc<ContainerShard>] {
        &self.shards
    }

    /// Index of the shard owning `key`
    pub fn shard_index(&self, key: &[u8]) -> usize {
        shard_for_key(key, self.meta.shard_number)
    }

    /// Persist every shard's caches.
    pub fn flush(&self) -> Result<()> {
        for shard in &self.shards {
            shard.flush()?;
        }
        Ok(())
    }

    /// Return every block of every shard to the root.
    pub fn remove(&self) -> Result<u64> {
        let mut released = 0;
        for shard in &self.shards {
            released += shard.remove()?;
        }
        Ok(released)
    }

    /// Blocks held by the key indexes of every shard
    pub fn index_blocks(&self) -> Result<u64> {
        self.shards.iter().map(|s| s.index_blocks()).sum()
    }

    /// Current usage
    pub fn stats(&self) -> ContainerStats {
        ContainerStats {
            shards: self.shards.len(),
            keys: self.shards.iter().map(|s| s.key_count()).sum(),
            owned_blocks: self.shards.iter().map(|s| s.owned_blocks()).sum(),
        }
    }
}
