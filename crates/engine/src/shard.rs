//! One shard of a container
//!
//! A shard owns three things, all reachable from two block indices:
//! - a secondary allocator that records every block the shard holds and
//!   enforces its part of the container quota
//! - the sorted key index mapping keys to records
//! - the value chains the records point at
//!
//! `ContainerShard` itself does no admission control. Callers go through the
//! shard's `ContainerShardExecutor`, which decides which of these methods may
//! run concurrently.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_concurrency::{ValueSink, ValueSource};
use tessera_core::{CacheBounds, ContainerMeta, PutOptions, Record, Result};
use tessera_storage::{
    BlockAllocator, BlockArena, BlockContainer, BlockType, ChainWriter, KeyBlockOperations,
    KeyListing, PutOutcome, SecondaryBlockAllocator, VarSizeMultiBlock,
};
use tracing::debug;

/// Expired entries removed by one sweep run at most.
pub const SWEEP_BUDGET: usize = 64;

/// The two block indices needed to reopen a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    /// First block of the shard allocator's ownership catalog
    pub allocator_start: u64,
    /// First block of the shard's key index
    pub keys_start: u64,
}

/// Key index, allocator and value chains of one shard.
pub struct ContainerShard {
    name: String,
    arena: Arc<BlockArena>,
    allocator: Arc<SecondaryBlockAllocator>,
    keys: RwLock<KeyBlockOperations>,
    values: VarSizeMultiBlock,
    max_ttl: u64,
    sweep_cursor: AtomicUsize,
}

impl ContainerShard {
    /// Create an empty shard whose blocks come from `root`.
    pub fn create(
        name: String,
        arena: Arc<BlockArena>,
        root: Arc<dyn BlockAllocator>,
        bounds: CacheBounds,
        meta: &ContainerMeta,
    ) -> Result<Self> {
        let limit = meta.shard_block_limit(arena.geometry().block_size());
        let allocator = Arc::new(SecondaryBlockAllocator::create(
            Arc::clone(&arena),
            root,
            bounds,
            limit,
        )?);
        let shared: Arc<dyn BlockAllocator> = allocator.clone();
        let keys = match KeyBlockOperations::create(Arc::clone(&arena), shared) {
            Ok(keys) => keys,
            Err(e) => {
                allocator.remove()?;
                return Err(e);
            }
        };
        debug!(shard = %name, quota_blocks = ?limit, "created shard");
        Ok(Self::assemble(name, arena, allocator, keys, meta))
    }

    /// Reopen the shard described by `descriptor`.
    pub fn load(
        name: String,
        arena: Arc<BlockArena>,
        root: Arc<dyn BlockAllocator>,
        bounds: CacheBounds,
        meta: &ContainerMeta,
        descriptor: ShardDescriptor,
    ) -> Result<Self> {
        let limit = meta.shard_block_limit(arena.geometry().block_size());
        let allocator = Arc::new(SecondaryBlockAllocator::load(
            Arc::clone(&arena),
            root,
            bounds,
            limit,
            descriptor.allocator_start,
        )?);
        let shared: Arc<dyn BlockAllocator> = allocator.clone();
        let keys = KeyBlockOperations::load(Arc::clone(&arena), shared, descriptor.keys_start)?;
        Ok(Self::assemble(name, arena, allocator, keys, meta))
    }

    fn assemble(
        name: String,
        arena: Arc<BlockArena>,
        allocator: Arc<SecondaryBlockAllocator>,
        keys: KeyBlockOperations,
        meta: &ContainerMeta,
    ) -> Self {
        Self {
            values: VarSizeMultiBlock::new(*arena.geometry(), BlockType::Data),
            name,
            arena,
            allocator,
            keys: RwLock::new(keys),
            max_ttl: meta.max_ttl,
            sweep_cursor: AtomicUsize::new(0),
        }
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block indices to persist in the container descriptor
    pub fn descriptor(&self) -> Result<ShardDescriptor> {
        Ok(ShardDescriptor {
            allocator_start: self.allocator.first_block()?,
            keys_start: self.keys.read().start_index(),
        })
    }

    fn tx(&self) -> BlockContainer {
        BlockContainer::new(Arc::clone(&self.arena))
    }

    // ========================================================================
    // Key index
    // ========================================================================

    /// Live record of `key` at `now`
    pub fn get_record(&self, key: &[u8], now: u64) -> Result<Option<Record>> {
        self.keys.read().get(key, now)
    }

    /// Install `id` as the value of `key`.
    ///
    /// The record's end-of-life is resolved against the container's `max_ttl`.
    pub fn put_record(&self, key: &[u8], id: u64, options: &PutOptions, now: u64) -> Result<PutOutcome> {
        let eol = options.resolve_eol(now, self.max_ttl);
        self.keys
            .write()
            .put(key, id, eol, options.version, options.options, now)
    }

    /// Remove `key`, expired or not, returning the record it held.
    pub fn remove_record(&self, key: &[u8]) -> Result<Option<Record>> {
        self.keys.write().remove_any(key)
    }

    /// One page of this shard's live keys
    pub fn list(
        &self,
        prefix: &[u8],
        continuation: Option<&[u8]>,
        max_number: usize,
        max_size: usize,
        now: u64,
    ) -> Result<KeyListing> {
        self.keys
            .read()
            .list(prefix, continuation, max_number, max_size, now)
    }

    /// Remove up to `SWEEP_BUDGET` expired entries, resuming where the
    /// previous sweep stopped. Returns the value ids the removed records held.
    pub fn sweep_expired(&self, now: u64) -> Result<Vec<u64>> {
        let mut keys = self.keys.write();
        let blocks = keys.block_count();
        let mut pos = self.sweep_cursor.load(Ordering::Relaxed) % blocks.max(1);
        let mut removed = 0usize;
        let mut garbage = Vec::new();
        for _ in 0..blocks {
            while removed < SWEEP_BUDGET {
                match keys.remove_if_expired(pos, now)? {
                    Some(record) => {
                        removed += 1;
                        if record.has_value() {
                            garbage.push(record.id);
                        }
                    }
                    None => break,
                }
            }
            if removed >= SWEEP_BUDGET {
                break;
            }
            pos = (pos + 1) % keys.block_count().max(1);
        }
        self.sweep_cursor.store(pos, Ordering::Relaxed);
        if removed > 0 {
            debug!(shard = %self.name, removed, "expired entries swept");
        }
        Ok(garbage)
    }

    /// Entries in the key index, expired ones included
    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Store `value` in a new chain. Empty values get no chain.
    ///
    /// Allocation is all-or-nothing: a quota failure leaves no block behind.
    pub fn write_value(&self, value: &[u8]) -> Result<u64> {
        let mut tx = self.tx();
        self.values.store(&mut tx, self.allocator.as_ref(), value)
    }

    /// Store a streamed value in a new chain, growing it as chunks arrive.
    ///
    /// A failing or abandoned stream returns every block written so far.
    pub fn write_value_from(&self, mut source: ValueSource) -> Result<u64> {
        let shared: Arc<dyn BlockAllocator> = self.allocator.clone();
        let mut writer = ChainWriter::new(Arc::clone(&self.arena), shared, BlockType::Data);
        while let Some(chunk) = source.next_chunk()? {
            writer.write(&chunk)?;
        }
        writer.finish()
    }

    /// Whole value of chain `id`
    pub fn read_value(&self, id: u64) -> Result<Vec<u8>> {
        let mut tx = self.tx();
        self.values.read(&mut tx, id)
    }

    /// Push the value of chain `id` into `sink`, chunk by chunk.
    pub fn stream_value(&self, id: u64, sink: &mut ValueSink) -> Result<()> {
        let mut tx = self.tx();
        self.values.for_each_chunk(&mut tx, id, |_, chunk| {
            sink.push(chunk)?;
            Ok(true)
        })
    }

    /// Free chain `id`
    pub fn delete_value(&self, id: u64) -> Result<()> {
        let mut tx = self.tx();
        let freed = self.values.free(&mut tx, self.allocator.as_ref(), id)?;
        debug!(shard = %self.name, value = id, blocks = freed, "value freed");
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Blocks the shard holds, its allocator's own catalog excluded
    pub fn owned_blocks(&self) -> u64 {
        self.allocator.owned_blocks()
    }

    /// Blocks held by the key index, its spare tail and key chains included
    pub fn index_blocks(&self) -> Result<u64> {
        Ok(self.keys.read().occupied_blocks()?.len() as u64)
    }

    /// Quota in blocks, if any
    pub fn block_limit(&self) -> Option<u64> {
        self.allocator.upper_limit()
    }

    /// Trim the key index's spare tail and persist the allocator cache.
    pub fn flush(&self) -> Result<()> {
        self.keys.write().close()?;
        self.allocator.flush()
    }

    /// Return every block of the shard to the root. The shard is unusable
    /// afterwards. Returns the number of blocks released.
    pub fn remove(&self) -> Result<u64> {
        let released = self.allocator.remove()?;
        debug!(shard = %self.name, released, "shard removed");
        Ok(released)
    }
}
