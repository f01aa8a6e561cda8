//! One store file: device, block arena, root allocator and superblock

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{Result, StoreConfig};

use crate::allocator::{AllocationObserver, BlockAllocator, RootBlockAllocator};
use crate::block::BlockArena;
use crate::device::{BlockDevice, MemoryBlockDevice, MmapBlockDevice};
use crate::geometry::BlockGeometry;
use crate::superblock::{Superblock, SUPERBLOCK_INDEX};

/// Block-level usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStats {
    /// Bytes per block
    pub block_size: usize,
    /// Blocks in the file
    pub total_blocks: u64,
    /// Blocks in the root free pool
    pub free_blocks: u64,
    /// Blocks the root catalog uses for itself
    pub catalog_blocks: u64,
    /// Blocks currently cached in memory
    pub resident_blocks: usize,
}

impl BlockStats {
    /// Blocks handed out to containers and the container list
    pub fn used_blocks(&self) -> u64 {
        self.total_blocks - self.free_blocks
    }
}

/// Block storage substrate of one store.
pub struct BlockStorage {
    arena: Arc<BlockArena>,
    root: Arc<RootBlockAllocator>,
    superblock: Mutex<Superblock>,
}

impl BlockStorage {
    /// Format `device` as an empty store.
    pub fn create(
        device: Arc<dyn BlockDevice>,
        config: &StoreConfig,
        observer: Option<Arc<dyn AllocationObserver>>,
    ) -> Result<Self> {
        config.validate()?;
        let geometry = BlockGeometry::new(device.block_size(), device.total_blocks())?;
        let arena = BlockArena::new(device, geometry);
        let root = Arc::new(RootBlockAllocator::create(
            Arc::clone(&arena),
            config.root_cache,
            observer,
        )?);
        let superblock = Superblock::new(&geometry, root.first_block());
        let storage = Self {
            arena,
            root,
            superblock: Mutex::new(superblock),
        };
        storage.write_superblock()?;
        tracing::info!(
            block_size = geometry.block_size(),
            total_blocks = geometry.total_blocks(),
            "created block storage"
        );
        Ok(storage)
    }

    /// Open the store on `device`.
    pub fn open(
        device: Arc<dyn BlockDevice>,
        config: &StoreConfig,
        observer: Option<Arc<dyn AllocationObserver>>,
    ) -> Result<Self> {
        let mut image = vec![0u8; device.block_size()];
        device.read_block(SUPERBLOCK_INDEX, &mut image)?;
        let superblock = Superblock::decode(&image)?;
        superblock.check_geometry(device.block_size(), device.total_blocks())?;

        let geometry = BlockGeometry::new(device.block_size(), device.total_blocks())?;
        let arena = BlockArena::new(device, geometry);
        let root = Arc::new(RootBlockAllocator::load(
            Arc::clone(&arena),
            config.root_cache,
            observer,
        )?);
        tracing::info!(
            block_size = geometry.block_size(),
            total_blocks = geometry.total_blocks(),
            free_blocks = root.free_blocks(),
            "opened block storage"
        );
        Ok(Self {
            arena,
            root,
            superblock: Mutex::new(superblock),
        })
    }

    /// Fresh heap-backed store sized by `config`
    pub fn in_memory(config: &StoreConfig, observer: Option<Arc<dyn AllocationObserver>>) -> Result<Self> {
        let device = Arc::new(MemoryBlockDevice::new(config.block_size, config.total_blocks()));
        Self::create(device, config, observer)
    }

    /// Fresh file-backed store at `path` sized by `config`
    pub fn create_file(path: &Path, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let device = Arc::new(MmapBlockDevice::create(path, config.block_size, config.total_blocks())?);
        Self::create(device, config, None)
    }

    /// Open the file-backed store at `path`
    pub fn open_file(path: &Path, config: &StoreConfig) -> Result<Self> {
        let device = Arc::new(MmapBlockDevice::open(path, config.block_size)?);
        Self::open(device, config, None)
    }

    /// Shared block cache
    pub fn arena(&self) -> &Arc<BlockArena> {
        &self.arena
    }

    /// Root free pool
    pub fn root(&self) -> &Arc<RootBlockAllocator> {
        &self.root
    }

    /// Layout parameters
    pub fn geometry(&self) -> &BlockGeometry {
        self.arena.geometry()
    }

    /// First block of the container list's key index, once created
    pub fn container_list_start(&self) -> Option<u64> {
        self.superblock.lock().container_list
    }

    /// Record the container list's first block and persist the superblock.
    pub fn set_container_list_start(&self, start: u64) -> Result<()> {
        self.superblock.lock().container_list = Some(start);
        self.write_superblock()
    }

    fn write_superblock(&self) -> Result<()> {
        let image = self.superblock.lock().encode(self.geometry().block_size())?;
        let block = self.arena.acquire(SUPERBLOCK_INDEX)?;
        block.write(|data| data.copy_from_slice(&image));
        Ok(())
    }

    /// Persist the root cache, the superblock and every dirty block.
    pub fn flush(&self) -> Result<()> {
        self.root.flush()?;
        self.write_superblock()?;
        let written = self.arena.flush()?;
        tracing::debug!(written, "flushed block storage");
        Ok(())
    }

    /// Write back and drop cached blocks idle for at least `idle`.
    pub fn close_unused_blocks(&self, idle: Duration) -> Result<usize> {
        self.arena.close_unused(idle)
    }

    /// Current block usage
    pub fn stats(&self) -> BlockStats {
        let geometry = self.geometry();
        BlockStats {
            block_size: geometry.block_size(),
            total_blocks: geometry.total_blocks(),
            free_blocks: self.root.free_blocks(),
            catalog_blocks: self.root.catalog_blocks(),
            resident_blocks: self.arena.resident(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StoreConfig {
        StoreConfig::new()
            .with_block_size(256)
            .with_max_total_size(256 * 1024)
    }

    #[test]
    fn test_create_and_reopen_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.tsr");
        let config = config();

        let free = {
            let storage = BlockStorage::create_file(&path, &config).unwrap();
            let blocks = storage.root().allocate(10).unwrap();
            storage.set_container_list_start(blocks[0]).unwrap();
            storage.flush().unwrap();
            storage.stats().free_blocks
        };

        let storage = BlockStorage::open_file(&path, &config).unwrap();
        assert_eq!(storage.stats().free_blocks, free);
        assert!(storage.container_list_start().is_some());
    }

    #[test]
    fn test_open_rejects_unformatted_device() {
        let device = Arc::new(MemoryBlockDevice::new(256, 1024));
        assert!(BlockStorage::open(device, &config(), None).is_err());
    }

    #[test]
    fn test_stats_account_for_every_block() {
        let storage = BlockStorage::in_memory(&config(), None).unwrap();
        let stats = storage.stats();
        assert_eq!(stats.total_blocks, 1024);
        // superblock + root catalog + free pool
        assert_eq!(1 + stats.catalog_blocks + stats.free_blocks, stats.total_blocks);
        assert_eq!(stats.used_blocks(), 1 + stats.catalog_blocks);
    }
}
