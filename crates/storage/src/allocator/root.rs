use parking_lot::Mutex;
use std::sync::Arc;
use tessera_core::{CacheBounds, Error, Result};

use super::{AllocationObserver, BlockAllocator};
use crate::block::BlockArena;
use crate::catalog::{CachedCatalogBlockOperations, CatalogBlockIndices, CatalogBlockOperations, CatalogHost};
use crate::sequence::AVG_FREE_BLOCK_NUMBER;

/// Blocks kept in reserve by the root allocator
pub const ROOT_SAFETY_BUFFER: u64 = 10;

/// First block of the root catalog. Block 0 is the superblock.
pub const ROOT_CATALOG_FIRST_BLOCK: u64 = 1;

/// Free pool of the whole store.
pub struct RootBlockAllocator {
    catalog: Mutex<CachedCatalogBlockOperations>,
    observer: Option<Arc<dyn AllocationObserver>>,
}

impl RootBlockAllocator {
    /// Initialize the free pool of a fresh store.
    ///
    /// Blocks `1..=AVG_FREE_BLOCK_NUMBER` become the root catalog's own sequence;
    /// everything after them is free.
    pub fn create(
        arena: Arc<BlockArena>,
        bounds: CacheBounds,
        observer: Option<Arc<dyn AllocationObserver>>,
    ) -> Result<Self> {
        let total = arena.geometry().total_blocks();
        let bootstrap_end = ROOT_CATALOG_FIRST_BLOCK + AVG_FREE_BLOCK_NUMBER as u64 - 1;
        if total <= bootstrap_end + 1 + ROOT_SAFETY_BUFFER {
            return Err(Error::invalid_argument(format!(
                "{} blocks cannot hold the root catalog and its safety buffer",
                total
            )));
        }
        let bootstrap: Vec<u64> = (ROOT_CATALOG_FIRST_BLOCK..=bootstrap_end).collect();
        let mut backing = CatalogBlockOperations::create(arena, CatalogHost::SelfHosted, &bootstrap)?;
        backing.add(bootstrap_end + 1, total - 1, true)?;
        tracing::debug!(total_blocks = total, free = backing.length(), "root allocator created");
        Ok(Self {
            catalog: Mutex::new(CachedCatalogBlockOperations::new(backing, bounds)),
            observer,
        })
    }

    /// Reopen the free pool of an existing store.
    pub fn load(
        arena: Arc<BlockArena>,
        bounds: CacheBounds,
        observer: Option<Arc<dyn AllocationObserver>>,
    ) -> Result<Self> {
        let backing = CatalogBlockOperations::load(arena, CatalogHost::SelfHosted, ROOT_CATALOG_FIRST_BLOCK)?;
        Ok(Self {
            catalog: Mutex::new(CachedCatalogBlockOperations::new(backing, bounds)),
            observer,
        })
    }

    /// Root block of the root catalog
    pub fn first_block(&self) -> u64 {
        self.catalog.lock().first_block()
    }

    /// Number of blocks the root catalog uses for itself
    pub fn catalog_blocks(&self) -> u64 {
        self.catalog.lock().sequence_blocks().len() as u64
    }

    /// Persist the cache into the root catalog.
    pub fn flush(&self) -> Result<()> {
        self.catalog.lock().close()
    }
}

impl BlockAllocator for RootBlockAllocator {
    fn allocate(&self, count: u64) -> Result<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut catalog = self.catalog.lock();
        let free = catalog.length();
        if free < count + ROOT_SAFETY_BUFFER {
            return Err(Error::QuotaExceeded {
                requested: count,
                available: free.saturating_sub(ROOT_SAFETY_BUFFER),
            });
        }
        let taken = catalog.extract_index(count, true)?;
        if taken.len() < count {
            let available = catalog.length();
            catalog.add_set(&taken, true)?;
            return Err(Error::QuotaExceeded {
                requested: count,
                available,
            });
        }
        let blocks: Vec<u64> = taken.iter().collect();
        drop(catalog);
        if let Some(observer) = &self.observer {
            observer.on_allocate(&blocks);
        }
        Ok(blocks)
    }

    fn free(&self, blocks: &[u64]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let set = CatalogBlockIndices::from_indices(blocks.iter().copied())?;
        self.catalog.lock().add_set(&set, true)?;
        if let Some(observer) = &self.observer {
            observer.on_free(blocks);
        }
        Ok(())
    }

    fn free_blocks(&self) -> u64 {
        self.catalog.lock().length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::RecordingObserver;
    use crate::device::MemoryBlockDevice;
    use crate::geometry::BlockGeometry;

    fn arena(total: u64) -> Arc<BlockArena> {
        let device = Arc::new(MemoryBlockDevice::new(256, total));
        BlockArena::new(device, BlockGeometry::new(256, total).unwrap())
    }

    #[test]
    fn test_create_seeds_everything_after_bootstrap() {
        let root = RootBlockAllocator::create(arena(1000), CacheBounds::new(8, 32), None).unwrap();
        assert_eq!(root.first_block(), ROOT_CATALOG_FIRST_BLOCK);
        assert_eq!(root.free_blocks() + root.catalog_blocks() + 1, 1000);
    }

    #[test]
    fn test_allocate_and_free_conserve_blocks() {
        let observer = Arc::new(RecordingObserver::new());
        let root = RootBlockAllocator::create(
            arena(1000),
            CacheBounds::new(8, 32),
            Some(observer.clone() as Arc<dyn AllocationObserver>),
        )
        .unwrap();
        let before = root.free_blocks() + root.catalog_blocks();

        let a = root.allocate(50).unwrap();
        let b = root.allocate(7).unwrap();
        assert_eq!(a.len(), 50);
        assert!(a.iter().all(|x| !b.contains(x)));
        assert!(a.iter().all(|&x| x > 4));
        assert_eq!(observer.outstanding(), 57);
        assert_eq!(root.free_blocks() + root.catalog_blocks() + 57, before);

        root.free(&a).unwrap();
        root.free(&b).unwrap();
        assert_eq!(observer.outstanding(), 0);
        assert!(observer.violations().is_empty());
        assert_eq!(root.free_blocks() + root.catalog_blocks(), before);
    }

    #[test]
    fn test_safety_buffer_enforced() {
        let root = RootBlockAllocator::create(arena(100), CacheBounds::new(4, 8), None).unwrap();
        let free = root.free_blocks();
        let err = root.allocate(free).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));
        assert_eq!(root.free_blocks(), free);
        assert!(root.allocate(free - ROOT_SAFETY_BUFFER).is_ok());
    }

    #[test]
    fn test_double_free_is_structural_violation() {
        let root = RootBlockAllocator::create(arena(200), CacheBounds::new(4, 8), None).unwrap();
        let blocks = root.allocate(3).unwrap();
        root.free(&blocks).unwrap();
        assert!(matches!(root.free(&blocks), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_flush_and_reload() {
        let arena = arena(500);
        let root = RootBlockAllocator::create(Arc::clone(&arena), CacheBounds::new(8, 32), None).unwrap();
        let held = root.allocate(20).unwrap();
        root.flush().unwrap();
        let free = root.free_blocks();
        drop(root);

        let root = RootBlockAllocator::load(arena, CacheBounds::new(8, 32), None).unwrap();
        assert_eq!(root.free_blocks(), free);
        root.free(&held).unwrap();
    }
}
