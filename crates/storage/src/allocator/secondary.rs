use parking_lot::Mutex;
use std::sync::Arc;
use tessera_core::{CacheBounds, Error, Result};

use super::BlockAllocator;
use crate::block::BlockArena;
use crate::catalog::{CachedCatalogBlockOperations, CatalogBlockIndices, CatalogBlockOperations, CatalogHost};
use crate::sequence::AVG_FREE_BLOCK_NUMBER;

/// Blocks kept in reserve by a secondary allocator
pub const SECONDARY_SAFETY_BUFFER: u64 = 5;

/// Per-shard allocator recording every block it took from the root.
///
/// `free_blocks()` is capped by the shard's quota when one is set. `remove()`
/// returns every owned block to the root in one pass.
pub struct SecondaryBlockAllocator {
    root: Arc<dyn BlockAllocator>,
    owned: Mutex<Option<CachedCatalogBlockOperations>>,
    upper_limit: Option<u64>,
}

impl SecondaryBlockAllocator {
    /// Create an allocator with an empty ownership catalog, itself allocated from `root`.
    pub fn create(
        arena: Arc<BlockArena>,
        root: Arc<dyn BlockAllocator>,
        bounds: CacheBounds,
        upper_limit: Option<u64>,
    ) -> Result<Self> {
        let blocks = root.allocate(AVG_FREE_BLOCK_NUMBER as u64)?;
        let host = CatalogHost::External(Arc::clone(&root));
        let backing = match CatalogBlockOperations::create(arena, host, &blocks) {
            Ok(backing) => backing,
            Err(e) => {
                root.free(&blocks)?;
                return Err(e);
            }
        };
        Ok(Self {
            root,
            owned: Mutex::new(Some(CachedCatalogBlockOperations::new(backing, bounds))),
            upper_limit,
        })
    }

    /// Reopen the allocator whose ownership catalog starts at `first`.
    pub fn load(
        arena: Arc<BlockArena>,
        root: Arc<dyn BlockAllocator>,
        bounds: CacheBounds,
        upper_limit: Option<u64>,
        first: u64,
    ) -> Result<Self> {
        let host = CatalogHost::External(Arc::clone(&root));
        let backing = CatalogBlockOperations::load(arena, host, first)?;
        Ok(Self {
            root,
            owned: Mutex::new(Some(CachedCatalogBlockOperations::new(backing, bounds))),
            upper_limit,
        })
    }

    fn removed() -> Error {
        Error::corruption("secondary allocator used after removal")
    }

    /// Root block of the ownership catalog
    pub fn first_block(&self) -> Result<u64> {
        let owned = self.owned.lock();
        owned.as_ref().map(|c| c.first_block()).ok_or_else(Self::removed)
    }

    /// Number of blocks handed out through this allocator and not yet freed
    pub fn owned_blocks(&self) -> u64 {
        self.owned.lock().as_ref().map(|c| c.length()).unwrap_or(0)
    }

    /// Quota in blocks, if any
    pub fn upper_limit(&self) -> Option<u64> {
        self.upper_limit
    }

    /// Persist cached ownership records.
    pub fn flush(&self) -> Result<()> {
        match self.owned.lock().as_mut() {
            Some(catalog) => catalog.close(),
            None => Ok(()),
        }
    }

    /// Return every owned block and the ownership catalog itself to the root.
    ///
    /// Returns the number of blocks released.
    pub fn remove(&self) -> Result<u64> {
        let Some(catalog) = self.owned.lock().take() else {
            return Ok(0);
        };
        let owned = catalog.ranges()?;
        let mut released = owned.len();
        let blocks: Vec<u64> = owned.iter().collect();
        self.root.free(&blocks)?;
        let sequence = catalog.sequence_blocks();
        released += sequence.len() as u64;
        self.root.free(&sequence)?;
        Ok(released)
    }

    fn free_within(&self, owned: u64) -> u64 {
        let root_free = self.root.free_blocks();
        match self.upper_limit {
            Some(limit) => limit.saturating_sub(owned).min(root_free),
            None => root_free,
        }
    }
}

impl BlockAllocator for SecondaryBlockAllocator {
    fn allocate(&self, count: u64) -> Result<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut guard = self.owned.lock();
        let catalog = guard.as_mut().ok_or_else(Self::removed)?;
        let free = self.free_within(catalog.length());
        if free < count + SECONDARY_SAFETY_BUFFER {
            return Err(Error::QuotaExceeded {
                requested: count,
                available: free.saturating_sub(SECONDARY_SAFETY_BUFFER),
            });
        }
        let blocks = self.root.allocate(count)?;
        let set = CatalogBlockIndices::from_indices(blocks.iter().copied())?;
        if let Err(e) = catalog.add_set(&set, true) {
            self.root.free(&blocks)?;
            return Err(e);
        }
        Ok(blocks)
    }

    fn free(&self, blocks: &[u64]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let set = CatalogBlockIndices::from_indices(blocks.iter().copied())?;
        {
            let mut guard = self.owned.lock();
            let catalog = guard.as_mut().ok_or_else(Self::removed)?;
            catalog.remove_set(&set, true)?;
        }
        self.root.free(blocks)
    }

    fn free_blocks(&self) -> u64 {
        let owned = self.owned_blocks();
        self.free_within(owned)
    }
}
