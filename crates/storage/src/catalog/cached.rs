//! Write-behind cache in front of a persistent catalog
//!
//! Allocation traffic mostly touches the in-memory `CatalogBlockIndices`.
//! The backing catalog is only consulted when the cache runs below its
//! minimum or above its maximum, and is brought back to the average of the
//! two bounds.
//!
//! Cached indices exist only in memory: `close()` must run before the store
//! is dropped or they are lost to the free pool.

use tessera_core::{CacheBounds, Error, Result};

use super::indices::CatalogBlockIndices;
use super::operations::CatalogBlockOperations;

/// Persistent catalog with a bounded in-memory cache of ranges.
pub struct CachedCatalogBlockOperations {
    backing: CatalogBlockOperations,
    cache: CatalogBlockIndices,
    bounds: CacheBounds,
}

impl CachedCatalogBlockOperations {
    /// Wrap `backing` with a cache bounded by `bounds`
    pub fn new(backing: CatalogBlockOperations, bounds: CacheBounds) -> Self {
        Self {
            backing,
            cache: CatalogBlockIndices::new(),
            bounds,
        }
    }

    /// Root block of the backing catalog
    pub fn first_block(&self) -> u64 {
        self.backing.first_block()
    }

    /// Number of indices held, cache included
    pub fn length(&self) -> u64 {
        self.cache.len() + self.backing.length()
    }

    /// Number of indices currently cached
    pub fn cached(&self) -> u64 {
        self.cache.len()
    }

    /// Blocks of the backing catalog's own sequence
    pub fn sequence_blocks(&self) -> Vec<u64> {
        self.backing.sequence_blocks()
    }

    /// Take up to `count` indices, cache first.
    pub fn extract_index(&mut self, count: u64, rebalance: bool) -> Result<CatalogBlockIndices> {
        let from_cache = count.min(self.cache.len());
        let mut out = self.cache.extract(from_cache)?;
        if from_cache < count {
            let rest = self.backing.extract_index(count - from_cache, rebalance)?;
            out.add_set(&rest)?;
        }
        if rebalance && self.cache.len() < self.bounds.min {
            let wanted = self.bounds.avg().saturating_sub(self.cache.len());
            let refill = self.backing.extract_index(wanted, true)?;
            self.cache.add_set(&refill)?;
        }
        Ok(out)
    }

    /// Add `[start, stop]`; indices already held anywhere are a structural violation.
    pub fn add(&mut self, start: u64, stop: u64, rebalance: bool) -> Result<()> {
        if self.backing.intersects(start, stop)? {
            return Err(Error::corruption(format!(
                "blocks already in catalog: [{}, {}]",
                start, stop
            )));
        }
        self.cache.add(start, stop)?;
        if rebalance && self.cache.len() > self.bounds.max {
            let excess = self.cache.len() - self.bounds.avg();
            let flushed = self.cache.extract(excess)?;
            self.backing.add_set(&flushed, true)?;
        }
        Ok(())
    }

    /// Add every range of `set`.
    pub fn add_set(&mut self, set: &CatalogBlockIndices, rebalance: bool) -> Result<()> {
        for &(start, stop) in set.ranges() {
            self.add(start, stop, rebalance)?;
        }
        Ok(())
    }

    /// Remove every index of `set`; whatever the cache lacks must be in the backing catalog.
    pub fn remove_set(&mut self, set: &CatalogBlockIndices, rebalance: bool) -> Result<()> {
        let missing = self.cache.remove_set(set)?;
        if !missing.is_empty() {
            self.backing.remove_set(&missing, rebalance)?;
        }
        Ok(())
    }

    /// Whether `index` is held
    pub fn contains(&self, index: u64) -> Result<bool> {
        Ok(self.cache.contains(index) || self.backing.contains(index)?)
    }

    /// Every held range, cache and backing merged
    pub fn ranges(&self) -> Result<CatalogBlockIndices> {
        let mut all = self.backing.ranges()?;
        all.add_set(&self.cache)?;
        Ok(all)
    }

    /// Move every cached range into the backing catalog.
    pub fn flush(&mut self) -> Result<()> {
        if self.cache.is_empty() {
            return Ok(());
        }
        let cached = std::mem::take(&mut self.cache);
        if let Err(e) = self.backing.add_set(&cached, true) {
            self.cache = cached;
            return Err(e);
        }
        Ok(())
    }

    /// Flush the cache; the catalog stays usable.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.backing.rebalance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockArena;
    use crate::catalog::CatalogHost;
    use crate::device::MemoryBlockDevice;
    use crate::geometry::BlockGeometry;
    use std::sync::Arc;

    fn cached(bounds: CacheBounds) -> (Arc<BlockArena>, CachedCatalogBlockOperations) {
        let device = Arc::new(MemoryBlockDevice::new(128, 2048));
        let arena = BlockArena::new(device, BlockGeometry::new(128, 2048).unwrap());
        let backing =
            CatalogBlockOperations::create(Arc::clone(&arena), CatalogHost::SelfHosted, &[1, 2, 3, 4])
                .unwrap();
        (arena, CachedCatalogBlockOperations::new(backing, bounds))
    }

    #[test]
    fn test_extract_refills_cache_to_average() {
        let (_arena, mut catalog) = cached(CacheBounds::new(4, 16));
        catalog.add(100, 199, false).unwrap();
        catalog.flush().unwrap();
        assert_eq!(catalog.cached(), 0);

        let taken = catalog.extract_index(3, true).unwrap();
        assert_eq!(taken.len(), 3);
        assert_eq!(catalog.cached(), 10);
        assert_eq!(catalog.length(), 97);
    }

    #[test]
    fn test_add_spills_excess_to_backing() {
        let (_arena, mut catalog) = cached(CacheBounds::new(4, 16));
        for i in 0..20u64 {
            catalog.add(100 + i * 2, 100 + i * 2, true).unwrap();
        }
        assert!(catalog.cached() <= 16);
        assert_eq!(catalog.length(), 20);
    }

    #[test]
    fn test_double_free_detected_across_layers() {
        let (_arena, mut catalog) = cached(CacheBounds::new(4, 16));
        catalog.add(100, 110, false).unwrap();
        catalog.flush().unwrap();
        assert!(matches!(catalog.add(105, 105, true), Err(Error::Corruption(_))));
        catalog.add(50, 50, false).unwrap();
        assert!(matches!(catalog.add(50, 50, false), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_remove_set_spans_cache_and_backing() {
        let (_arena, mut catalog) = cached(CacheBounds::new(4, 16));
        catalog.add(100, 109, false).unwrap();
        catalog.flush().unwrap();
        catalog.add(110, 112, false).unwrap();

        let set = CatalogBlockIndices::from_range(108, 111).unwrap();
        catalog.remove_set(&set, true).unwrap();
        let left = catalog.ranges().unwrap();
        assert_eq!(left.ranges(), &[(100, 107), (112, 112)]);

        let absent = CatalogBlockIndices::from_range(300, 300).unwrap();
        assert!(catalog.remove_set(&absent, true).is_err());
    }

    #[test]
    fn test_close_persists_cache() {
        let (arena, mut catalog) = cached(CacheBounds::new(4, 16));
        catalog.add(500, 520, false).unwrap();
        catalog.close().unwrap();
        assert_eq!(catalog.cached(), 0);
        let first = catalog.first_block();
        drop(catalog);

        let backing = CatalogBlockOperations::load(arena, CatalogHost::SelfHosted, first).unwrap();
        assert_eq!(backing.length(), 21);
    }
}
