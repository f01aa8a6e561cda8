//! Block allocators
//!
//! - `RootBlockAllocator`: one per store, owns the free pool of the whole file
//! - `SecondaryBlockAllocator`: one per container shard, records which blocks
//!   it pulled from the root and enforces the container's size quota
//!
//! Both refuse an allocation when their free count minus a safety buffer is
//! below the request: satisfying the allocation may itself grow the
//! allocator's own catalog by a block or two.

mod root;
mod secondary;

pub use root::{RootBlockAllocator, ROOT_CATALOG_FIRST_BLOCK, ROOT_SAFETY_BUFFER};
pub use secondary::{SecondaryBlockAllocator, SECONDARY_SAFETY_BUFFER};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tessera_core::Result;

/// Source and sink of physical blocks.
pub trait BlockAllocator: Send + Sync {
    /// Hand out `count` blocks. Either all are returned or none are.
    fn allocate(&self, count: u64) -> Result<Vec<u64>>;

    /// Return `blocks` to the allocator.
    fn free(&self, blocks: &[u64]) -> Result<()>;

    /// Number of blocks this allocator could still hand out, safety buffer included
    fn free_blocks(&self) -> u64;
}

/// Receives every root allocation and free. Used for verification only.
pub trait AllocationObserver: Send + Sync {
    /// Called after `blocks` left the free pool
    fn on_allocate(&self, blocks: &[u64]);

    /// Called after `blocks` returned to the free pool
    fn on_free(&self, blocks: &[u64]);
}

/// Observer that tracks which blocks are currently handed out.
#[derive(Default)]
pub struct RecordingObserver {
    outstanding: Mutex<FxHashSet<u64>>,
    violations: Mutex<Vec<String>>,
}

impl RecordingObserver {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks allocated and not yet freed
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Whether `block` is currently handed out
    pub fn is_outstanding(&self, block: u64) -> bool {
        self.outstanding.lock().contains(&block)
    }

    /// Double allocations and frees of blocks never handed out
    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().clone()
    }
}

impl AllocationObserver for RecordingObserver {
    fn on_allocate(&self, blocks: &[u64]) {
        let mut outstanding = self.outstanding.lock();
        for &block in blocks {
            if !outstanding.insert(block) {
                self.violations
                    .lock()
                    .push(format!("block {} allocated twice", block));
            }
        }
    }

    fn on_free(&self, blocks: &[u64]) {
        let mut outstanding = self.outstanding.lock();
        for &block in blocks {
            if !outstanding.remove(&block) {
                self.violations
                    .lock()
                    .push(format!("block {} freed while not allocated", block));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_tracks_outstanding() {
        let observer = RecordingObserver::new();
        observer.on_allocate(&[1, 2, 3]);
        observer.on_free(&[2]);
        assert_eq!(observer.outstanding(), 2);
        assert!(observer.is_outstanding(3));
        assert!(observer.violations().is_empty());

        observer.on_free(&[2]);
        observer.on_allocate(&[1]);
        assert_eq!(observer.violations().len(), 2);
    }
}
