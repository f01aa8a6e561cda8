//! Block substrate for Tessera
//!
//! Everything a store persists lives in fixed-size blocks of one file:
//! - BlockDevice / BlockArena: raw block I/O and the shared, refcounted block cache
//! - BlockContainer: per-operation view of typed blocks
//! - CatalogBlockOperations: persistent sets of free block ranges
//! - RootBlockAllocator / SecondaryBlockAllocator: the store free pool and per-shard quotas
//! - BlockSequence: linked block lists with a spare tail
//! - VarSizeBlock / VarSizeMultiBlock: shared byte areas and value chains
//! - KeyBlockOperations: the sorted key index of a shard
//! - BlockStorage: superblock plus root allocator over one device

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod block;
pub mod catalog;
pub mod device;
pub mod geometry;
pub mod keys;
pub mod sequence;
pub mod store;
pub mod superblock;
pub mod varsize;

pub use allocator::{
    AllocationObserver, BlockAllocator, RecordingObserver, RootBlockAllocator,
    SecondaryBlockAllocator,
};
pub use block::{Block, BlockArena, BlockContainer, BlockType};
pub use catalog::{CachedCatalogBlockOperations, CatalogBlockIndices, CatalogBlockOperations, CatalogHost};
pub use device::{BlockDevice, MemoryBlockDevice, MmapBlockDevice};
pub use geometry::BlockGeometry;
pub use keys::{KeyBlockLayout, KeyBlockOperations, KeyCursor, KeyEntry, KeyListing, PutOutcome};
pub use sequence::BlockSequence;
pub use store::{BlockStats, BlockStorage};
pub use superblock::Superblock;
pub use varsize::{ChainWriter, VarSizeBlock, VarSizeMultiBlock};
