//! Physical block arena and per-operation block containers
//!
//! Every block touched by the engine is loaded once into a reference-counted
//! slot keyed by its absolute index. Concurrent operations that touch the same
//! block share the slot; each operation holds RAII `Block` handles through its
//! own `BlockContainer`, so references are released on every exit path.
//!
//! # Write-back
//!
//! Writes mark a slot dirty. Dirty slots reach the device on `flush()`, or when
//! `close_unused()` evicts slots that have been unreferenced for longer than
//! the configured idle time.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{Error, Result};

use crate::device::BlockDevice;
use crate::geometry::BlockGeometry;

/// Runtime role of a block. Not persisted; used for consistency checks only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    /// Free-range catalog blocks
    Catalog,
    /// Key index, variable-size key areas and oversized key chains
    Key,
    /// Value chains
    Data,
}

struct PhysicalBlock {
    index: u64,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    refs: AtomicUsize,
    released_at: Mutex<Instant>,
}

impl PhysicalBlock {
    fn write_back(&self, device: &dyn BlockDevice) -> Result<bool> {
        let data = self.data.read();
        if self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = device.write_block(self.index, &data) {
                self.dirty.store(true, Ordering::Release);
                return Err(e);
            }
            return Ok(true);
        }
        Ok(false)
    }
}

/// Shared cache of physical blocks over one device.
pub struct BlockArena {
    device: Arc<dyn BlockDevice>,
    geometry: BlockGeometry,
    slots: Mutex<FxHashMap<u64, Arc<PhysicalBlock>>>,
}

impl BlockArena {
    /// Create an arena over `device`
    pub fn new(device: Arc<dyn BlockDevice>, geometry: BlockGeometry) -> Arc<Self> {
        Arc::new(Self {
            device,
            geometry,
            slots: Mutex::new(FxHashMap::default()),
        })
    }

    /// Layout parameters of the underlying store
    pub fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    /// Acquire a handle on block `index`, loading it from the device if needed.
    pub fn acquire(&self, index: u64) -> Result<Block> {
        self.geometry.check_index(index)?;
        let mut slots = self.slots.lock();
        let slot = match slots.get(&index) {
            Some(slot) => Arc::clone(slot),
            None => {
                let mut buf = vec![0u8; self.geometry.block_size()].into_boxed_slice();
                self.device.read_block(index, &mut buf)?;
                let slot = Arc::new(PhysicalBlock {
                    index,
                    data: RwLock::new(buf),
                    dirty: AtomicBool::new(false),
                    refs: AtomicUsize::new(0),
                    released_at: Mutex::new(Instant::now()),
                });
                slots.insert(index, Arc::clone(&slot));
                slot
            }
        };
        slot.refs.fetch_add(1, Ordering::AcqRel);
        Ok(Block { slot })
    }

    /// Write every dirty block back and flush the device.
    pub fn flush(&self) -> Result<usize> {
        let resident: Vec<Arc<PhysicalBlock>> = self.slots.lock().values().cloned().collect();
        let mut written = 0;
        for slot in resident {
            if slot.write_back(self.device.as_ref())? {
                written += 1;
            }
        }
        self.device.flush()?;
        Ok(written)
    }

    /// Write back and evict blocks unreferenced for at least `idle`.
    ///
    /// Returns the number of evicted blocks.
    pub fn close_unused(&self, idle: Duration) -> Result<usize> {
        let mut slots = self.slots.lock();
        let now = Instant::now();
        let candidates: Vec<u64> = slots
            .values()
            .filter(|slot| {
                slot.refs.load(Ordering::Acquire) == 0
                    && now.duration_since(*slot.released_at.lock()) >= idle
            })
            .map(|slot| slot.index)
            .collect();

        let mut evicted = 0;
        for index in candidates {
            // refs only grow under the slots lock, which we hold
            if let Some(slot) = slots.get(&index) {
                slot.write_back(self.device.as_ref())?;
                slots.remove(&index);
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, resident = slots.len(), "closed unused blocks");
        }
        Ok(evicted)
    }

    /// Number of blocks currently cached
    pub fn resident(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of cached blocks with at least one live handle
    pub fn referenced(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.refs.load(Ordering::Acquire) > 0)
            .count()
    }
}

/// RAII handle on one physical block. Dropping the handle releases the reference.
pub struct Block {
    slot: Arc<PhysicalBlock>,
}

impl Block {
    /// Absolute block index
    pub fn index(&self) -> u64 {
        self.slot.index
    }

    /// Run `f` over the block contents
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.slot.data.read();
        f(&data)
    }

    /// Run `f` over the mutable block contents and mark the block dirty
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.slot.data.write();
        let result = f(&mut data);
        self.slot.dirty.store(true, Ordering::Release);
        result
    }

    /// Zero the whole block
    pub fn zero(&self) {
        self.write(|data| data.fill(0));
    }

    /// Copy of the block contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.read(|data| data.to_vec())
    }
}

impl Clone for Block {
    fn clone(&self) -> Self {
        self.slot.refs.fetch_add(1, Ordering::AcqRel);
        Block {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if self.slot.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            *self.slot.released_at.lock() = Instant::now();
        }
    }
}

/// The blocks one operation currently holds.
///
/// A container is never shared between concurrent operations. Requesting the
/// same block twice returns the same physical slot; requesting it under a
/// different `BlockType` is a consistency violation.
pub struct BlockContainer {
    arena: Arc<BlockArena>,
    blocks: FxHashMap<u64, (BlockType, Block)>,
}

impl BlockContainer {
    /// Start an empty container over `arena`
    pub fn new(arena: Arc<BlockArena>) -> Self {
        Self {
            arena,
            blocks: FxHashMap::default(),
        }
    }

    /// Layout parameters of the underlying store
    pub fn geometry(&self) -> &BlockGeometry {
        self.arena.geometry()
    }

    /// Get a handle on block `index`, typed as `kind`.
    pub fn get(&mut self, index: u64, kind: BlockType) -> Result<Block> {
        if let Some((held, block)) = self.blocks.get(&index) {
            if *held != kind {
                return Err(Error::corruption(format!(
                    "block {} used as {:?} while held as {:?}",
                    index, kind, held
                )));
            }
            return Ok(block.clone());
        }
        let block = self.arena.acquire(index)?;
        self.blocks.insert(index, (kind, block.clone()));
        Ok(block)
    }

    /// Drop the handle on a block that left this operation's ownership (e.g. freed).
    pub fn forget(&mut self, index: u64) {
        self.blocks.remove(&index);
    }

    /// Number of held blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether no block is held
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryBlockDevice;

    fn arena(blocks: u64) -> (Arc<MemoryBlockDevice>, Arc<BlockArena>) {
        let device = Arc::new(MemoryBlockDevice::new(128, blocks));
        let geometry = BlockGeometry::new(128, blocks).unwrap();
        let arena = BlockArena::new(device.clone(), geometry);
        (device, arena)
    }

    #[test]
    fn test_shared_slot_between_handles() {
        let (_device, arena) = arena(8);
        let a = arena.acquire(3).unwrap();
        let b = arena.acquire(3).unwrap();
        a.write(|data| data[0] = 42);
        assert_eq!(b.read(|data| data[0]), 42);
        assert_eq!(arena.resident(), 1);
        assert_eq!(arena.referenced(), 1);
        drop(a);
        drop(b);
        assert_eq!(arena.referenced(), 0);
    }

    #[test]
    fn test_flush_writes_dirty_blocks() {
        let (device, arena) = arena(8);
        let block = arena.acquire(2).unwrap();
        block.write(|data| data[5] = 9);
        assert_eq!(arena.flush().unwrap(), 1);
        assert_eq!(arena.flush().unwrap(), 0);

        let mut buf = vec![0u8; 128];
        device.read_block(2, &mut buf).unwrap();
        assert_eq!(buf[5], 9);
    }

    #[test]
    fn test_close_unused_skips_referenced_blocks() {
        let (device, arena) = arena(8);
        let held = arena.acquire(1).unwrap();
        {
            let released = arena.acquire(2).unwrap();
            released.write(|data| data[0] = 1);
        }
        assert_eq!(arena.close_unused(Duration::ZERO).unwrap(), 1);
        assert_eq!(arena.resident(), 1);

        let mut buf = vec![0u8; 128];
        device.read_block(2, &mut buf).unwrap();
        assert_eq!(buf[0], 1);
        drop(held);
    }

    #[test]
    fn test_close_unused_respects_idle_time() {
        let (_device, arena) = arena(8);
        drop(arena.acquire(4).unwrap());
        assert_eq!(arena.close_unused(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(arena.resident(), 1);
    }

    #[test]
    fn test_container_type_check() {
        let (_device, arena) = arena(8);
        let mut tx = BlockContainer::new(Arc::clone(&arena));
        tx.get(5, BlockType::Key).unwrap();
        tx.get(5, BlockType::Key).unwrap();
        assert!(matches!(
            tx.get(5, BlockType::Data),
            Err(Error::Corruption(_))
        ));
        tx.forget(5);
        tx.get(5, BlockType::Data).unwrap();
        assert_eq!(tx.len(), 1);
    }

    #[test]
    fn test_container_releases_on_drop() {
        let (_device, arena) = arena(8);
        {
            let mut tx = BlockContainer::new(Arc::clone(&arena));
            tx.get(1, BlockType::Catalog).unwrap();
            tx.get(2, BlockType::Catalog).unwrap();
            assert_eq!(arena.referenced(), 2);
        }
        assert_eq!(arena.referenced(), 0);
    }

    #[test]
    fn test_acquire_rejects_out_of_range() {
        let (_device, arena) = arena(8);
        assert!(arena.acquire(8).is_err());
    }
}
