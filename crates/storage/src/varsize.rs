//! Variable-size payload blocks
//!
//! Two layouts share a one-byte preamble:
//!
//! ```text
//! shared area:   [preamble = 0][data_len: offset width][data...]
//! chain block:   [preamble = 4][next: index width][used: u32][data...]
//! ```
//!
//! A shared area packs several short keys of one key block back to back,
//! each addressed by `(offset, len)` relative to the start of the data.
//! A chain spreads one payload (an oversized key or a value) over linked
//! blocks; the preamble of a chain block is the byte width of its `used` field.

use byteorder::{BigEndian, ByteOrder};
use std::cmp::Ordering;
use std::sync::Arc;
use tessera_core::{Error, Result, ID_UNDEFINED};

use crate::allocator::BlockAllocator;
use crate::block::{Block, BlockArena, BlockContainer, BlockType};
use crate::geometry::BlockGeometry;

/// Preamble of a shared variable-size area
pub const VAR_AREA_PREAMBLE: u8 = 0;
/// Preamble of a multi-block chain block
pub const CHAIN_PREAMBLE: u8 = 4;

const CHAIN_USED_BYTES: usize = CHAIN_PREAMBLE as usize;

/// Accessor for shared variable-size areas.
#[derive(Debug, Clone, Copy)]
pub struct VarSizeBlock {
    geometry: BlockGeometry,
}

impl VarSizeBlock {
    /// Accessor for blocks of `geometry`
    pub fn new(geometry: BlockGeometry) -> Self {
        Self { geometry }
    }

    fn header(&self) -> usize {
        1 + self.geometry.bytes_per_block_offset()
    }

    /// Data bytes one area can hold
    pub fn capacity(&self) -> usize {
        self.geometry.block_size() - self.header()
    }

    /// Format `block` as an empty area
    pub fn init(&self, block: &Block) {
        block.write(|data| {
            data.fill(0);
            data[0] = VAR_AREA_PREAMBLE;
        });
    }

    fn check(&self, block: &Block, data: &[u8]) -> Result<()> {
        if data[0] != VAR_AREA_PREAMBLE {
            return Err(Error::corruption(format!(
                "block {} is not a shared variable-size area (preamble {})",
                block.index(),
                data[0]
            )));
        }
        Ok(())
    }

    /// Bytes of data stored in the area
    pub fn data_len(&self, block: &Block) -> Result<usize> {
        block.read(|data| {
            self.check(block, data)?;
            Ok(self.geometry.read_offset(data, 1))
        })
    }

    /// Bytes still available in the area
    pub fn free_space(&self, block: &Block) -> Result<usize> {
        Ok(self.capacity() - self.data_len(block)?)
    }

    /// Append `bytes`, returning their offset within the data.
    pub fn append(&self, block: &Block, bytes: &[u8]) -> Result<usize> {
        let header = self.header();
        let capacity = self.capacity();
        block.write(|data| {
            self.check(block, data)?;
            let len = self.geometry.read_offset(data, 1);
            if len + bytes.len() > capacity {
                return Err(Error::corruption(format!(
                    "variable-size area {} overflow: {} + {} > {}",
                    block.index(),
                    len,
                    bytes.len(),
                    capacity
                )));
            }
            data[header + len..header + len + bytes.len()].copy_from_slice(bytes);
            self.geometry.write_offset(data, 1, len + bytes.len());
            Ok(len)
        })
    }

    /// Copy `len` bytes at `offset`
    pub fn read(&self, block: &Block, offset: usize, len: usize) -> Result<Vec<u8>> {
        let header = self.header();
        block.read(|data| {
            self.check(block, data)?;
            self.bounds(block, data, offset, len)?;
            Ok(data[header + offset..header + offset + len].to_vec())
        })
    }

    /// Compare the stored bytes at `(offset, len)` with `key`
    pub fn compare(&self, block: &Block, offset: usize, len: usize, key: &[u8]) -> Result<Ordering> {
        let header = self.header();
        block.read(|data| {
            self.check(block, data)?;
            self.bounds(block, data, offset, len)?;
            Ok(data[header + offset..header + offset + len].cmp(key))
        })
    }

    fn bounds(&self, block: &Block, data: &[u8], offset: usize, len: usize) -> Result<()> {
        let stored = self.geometry.read_offset(data, 1);
        if offset + len > stored {
            return Err(Error::corruption(format!(
                "entry invalid: [{}, +{}) beyond {} bytes of area {}",
                offset,
                len,
                stored,
                block.index()
            )));
        }
        Ok(())
    }

    /// Cut `(offset, len)` out of the area, shifting later bytes down.
    ///
    /// Returns the remaining data length. Callers fix up every reference past `offset`.
    pub fn remove(&self, block: &Block, offset: usize, len: usize) -> Result<usize> {
        let header = self.header();
        block.write(|data| {
            self.check(block, data)?;
            self.bounds(block, data, offset, len)?;
            let stored = self.geometry.read_offset(data, 1);
            data.copy_within(header + offset + len..header + stored, header + offset);
            let remaining = stored - len;
            data[header + remaining..header + stored].fill(0);
            self.geometry.write_offset(data, 1, remaining);
            Ok(remaining)
        })
    }
}

/// Accessor for multi-block chains of one block type.
#[derive(Debug, Clone, Copy)]
pub struct VarSizeMultiBlock {
    geometry: BlockGeometry,
    kind: BlockType,
}

impl VarSizeMultiBlock {
    /// Accessor for chains of `kind` blocks
    pub fn new(geometry: BlockGeometry, kind: BlockType) -> Self {
        Self { geometry, kind }
    }

    /// Bytes of chain header per block
    pub fn header_size(geometry: &BlockGeometry) -> usize {
        1 + geometry.bytes_per_block_index() + CHAIN_USED_BYTES
    }

    fn header(&self) -> usize {
        Self::header_size(&self.geometry)
    }

    /// Payload bytes per chain block
    pub fn capacity(&self) -> usize {
        self.geometry.block_size() - self.header()
    }

    /// Chain blocks needed for `len` bytes
    pub fn blocks_needed(&self, len: u64) -> u64 {
        let capacity = self.capacity() as u64;
        (len + capacity - 1) / capacity
    }

    fn write_block(&self, block: &Block, next: u64, chunk: &[u8]) {
        let header = self.header();
        let width = self.geometry.bytes_per_block_index();
        block.write(|data| {
            data.fill(0);
            data[0] = CHAIN_PREAMBLE;
            self.geometry.write_index(data, 1, next);
            BigEndian::write_u32(&mut data[1 + width..header], chunk.len() as u32);
            data[header..header + chunk.len()].copy_from_slice(chunk);
        });
    }

    /// Write `payload` across `blocks`, which must be exactly `blocks_needed` long.
    pub fn write(&self, tx: &mut BlockContainer, blocks: &[u64], payload: &[u8]) -> Result<u64> {
        if blocks.len() as u64 != self.blocks_needed(payload.len() as u64) || blocks.is_empty() {
            return Err(Error::corruption(format!(
                "{} blocks supplied for a {}-byte chain",
                blocks.len(),
                payload.len()
            )));
        }
        for (i, chunk) in payload.chunks(self.capacity()).enumerate() {
            let next = blocks.get(i + 1).copied().unwrap_or(0);
            let block = tx.get(blocks[i], self.kind)?;
            self.write_block(&block, next, chunk);
        }
        Ok(blocks[0])
    }

    /// Allocate and write a chain for `payload`. Returns `ID_UNDEFINED` for an empty payload.
    ///
    /// Allocation is all-or-nothing, so a quota failure leaves no blocks behind.
    pub fn store(&self, tx: &mut BlockContainer, allocator: &dyn BlockAllocator, payload: &[u8]) -> Result<u64> {
        if payload.is_empty() {
            return Ok(ID_UNDEFINED);
        }
        let blocks = allocator.allocate(self.blocks_needed(payload.len() as u64))?;
        match self.write(tx, &blocks, payload) {
            Ok(first) => Ok(first),
            Err(e) => {
                allocator.free(&blocks)?;
                Err(e)
            }
        }
    }

    /// Visit every chunk in order; `f` returns false to stop early.
    pub fn for_each_chunk(
        &self,
        tx: &mut BlockContainer,
        first: u64,
        mut f: impl FnMut(u64, &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let header = self.header();
        let width = self.geometry.bytes_per_block_index();
        let mut current = first;
        let mut visited = 0u64;
        while current != 0 {
            visited += 1;
            if visited > self.geometry.total_blocks() {
                return Err(Error::corruption(format!(
                    "chain starting at block {} does not terminate",
                    first
                )));
            }
            let block = tx.get(current, self.kind)?;
            let next = block.read(|data| -> Result<u64> {
                if data[0] != CHAIN_PREAMBLE {
                    return Err(Error::corruption(format!(
                        "entry invalid: block {} is not a chain block (preamble {})",
                        current, data[0]
                    )));
                }
                let used = BigEndian::read_u32(&data[1 + width..header]) as usize;
                if used > data.len() - header {
                    return Err(Error::corruption(format!(
                        "chain block {} claims {} bytes",
                        current, used
                    )));
                }
                let proceed = f(current, &data[header..header + used])?;
                Ok(if proceed {
                    self.geometry.read_index(data, 1)
                } else {
                    0
                })
            })?;
            current = next;
        }
        Ok(())
    }

    /// Whole payload of the chain at `first`
    pub fn read(&self, tx: &mut BlockContainer, first: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.for_each_chunk(tx, first, |_, chunk| {
            out.extend_from_slice(chunk);
            Ok(true)
        })?;
        Ok(out)
    }

    /// Total payload length of the chain at `first`
    pub fn len(&self, tx: &mut BlockContainer, first: u64) -> Result<u64> {
        let mut total = 0u64;
        self.for_each_chunk(tx, first, |_, chunk| {
            total += chunk.len() as u64;
            Ok(true)
        })?;
        Ok(total)
    }

    /// Every block of the chain at `first`
    pub fn chain_blocks(&self, tx: &mut BlockContainer, first: u64) -> Result<Vec<u64>> {
        let mut blocks = Vec::new();
        self.for_each_chunk(tx, first, |index, _| {
            blocks.push(index);
            Ok(true)
        })?;
        Ok(blocks)
    }

    /// Compare the chain's payload with `key` without materializing it.
    pub fn compare(&self, tx: &mut BlockContainer, first: u64, key: &[u8]) -> Result<Ordering> {
        let mut pos = 0usize;
        let mut result = Ordering::Equal;
        self.for_each_chunk(tx, first, |_, chunk| {
            let rest = &key[pos.min(key.len())..];
            let n = chunk.len().min(rest.len());
            match chunk[..n].cmp(&rest[..n]) {
                Ordering::Equal if chunk.len() > rest.len() => {
                    result = Ordering::Greater;
                    Ok(false)
                }
                Ordering::Equal => {
                    pos += n;
                    Ok(true)
                }
                other => {
                    result = other;
                    Ok(false)
                }
            }
        })?;
        if result == Ordering::Equal && pos < key.len() {
            result = Ordering::Less;
        }
        Ok(result)
    }

    /// Return every block of the chain at `first` to `allocator`.
    pub fn free(&self, tx: &mut BlockContainer, allocator: &dyn BlockAllocator, first: u64) -> Result<usize> {
        let blocks = self.chain_blocks(tx, first)?;
        for &index in &blocks {
            tx.forget(index);
        }
        allocator.free(&blocks)?;
        Ok(blocks.len())
    }
}

/// Incremental chain writer for payloads of unknown length.
///
/// Blocks are allocated one at a time as data arrives. A writer dropped before
/// `finish()` returns its blocks to the allocator.
pub struct ChainWriter {
    arena: Arc<BlockArena>,
    allocator: Arc<dyn BlockAllocator>,
    chain: VarSizeMultiBlock,
    blocks: Vec<u64>,
    last: Vec<u8>,
    finished: bool,
}

impl ChainWriter {
    /// Writer allocating `kind` blocks from `allocator`
    pub fn new(arena: Arc<BlockArena>, allocator: Arc<dyn BlockAllocator>, kind: BlockType) -> Self {
        let chain = VarSizeMultiBlock::new(*arena.geometry(), kind);
        Self {
            arena,
            allocator,
            chain,
            blocks: Vec::new(),
            last: Vec::new(),
            finished: false,
        }
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        let full = self.blocks.len().saturating_sub(1) * self.chain.capacity();
        (full + self.last.len()) as u64
    }

    /// Append `data` to the chain.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        let capacity = self.chain.capacity();
        let mut tx = BlockContainer::new(Arc::clone(&self.arena));
        while !data.is_empty() {
            if self.blocks.is_empty() || self.last.len() == capacity {
                let next = self.allocator.allocate(1)?[0];
                let previous = self.blocks.last().copied();
                self.blocks.push(next);
                if let Some(previous) = previous {
                    let block = tx.get(previous, self.chain.kind)?;
                    self.chain.write_block(&block, next, &self.last);
                }
                self.last.clear();
            }
            let n = (capacity - self.last.len()).min(data.len());
            self.last.extend_from_slice(&data[..n]);
            data = &data[n..];
            let current = self.blocks[self.blocks.len() - 1];
            let block = tx.get(current, self.chain.kind)?;
            self.chain.write_block(&block, 0, &self.last);
        }
        Ok(())
    }

    /// Seal the chain and return its first block, or `ID_UNDEFINED` if nothing was written.
    pub fn finish(mut self) -> Result<u64> {
        self.finished = true;
        Ok(self.blocks.first().copied().unwrap_or(ID_UNDEFINED))
    }

    /// Return every allocated block.
    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        let blocks = std::mem::take(&mut self.blocks);
        self.allocator.free(&blocks)
    }
}

impl Drop for ChainWriter {
    fn drop(&mut self) {
        if !self.finished && !self.blocks.is_empty() {
            if let Err(e) = self.allocator.free(&self.blocks) {
                tracing::warn!(blocks = self.blocks.len(), error = %e, "failed to release abandoned chain");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::RootBlockAllocator;
    use crate::device::MemoryBlockDevice;
    use tessera_core::CacheBounds;

    fn setup() -> (Arc<BlockArena>, Arc<RootBlockAllocator>) {
        let device = Arc::new(MemoryBlockDevice::new(128, 500));
        let arena = BlockArena::new(device, BlockGeometry::new(128, 500).unwrap());
        let root = Arc::new(
            RootBlockAllocator::create(Arc::clone(&arena), CacheBounds::new(8, 32), None).unwrap(),
        );
        (arena, root)
    }

    fn pool(root: &RootBlockAllocator) -> u64 {
        root.free_blocks() + root.catalog_blocks()
    }

    #[test]
    fn test_shared_area_append_and_remove() {
        let (arena, root) = setup();
        let area = VarSizeBlock::new(*arena.geometry());
        let index = root.allocate(1).unwrap()[0];
        let block = arena.acquire(index).unwrap();
        area.init(&block);

        let a = area.append(&block, b"alpha").unwrap();
        let b = area.append(&block, b"beta").unwrap();
        let c = area.append(&block, b"gamma").unwrap();
        assert_eq!((a, b, c), (0, 5, 9));
        assert_eq!(area.compare(&block, b, 4, b"beta").unwrap(), Ordering::Equal);
        assert_eq!(area.compare(&block, b, 4, b"betb").unwrap(), Ordering::Less);

        assert_eq!(area.remove(&block, b, 4).unwrap(), 10);
        assert_eq!(area.read(&block, 5, 5).unwrap(), b"gamma");
        assert!(area.read(&block, 8, 5).is_err());
        assert_eq!(area.free_space(&block).unwrap(), area.capacity() - 10);
    }

    #[test]
    fn test_shared_area_overflow_rejected() {
        let (arena, root) = setup();
        let area = VarSizeBlock::new(*arena.geometry());
        let block = arena.acquire(root.allocate(1).unwrap()[0]).unwrap();
        area.init(&block);
        area.append(&block, &vec![1u8; area.capacity()]).unwrap();
        assert!(area.append(&block, b"x").is_err());
    }

    #[test]
    fn test_chain_store_read_free() {
        let (arena, root) = setup();
        let chain = VarSizeMultiBlock::new(*arena.geometry(), BlockType::Data);
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let free_before = pool(&root);

        let mut tx = BlockContainer::new(Arc::clone(&arena));
        let first = chain.store(&mut tx, root.as_ref(), &payload).unwrap();
        assert_eq!(chain.read(&mut tx, first).unwrap(), payload);
        assert_eq!(chain.len(&mut tx, first).unwrap(), 1000);
        let blocks = chain.chain_blocks(&mut tx, first).unwrap();
        assert_eq!(blocks.len() as u64, chain.blocks_needed(1000));

        assert_eq!(chain.compare(&mut tx, first, &payload).unwrap(), Ordering::Equal);
        assert_eq!(chain.compare(&mut tx, first, &payload[..999]).unwrap(), Ordering::Greater);
        let mut longer = payload.clone();
        longer.push(0);
        assert_eq!(chain.compare(&mut tx, first, &longer).unwrap(), Ordering::Less);
        let mut bigger = payload.clone();
        bigger[500] = 255;
        assert_eq!(chain.compare(&mut tx, first, &bigger).unwrap(), Ordering::Less);

        chain.free(&mut tx, root.as_ref(), first).unwrap();
        assert_eq!(pool(&root), free_before);
    }

    #[test]
    fn test_empty_payload_has_no_chain() {
        let (arena, root) = setup();
        let chain = VarSizeMultiBlock::new(*arena.geometry(), BlockType::Data);
        let mut tx = BlockContainer::new(arena);
        assert_eq!(chain.store(&mut tx, root.as_ref(), b"").unwrap(), ID_UNDEFINED);
    }

    #[test]
    fn test_chain_writer_streams_and_aborts() {
        let (arena, root) = setup();
        let free_before = pool(&root);
        let chain = VarSizeMultiBlock::new(*arena.geometry(), BlockType::Data);

        let mut writer = ChainWriter::new(Arc::clone(&arena), root.clone(), BlockType::Data);
        let pieces: [&[u8]; 3] = [b"hello ", &[7u8; 300], b"world"];
        for piece in pieces {
            writer.write(piece).unwrap();
        }
        assert_eq!(writer.written(), 311);
        let first = writer.finish().unwrap();
        let mut tx = BlockContainer::new(Arc::clone(&arena));
        let data = chain.read(&mut tx, first).unwrap();
        assert_eq!(data.len(), 311);
        assert!(data.starts_with(b"hello "));
        assert!(data.ends_with(b"world"));
        chain.free(&mut tx, root.as_ref(), first).unwrap();

        let mut writer = ChainWriter::new(Arc::clone(&arena), root.clone(), BlockType::Data);
        writer.write(&[1u8; 500]).unwrap();
        writer.abort().unwrap();
        assert_eq!(pool(&root), free_before);

        let mut writer = ChainWriter::new(arena, root.clone(), BlockType::Data);
        writer.write(&[1u8; 500]).unwrap();
        drop(writer);
        assert_eq!(pool(&root), free_before);
    }
}
