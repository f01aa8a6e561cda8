//! Persistent free-range catalog over a block sequence
//!
//! Each CATALOG block stores fixed-size `(start, stop)` entries:
//!
//! ```text
//! [next: w][count: u16][added_number: u64][start: w][stop: w]...
//! ```
//!
//! where `w` is the store's block index width. Only the root block's
//! `added_number` is meaningful: it always equals the total number of indices
//! held across all entries and is verified on load.
//!
//! Entries are sorted across the whole sequence and coalesced like
//! `CatalogBlockIndices`. Mutations keep an in-memory summary (entry count
//! and last stop) per used block so locating a value costs one binary search
//! over summaries plus one within the block.
//!
//! After every mutation, near-empty neighbors are collapsed. The sequence's
//! free tail is rebalanced when the caller asks for it, either against the
//! catalog's own free entries (self-hosted, the root catalog) or against an
//! external allocator (secondary catalogs).

use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;
use tessera_core::{Error, Result};

use super::indices::CatalogBlockIndices;
use crate::allocator::BlockAllocator;
use crate::block::{BlockArena, BlockContainer, BlockType};
use crate::geometry::BlockGeometry;
use crate::sequence::BlockSequence;

const COUNT_BYTES: usize = 2;
const ADDED_NUMBER_BYTES: usize = 8;

/// Where a catalog takes its own sequence blocks from.
#[derive(Clone)]
pub enum CatalogHost {
    /// Grow and shrink the sequence from the catalog's own free entries
    SelfHosted,
    /// Grow and shrink the sequence through another allocator
    External(Arc<dyn BlockAllocator>),
}

impl std::fmt::Debug for CatalogHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogHost::SelfHosted => write!(f, "SelfHosted"),
            CatalogHost::External(_) => write!(f, "External"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Summary {
    count: usize,
    last: u64,
}

#[derive(Debug, Clone, Copy)]
struct CatalogLayout {
    geometry: BlockGeometry,
    header: usize,
    capacity: usize,
}

impl CatalogLayout {
    fn new(geometry: BlockGeometry) -> Result<Self> {
        let width = geometry.bytes_per_block_index();
        let header = width + COUNT_BYTES + ADDED_NUMBER_BYTES;
        let capacity = (geometry.block_size() - header) / (2 * width);
        if capacity < 4 {
            return Err(Error::invalid_argument(format!(
                "block size {} leaves room for only {} catalog entries",
                geometry.block_size(),
                capacity
            )));
        }
        Ok(Self {
            geometry,
            header,
            capacity,
        })
    }

    fn count(&self, data: &[u8]) -> usize {
        let offset = self.geometry.bytes_per_block_index();
        BigEndian::read_u16(&data[offset..offset + COUNT_BYTES]) as usize
    }

    fn added_number(&self, data: &[u8]) -> u64 {
        let offset = self.geometry.bytes_per_block_index() + COUNT_BYTES;
        BigEndian::read_u64(&data[offset..offset + ADDED_NUMBER_BYTES])
    }

    fn set_added_number(&self, data: &mut [u8], value: u64) {
        let offset = self.geometry.bytes_per_block_index() + COUNT_BYTES;
        BigEndian::write_u64(&mut data[offset..offset + ADDED_NUMBER_BYTES], value);
    }

    fn entries(&self, data: &[u8]) -> Vec<(u64, u64)> {
        let width = self.geometry.bytes_per_block_index();
        (0..self.count(data))
            .map(|i| {
                let at = self.header + i * 2 * width;
                (
                    self.geometry.read_index(data, at),
                    self.geometry.read_index(data, at + width),
                )
            })
            .collect()
    }

    fn store(&self, data: &mut [u8], entries: &[(u64, u64)]) {
        let width = self.geometry.bytes_per_block_index();
        let offset = width;
        BigEndian::write_u16(&mut data[offset..offset + COUNT_BYTES], entries.len() as u16);
        for (i, &(start, stop)) in entries.iter().enumerate() {
            let at = self.header + i * 2 * width;
            self.geometry.write_index(data, at, start);
            self.geometry.write_index(data, at + width, stop);
        }
        let tail = self.header + entries.len() * 2 * width;
        data[tail..].fill(0);
    }
}

fn summarize(entries: &[(u64, u64)]) -> Summary {
    match entries.last() {
        Some(last) => Summary {
            count: entries.len(),
            last: last.1,
        },
        None => Summary::default(),
    }
}

/// Persistent, sorted, coalesced set of block ranges.
///
/// Not internally synchronized: owners serialize access.
pub struct CatalogBlockOperations {
    arena: Arc<BlockArena>,
    layout: CatalogLayout,
    host: CatalogHost,
    sequence: BlockSequence,
    summaries: Vec<Summary>,
    added_number: u64,
}

impl CatalogBlockOperations {
    /// Create an empty catalog over `blocks` (at least one).
    pub fn create(arena: Arc<BlockArena>, host: CatalogHost, blocks: &[u64]) -> Result<Self> {
        let layout = CatalogLayout::new(*arena.geometry())?;
        let mut tx = BlockContainer::new(Arc::clone(&arena));
        let sequence = BlockSequence::create(&mut tx, BlockType::Catalog, blocks)?;
        Ok(Self {
            arena,
            layout,
            host,
            sequence,
            summaries: vec![Summary::default()],
            added_number: 0,
        })
    }

    /// Reopen the catalog whose root block is `first`.
    pub fn load(arena: Arc<BlockArena>, host: CatalogHost, first: u64) -> Result<Self> {
        let layout = CatalogLayout::new(*arena.geometry())?;
        let mut tx = BlockContainer::new(Arc::clone(&arena));
        let sequence =
            BlockSequence::load(&mut tx, BlockType::Catalog, first, |data| layout.count(data) == 0)?;

        let mut summaries = Vec::with_capacity(sequence.used_len());
        let mut total = 0u64;
        for pos in 0..sequence.used_len() {
            let entries = tx
                .get(sequence.block_at(pos), BlockType::Catalog)?
                .read(|data| layout.entries(data));
            total += entries.iter().map(|&(s, e)| e - s + 1).sum::<u64>();
            summaries.push(summarize(&entries));
        }
        let added_number = tx
            .get(first, BlockType::Catalog)?
            .read(|data| layout.added_number(data));
        if added_number != total {
            return Err(Error::corruption(format!(
                "catalog at block {} records {} indices but holds {}",
                first, added_number, total
            )));
        }
        Ok(Self {
            arena,
            layout,
            host,
            sequence,
            summaries,
            added_number,
        })
    }

    /// Root block of the catalog
    pub fn first_block(&self) -> u64 {
        self.sequence.first()
    }

    /// Number of indices held
    pub fn length(&self) -> u64 {
        self.added_number
    }

    /// Entries per catalog block
    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    /// Number of catalog blocks holding entries
    pub fn used_blocks(&self) -> usize {
        self.sequence.used_len()
    }

    /// Every block of the catalog's own sequence, free tail included
    pub fn sequence_blocks(&self) -> Vec<u64> {
        self.sequence.blocks().to_vec()
    }

    fn is_catalog_empty(&self) -> bool {
        self.summaries.len() == 1 && self.summaries[0].count == 0
    }

    fn locate(&self, value: u64) -> usize {
        let pos = self.summaries.partition_point(|s| s.last < value);
        pos.min(self.summaries.len() - 1)
    }

    fn entries(&self, tx: &mut BlockContainer, pos: usize) -> Result<Vec<(u64, u64)>> {
        let layout = self.layout;
        Ok(tx
            .get(self.sequence.block_at(pos), BlockType::Catalog)?
            .read(|data| layout.entries(data)))
    }

    fn store(&mut self, tx: &mut BlockContainer, pos: usize, entries: &[(u64, u64)]) -> Result<()> {
        let layout = self.layout;
        tx.get(self.sequence.block_at(pos), BlockType::Catalog)?
            .write(|data| layout.store(data, entries));
        self.summaries[pos] = summarize(entries);
        Ok(())
    }

    fn write_added_number(&mut self, tx: &mut BlockContainer) -> Result<()> {
        let layout = self.layout;
        let value = self.added_number;
        tx.get(self.sequence.first(), BlockType::Catalog)?
            .write(|data| layout.set_added_number(data, value));
        Ok(())
    }

    /// Store `entries` at `pos`, splitting into a new block when they overflow
    /// and deleting the block when they are empty.
    fn store_or_split(&mut self, tx: &mut BlockContainer, pos: usize, mut entries: Vec<(u64, u64)>) -> Result<()> {
        if entries.is_empty() {
            return self.delete_block(tx, pos);
        }
        if entries.len() <= self.layout.capacity {
            return self.store(tx, pos, &entries);
        }
        let upper = entries.split_off(entries.len() / 2);
        self.sequence.add_free_block(tx, pos)?;
        self.summaries.insert(pos + 1, Summary::default());
        self.store(tx, pos, &entries)?;
        self.store(tx, pos + 1, &upper)
    }

    fn delete_block(&mut self, tx: &mut BlockContainer, pos: usize) -> Result<()> {
        if pos == 0 {
            if self.summaries.len() == 1 {
                return self.store(tx, 0, &[]);
            }
            let moved = self.entries(tx, 1)?;
            self.store(tx, 0, &moved)?;
            self.sequence.remove_free_block(tx, 1)?;
            self.summaries.remove(1);
            return Ok(());
        }
        self.sequence.remove_free_block(tx, pos)?;
        self.summaries.remove(pos);
        Ok(())
    }

    /// Merge `pos` into its left neighbor, or its right neighbor into `pos`,
    /// when the pair fits in half a block.
    fn collapse(&mut self, tx: &mut BlockContainer, pos: usize) -> Result<()> {
        let half = self.layout.capacity / 2;
        let pos = pos.min(self.summaries.len() - 1);
        let pair = if pos > 0 && self.summaries[pos - 1].count + self.summaries[pos].count <= half {
            Some(pos - 1)
        } else if pos + 1 < self.summaries.len()
            && self.summaries[pos].count + self.summaries[pos + 1].count <= half
        {
            Some(pos)
        } else {
            None
        };
        if let Some(left) = pair {
            let mut merged = self.entries(tx, left)?;
            merged.extend(self.entries(tx, left + 1)?);
            self.store(tx, left, &merged)?;
            self.sequence.remove_free_block(tx, left + 1)?;
            self.summaries.remove(left + 1);
        }
        Ok(())
    }

    fn ensure_spare(&mut self, tx: &mut BlockContainer) -> Result<()> {
        if self.sequence.free_len() == 0 {
            self.rebalance_with(tx)?;
        }
        Ok(())
    }

    fn rebalance_with(&mut self, tx: &mut BlockContainer) -> Result<()> {
        if let CatalogHost::External(allocator) = &self.host {
            let allocator = Arc::clone(allocator);
            return self.sequence.rebalance(tx, allocator.as_ref());
        }
        let delta = self.sequence.rebalance_delta();
        if delta > 0 {
            let wanted = (delta as u64).min(self.added_number);
            let taken = self.extract_in(tx, wanted)?;
            let blocks: Vec<u64> = taken.iter().collect();
            self.sequence.extend_tail(tx, &blocks)?;
        } else if delta < 0 {
            let released = self.sequence.release_tail(tx, (-delta) as usize)?;
            let released = CatalogBlockIndices::from_indices(released)?;
            for &(start, stop) in released.ranges() {
                self.add_in(tx, start, stop)?;
            }
        }
        Ok(())
    }

    fn add_in(&mut self, tx: &mut BlockContainer, start: u64, stop: u64) -> Result<()> {
        if start > stop {
            return Err(Error::invalid_argument(format!(
                "range [{}, {}] is inverted",
                start, stop
            )));
        }
        self.ensure_spare(tx)?;
        let added = stop - start + 1;

        if self.is_catalog_empty() {
            self.store(tx, 0, &[(start, stop)])?;
            self.added_number += added;
            return self.write_added_number(tx);
        }

        let pos = self.locate(start);
        let mut entries = self.entries(tx, pos)?;
        let idx = entries.partition_point(|&(_, e)| e < start);
        if idx < entries.len() && entries[idx].0 <= stop {
            return Err(Error::corruption(format!(
                "blocks already in catalog: [{}, {}] overlaps [{}, {}]",
                start, stop, entries[idx].0, entries[idx].1
            )));
        }

        let left_in_previous = idx == 0 && pos > 0;
        let merge_left = if idx > 0 {
            entries[idx - 1].1 + 1 == start
        } else {
            left_in_previous && self.summaries[pos - 1].last + 1 == start
        };
        let merge_right = idx < entries.len() && stop.checked_add(1) == Some(entries[idx].0);

        match (merge_left, merge_right) {
            (true, true) if !left_in_previous => {
                entries[idx - 1].1 = entries[idx].1;
                entries.remove(idx);
                self.store(tx, pos, &entries)?;
            }
            (true, true) => {
                let mut previous = self.entries(tx, pos - 1)?;
                if let Some(last) = previous.last_mut() {
                    last.1 = entries[0].1;
                }
                self.store(tx, pos - 1, &previous)?;
                entries.remove(0);
                self.store_or_split(tx, pos, entries)?;
            }
            (true, false) if !left_in_previous => {
                entries[idx - 1].1 = stop;
                self.store(tx, pos, &entries)?;
            }
            (true, false) => {
                let mut previous = self.entries(tx, pos - 1)?;
                if let Some(last) = previous.last_mut() {
                    last.1 = stop;
                }
                self.store(tx, pos - 1, &previous)?;
            }
            (false, true) => {
                entries[idx].0 = start;
                self.store(tx, pos, &entries)?;
            }
            (false, false) => {
                let full = entries.len() >= self.layout.capacity;
                if full && left_in_previous && self.summaries[pos - 1].count < self.layout.capacity {
                    // before the first entry of a full block: append to the previous one
                    let mut previous = self.entries(tx, pos - 1)?;
                    previous.push((start, stop));
                    self.store(tx, pos - 1, &previous)?;
                } else if full && idx == entries.len() && pos + 1 == self.summaries.len() {
                    // past the end of the last full block: open a new tail block
                    self.sequence.add_free_block(tx, pos)?;
                    self.summaries.insert(pos + 1, Summary::default());
                    self.store(tx, pos + 1, &[(start, stop)])?;
                } else {
                    entries.insert(idx, (start, stop));
                    self.store_or_split(tx, pos, entries)?;
                }
            }
        }

        self.added_number += added;
        self.write_added_number(tx)?;
        self.collapse(tx, pos)
    }

    fn remove_in(&mut self, tx: &mut BlockContainer, start: u64, stop: u64) -> Result<()> {
        if start > stop {
            return Err(Error::invalid_argument(format!(
                "range [{}, {}] is inverted",
                start, stop
            )));
        }
        self.ensure_spare(tx)?;
        let pos = self.locate(start);
        let mut entries = self.entries(tx, pos)?;
        let idx = entries.partition_point(|&(_, e)| e < start);
        if idx >= entries.len() || entries[idx].0 > start || entries[idx].1 < stop {
            return Err(Error::corruption(format!(
                "blocks [{}, {}] not in catalog",
                start, stop
            )));
        }
        let (first, last) = entries[idx];
        match (first == start, last == stop) {
            (true, true) => {
                entries.remove(idx);
            }
            (true, false) => entries[idx].0 = stop + 1,
            (false, true) => entries[idx].1 = start - 1,
            (false, false) => {
                entries[idx].1 = start - 1;
                entries.insert(idx + 1, (stop + 1, last));
            }
        }
        self.store_or_split(tx, pos, entries)?;
        self.added_number -= stop - start + 1;
        self.write_added_number(tx)?;
        self.collapse(tx, pos)
    }

    fn extract_in(&mut self, tx: &mut BlockContainer, count: u64) -> Result<CatalogBlockIndices> {
        let mut out = CatalogBlockIndices::new();
        let mut remaining = count;
        while remaining > 0 && !self.is_catalog_empty() {
            let pos = self.summaries.len() - 1;
            let mut entries = self.entries(tx, pos)?;
            while remaining > 0 {
                let Some(last) = entries.last_mut() else {
                    break;
                };
                let size = last.1 - last.0 + 1;
                if size <= remaining {
                    out.add(last.0, last.1)?;
                    entries.pop();
                    remaining -= size;
                } else {
                    let cut = last.1 - remaining + 1;
                    out.add(cut, last.1)?;
                    last.1 = cut - 1;
                    remaining = 0;
                }
            }
            if entries.is_empty() {
                self.delete_block(tx, pos)?;
            } else {
                self.store(tx, pos, &entries)?;
            }
        }
        self.added_number -= out.len();
        self.write_added_number(tx)?;
        Ok(out)
    }

    /// Add `[start, stop]`; overlap with stored indices is a structural violation.
    pub fn add(&mut self, start: u64, stop: u64, rebalance: bool) -> Result<()> {
        let mut tx = BlockContainer::new(Arc::clone(&self.arena));
        self.add_in(&mut tx, start, stop)?;
        if rebalance {
            self.rebalance_with(&mut tx)?;
        }
        Ok(())
    }

    /// Add every range of `set`.
    pub fn add_set(&mut self, set: &CatalogBlockIndices, rebalance: bool) -> Result<()> {
        let mut tx = BlockContainer::new(Arc::clone(&self.arena));
        for &(start, stop) in set.ranges() {
            self.add_in(&mut tx, start, stop)?;
        }
        if rebalance {
            self.rebalance_with(&mut tx)?;
        }
        Ok(())
    }

    /// Remove `[start, stop]`, which must lie inside one stored range.
    pub fn remove(&mut self, start: u64, stop: u64, rebalance: bool) -> Result<()> {
        let mut tx = BlockContainer::new(Arc::clone(&self.arena));
        self.remove_in(&mut tx, start, stop)?;
        if rebalance {
            self.rebalance_with(&mut tx)?;
        }
        Ok(())
    }

    /// Remove every range of `set`; each must be fully present.
    pub fn remove_set(&mut self, set: &CatalogBlockIndices, rebalance: bool) -> Result<()> {
        let mut tx = BlockContainer::new(Arc::clone(&self.arena));
        for &(start, stop) in set.ranges() {
            self.remove_in(&mut tx, start, stop)?;
        }
        if rebalance {
            self.rebalance_with(&mut tx)?;
        }
        Ok(())
    }

    /// Take up to `count` indices from the high end.
    ///
    /// Returns fewer than `count` when the catalog runs out.
    pub fn extract_index(&mut self, count: u64, rebalance: bool) -> Result<CatalogBlockIndices> {
        let mut tx = BlockContainer::new(Arc::clone(&self.arena));
        let out = self.extract_in(&mut tx, count)?;
        if rebalance {
            self.rebalance_with(&mut tx)?;
        }
        Ok(out)
    }

    /// Bring the sequence's free tail back between its bounds.
    pub fn rebalance(&mut self) -> Result<()> {
        let mut tx = BlockContainer::new(Arc::clone(&self.arena));
        self.rebalance_with(&mut tx)
    }

    /// Whether `index` is held
    pub fn contains(&self, index: u64) -> Result<bool> {
        self.intersects(index, index)
    }

    /// Whether any index of `[start, stop]` is held
    pub fn intersects(&self, start: u64, stop: u64) -> Result<bool> {
        if self.is_catalog_empty() {
            return Ok(false);
        }
        let mut tx = BlockContainer::new(Arc::clone(&self.arena));
        let entries = self.entries(&mut tx, self.locate(start))?;
        let idx = entries.partition_point(|&(_, e)| e < start);
        Ok(idx < entries.len() && entries[idx].0 <= stop)
    }

    /// Every held range, ascending
    pub fn ranges(&self) -> Result<CatalogBlockIndices> {
        let mut tx = BlockContainer::new(Arc::clone(&self.arena));
        let mut out = CatalogBlockIndices::new();
        for pos in 0..self.summaries.len() {
            for (start, stop) in self.entries(&mut tx, pos)? {
                out.add(start, stop)?;
            }
        }
        Ok(out)
    }
}
