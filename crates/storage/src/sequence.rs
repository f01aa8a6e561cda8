//! Linked block lists with an elastic free tail
//!
//! A `BlockSequence` is the ordered list of physical blocks that make up one
//! logical structure (a catalog, a key index). The first `bytes_per_block_index`
//! bytes of every block hold the index of the next block, 0 ending the chain.
//! Element 0 is the entry point and is always in use.
//!
//! Blocks at positions `first_free..len` form the free tail: physically linked
//! and zeroed, but holding no content. Structures consume tail blocks one at a
//! time with `add_free_block` and return emptied blocks with
//! `remove_free_block`, both O(1) in allocator calls. `rebalance` keeps the
//! tail between `MIN_FREE_BLOCK_NUMBER` and `MAX_FREE_BLOCK_NUMBER` blocks.

use tessera_core::{Error, Result};

use crate::allocator::BlockAllocator;
use crate::block::{BlockContainer, BlockType};

/// Grow the free tail when it holds fewer blocks than this
pub const MIN_FREE_BLOCK_NUMBER: usize = 3;
/// Target free tail size after a rebalance
pub const AVG_FREE_BLOCK_NUMBER: usize = 4;
/// Shrink the free tail when it holds more blocks than this
pub const MAX_FREE_BLOCK_NUMBER: usize = 5;

/// Ordered list of physical blocks belonging to one structure.
#[derive(Debug, Clone)]
pub struct BlockSequence {
    kind: BlockType,
    blocks: Vec<u64>,
    first_free: usize,
}

impl BlockSequence {
    /// Build a fresh sequence over `blocks`: zeroed, linked, only element 0 in use.
    pub fn create(tx: &mut BlockContainer, kind: BlockType, blocks: &[u64]) -> Result<Self> {
        if blocks.is_empty() {
            return Err(Error::invalid_argument("a sequence needs at least one block"));
        }
        let sequence = Self {
            kind,
            blocks: blocks.to_vec(),
            first_free: 1,
        };
        for &index in blocks {
            tx.get(index, kind)?.zero();
        }
        for pos in 0..sequence.blocks.len() {
            sequence.relink(tx, pos)?;
        }
        Ok(sequence)
    }

    /// Reopen a sequence starting at `first`.
    ///
    /// The free tail starts at the first block after the entry point for which
    /// `is_unused` holds.
    pub fn load(
        tx: &mut BlockContainer,
        kind: BlockType,
        first: u64,
        is_unused: impl Fn(&[u8]) -> bool,
    ) -> Result<Self> {
        let geometry = *tx.geometry();
        let mut blocks = vec![first];
        let mut first_free = None;
        let mut current = first;
        loop {
            let block = tx.get(current, kind)?;
            let (next, unused) = block.read(|data| (geometry.read_index(data, 0), is_unused(data)));
            if blocks.len() > 1 && unused && first_free.is_none() {
                first_free = Some(blocks.len() - 1);
            }
            if next == 0 {
                break;
            }
            if blocks.len() as u64 >= geometry.total_blocks() {
                return Err(Error::corruption(format!(
                    "sequence starting at block {} does not terminate",
                    first
                )));
            }
            blocks.push(next);
            current = next;
        }
        let len = blocks.len();
        Ok(Self {
            kind,
            blocks,
            first_free: first_free.unwrap_or(len),
        })
    }

    /// Block type of every element
    pub fn kind(&self) -> BlockType {
        self.kind
    }

    /// Index of the entry-point block
    pub fn first(&self) -> u64 {
        self.blocks[0]
    }

    /// Total number of blocks, free tail included
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Always false: a sequence owns at least its entry point
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of blocks holding content
    pub fn used_len(&self) -> usize {
        self.first_free
    }

    /// Number of blocks in the free tail
    pub fn free_len(&self) -> usize {
        self.blocks.len() - self.first_free
    }

    /// Block index at logical position `pos`
    pub fn block_at(&self, pos: usize) -> u64 {
        self.blocks[pos]
    }

    /// Every block of the sequence, free tail included
    pub fn blocks(&self) -> &[u64] {
        &self.blocks
    }

    fn relink(&self, tx: &mut BlockContainer, pos: usize) -> Result<()> {
        let next = self.blocks.get(pos + 1).copied().unwrap_or(0);
        let geometry = *tx.geometry();
        tx.get(self.blocks[pos], self.kind)?
            .write(|data| geometry.write_index(data, 0, next));
        Ok(())
    }

    /// Splice the first free-tail block in right after used position `after`.
    ///
    /// Returns the index of the spliced block, now at position `after + 1`.
    pub fn add_free_block(&mut self, tx: &mut BlockContainer, after: usize) -> Result<u64> {
        if self.free_len() == 0 {
            return Err(Error::corruption("sequence free tail exhausted"));
        }
        if after >= self.first_free {
            return Err(Error::corruption(format!(
                "cannot insert after position {} of {} used blocks",
                after, self.first_free
            )));
        }
        let free_pos = self.first_free;
        let index = self.blocks.remove(free_pos);
        self.blocks.insert(after + 1, index);
        self.first_free += 1;
        self.relink(tx, after)?;
        self.relink(tx, after + 1)?;
        self.relink(tx, free_pos)?;
        Ok(index)
    }

    /// Move used block at `pos` (never the entry point) to the end of the free tail, zeroed.
    pub fn remove_free_block(&mut self, tx: &mut BlockContainer, pos: usize) -> Result<u64> {
        if pos == 0 || pos >= self.first_free {
            return Err(Error::corruption(format!(
                "cannot release position {} of {} used blocks",
                pos, self.first_free
            )));
        }
        let index = self.blocks.remove(pos);
        self.blocks.push(index);
        self.first_free -= 1;
        tx.get(index, self.kind)?.zero();
        let last = self.blocks.len() - 1;
        self.relink(tx, pos - 1)?;
        self.relink(tx, last - 1)?;
        self.relink(tx, last)?;
        Ok(index)
    }

    /// Blocks to add (positive) or release (negative) to bring the tail back to average.
    pub fn rebalance_delta(&self) -> i64 {
        let free = self.free_len();
        if free < MIN_FREE_BLOCK_NUMBER {
            (AVG_FREE_BLOCK_NUMBER - free) as i64
        } else if free > MAX_FREE_BLOCK_NUMBER {
            -((free - AVG_FREE_BLOCK_NUMBER) as i64)
        } else {
            0
        }
    }

    /// Append freshly allocated blocks to the free tail.
    pub fn extend_tail(&mut self, tx: &mut BlockContainer, blocks: &[u64]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let old_last = self.blocks.len() - 1;
        for &index in blocks {
            tx.get(index, self.kind)?.zero();
            self.blocks.push(index);
        }
        for pos in old_last..self.blocks.len() {
            self.relink(tx, pos)?;
        }
        Ok(())
    }

    /// Detach up to `count` blocks from the end of the free tail.
    pub fn release_tail(&mut self, tx: &mut BlockContainer, count: usize) -> Result<Vec<u64>> {
        let count = count.min(self.free_len());
        let keep = self.blocks.len() - count;
        let released = self.blocks.split_off(keep);
        for &index in &released {
            tx.forget(index);
        }
        self.relink(tx, keep - 1)?;
        Ok(released)
    }

    /// Rebalance the free tail against an external allocator.
    pub fn rebalance(&mut self, tx: &mut BlockContainer, allocator: &dyn BlockAllocator) -> Result<()> {
        let delta = self.rebalance_delta();
        if delta > 0 {
            let blocks = allocator.allocate(delta as u64)?;
            self.extend_tail(tx, &blocks)?;
        } else if delta < 0 {
            let released = self.release_tail(tx, (-delta) as usize)?;
            allocator.free(&released)?;
        }
        Ok(())
    }

    /// Make sure at least one free-tail block is available for a split.
    pub fn ensure_free_block(&mut self, tx: &mut BlockContainer, allocator: &dyn BlockAllocator) -> Result<()> {
        if self.free_len() == 0 {
            self.rebalance(tx, allocator)?;
        }
        Ok(())
    }
}
