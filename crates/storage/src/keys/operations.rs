//! Sorted key index over a sequence of key blocks
//!
//! Entries are totally ordered by key bytes across the whole sequence. A
//! lookup first checks the global first and last keys, then binary searches
//! the blocks by their last key, then the entries within the located block.
//!
//! Every inline key lives in a shared area owned by exactly one key block.
//! Splitting a block moves the upper half's inline keys into fresh areas owned
//! by the new block and compacts the areas left behind. Merging two blocks
//! hands the right block's areas over to the left one as they are.

use smallvec::SmallVec;
use std::cmp::Ordering;
use std::sync::Arc;
use tessera_core::{Error, Record, RecordOptions, Result, VERSION_INITIAL};

use super::entry::{KeyBlockLayout, KeyCursor, KeyEntry};
use crate::allocator::BlockAllocator;
use crate::block::{BlockArena, BlockContainer, BlockType};
use crate::sequence::{BlockSequence, AVG_FREE_BLOCK_NUMBER};
use crate::varsize::{VarSizeBlock, VarSizeMultiBlock};

/// Result of a successful `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// Record now stored for the key
    pub record: Record,
    /// Record the put displaced, live or expired; its value is now garbage
    pub replaced: Option<Record>,
}

/// One page of a key listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyListing {
    /// Keys in ascending order
    pub keys: Vec<Vec<u8>>,
    /// Whether matching keys remain past the last returned one
    pub more: bool,
}

/// Where a key is or would be.
struct Located {
    cursor: KeyCursor,
    found: bool,
}

/// Sorted key index of one shard (or of the container list).
///
/// Not internally synchronized: readers take `&self`, writers `&mut self`.
pub struct KeyBlockOperations {
    arena: Arc<BlockArena>,
    allocator: Arc<dyn BlockAllocator>,
    layout: KeyBlockLayout,
    area: VarSizeBlock,
    chain: VarSizeMultiBlock,
    sequence: BlockSequence,
    counts: Vec<usize>,
}

impl KeyBlockOperations {
    /// Create an empty index whose blocks come from `allocator`.
    pub fn create(arena: Arc<BlockArena>, allocator: Arc<dyn BlockAllocator>) -> Result<Self> {
        let geometry = *arena.geometry();
        let layout = KeyBlockLayout::new(geometry)?;
        let blocks = allocator.allocate(AVG_FREE_BLOCK_NUMBER as u64)?;
        let mut tx = BlockContainer::new(Arc::clone(&arena));
        let sequence = match BlockSequence::create(&mut tx, BlockType::Key, &blocks) {
            Ok(sequence) => sequence,
            Err(e) => {
                drop(tx);
                allocator.free(&blocks)?;
                return Err(e);
            }
        };
        Ok(Self {
            area: VarSizeBlock::new(geometry),
            chain: VarSizeMultiBlock::new(geometry, BlockType::Key),
            arena,
            allocator,
            layout,
            sequence,
            counts: vec![0],
        })
    }

    /// Reopen the index whose first block is `first`.
    pub fn load(arena: Arc<BlockArena>, allocator: Arc<dyn BlockAllocator>, first: u64) -> Result<Self> {
        let geometry = *arena.geometry();
        let layout = KeyBlockLayout::new(geometry)?;
        let mut tx = BlockContainer::new(Arc::clone(&arena));
        let sequence = BlockSequence::load(&mut tx, BlockType::Key, first, |data| layout.count(data) == 0)?;
        let mut counts = Vec::with_capacity(sequence.used_len());
        for pos in 0..sequence.used_len() {
            counts.push(
                tx.get(sequence.block_at(pos), BlockType::Key)?
                    .read(|data| layout.count(data)),
            );
        }
        Ok(Self {
            area: VarSizeBlock::new(geometry),
            chain: VarSizeMultiBlock::new(geometry, BlockType::Key),
            arena,
            allocator,
            layout,
            sequence,
            counts,
        })
    }

    /// First block of the index; persisted to reopen it
    pub fn start_index(&self) -> u64 {
        self.sequence.first()
    }

    /// Number of entries, expired ones included
    pub fn len(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Whether the index holds no entry
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of key blocks holding entries
    pub fn block_count(&self) -> usize {
        self.counts.len()
    }

    /// Entries per key block
    pub fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    fn tx(&self) -> BlockContainer {
        BlockContainer::new(Arc::clone(&self.arena))
    }

    fn entries(&self, tx: &mut BlockContainer, pos: usize) -> Result<Vec<KeyEntry>> {
        let layout = self.layout;
        Ok(tx
            .get(self.sequence.block_at(pos), BlockType::Key)?
            .read(|data| layout.entries(data)))
    }

    fn store(&mut self, tx: &mut BlockContainer, pos: usize, entries: &[KeyEntry]) -> Result<()> {
        let layout = self.layout;
        tx.get(self.sequence.block_at(pos), BlockType::Key)?
            .write(|data| layout.store(data, entries));
        self.counts[pos] = entries.len();
        Ok(())
    }

    /// Compare the stored key of `entry` with `key`
    fn compare(&self, tx: &mut BlockContainer, entry: &KeyEntry, key: &[u8]) -> Result<Ordering> {
        if self.layout.is_chained(entry) {
            self.chain.compare(tx, entry.key_block, key)
        } else {
            let block = tx.get(entry.key_block, BlockType::Key)?;
            self.area.compare(&block, entry.key_offset, entry.key_len, key)
        }
    }

    fn read_key(&self, tx: &mut BlockContainer, entry: &KeyEntry) -> Result<Vec<u8>> {
        if self.layout.is_chained(entry) {
            self.chain.read(tx, entry.key_block)
        } else {
            let block = tx.get(entry.key_block, BlockType::Key)?;
            self.area.read(&block, entry.key_offset, entry.key_len)
        }
    }

    /// First index in `entries` whose key is not less than `key`
    fn lower_bound(&self, tx: &mut BlockContainer, entries: &[KeyEntry], key: &[u8]) -> Result<(usize, bool)> {
        let (mut lo, mut hi) = (0, entries.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.compare(tx, &entries[mid], key)? == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let found = lo < entries.len() && self.compare(tx, &entries[lo], key)? == Ordering::Equal;
        Ok((lo, found))
    }

    fn search(&self, tx: &mut BlockContainer, key: &[u8]) -> Result<Located> {
        if self.is_empty() {
            return Ok(Located {
                cursor: KeyCursor::new(0, 0),
                found: false,
            });
        }

        // new maximum or minimum
        let last_pos = self.counts.len() - 1;
        let last_entries = self.entries(tx, last_pos)?;
        if let Some(last) = last_entries.last() {
            match self.compare(tx, last, key)? {
                Ordering::Less => {
                    return Ok(Located {
                        cursor: KeyCursor::new(last_pos, last_entries.len()),
                        found: false,
                    })
                }
                Ordering::Equal => {
                    return Ok(Located {
                        cursor: KeyCursor::new(last_pos, last_entries.len() - 1),
                        found: true,
                    })
                }
                Ordering::Greater => {}
            }
        }
        let first_entries = self.entries(tx, 0)?;
        if let Some(first) = first_entries.first() {
            match self.compare(tx, first, key)? {
                Ordering::Greater => {
                    return Ok(Located {
                        cursor: KeyCursor::new(0, 0),
                        found: false,
                    })
                }
                Ordering::Equal => {
                    return Ok(Located {
                        cursor: KeyCursor::new(0, 0),
                        found: true,
                    })
                }
                Ordering::Less => {}
            }
        }

        // first block whose last key is not less than `key`
        let (mut lo, mut hi) = (0, last_pos);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let entries = self.entries(tx, mid)?;
            let below = match entries.last() {
                Some(last) => self.compare(tx, last, key)? == Ordering::Less,
                None => true,
            };
            if below {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let entries = self.entries(tx, lo)?;
        let (entry, found) = self.lower_bound(tx, &entries, key)?;
        Ok(Located {
            cursor: KeyCursor::new(lo, entry),
            found,
        })
    }

    /// Record stored for `key`, unless absent or expired at `now`
    pub fn get(&self, key: &[u8], now: u64) -> Result<Option<Record>> {
        let mut tx = self.tx();
        let located = self.search(&mut tx, key)?;
        if !located.found {
            return Ok(None);
        }
        let entries = self.entries(&mut tx, located.cursor.block)?;
        let record = entries[located.cursor.entry].record;
        Ok(if record.is_expired(now) { None } else { Some(record) })
    }

    /// Insert or update `key` with value `id` and expiry `eol`.
    ///
    /// `version` is the caller's expected version for an update, or the
    /// version to store when `options` carries `OVERRIDE_VERSION`.
    pub fn put(
        &mut self,
        key: &[u8],
        id: u64,
        eol: u64,
        version: Option<u64>,
        options: RecordOptions,
        now: u64,
    ) -> Result<PutOutcome> {
        if key.is_empty() {
            return Err(Error::invalid_argument("keys must not be empty"));
        }
        let overriding = options.contains(RecordOptions::OVERRIDE_VERSION);
        let mut tx = self.tx();
        let located = self.search(&mut tx, key)?;

        if located.found {
            let pos = located.cursor.block;
            let mut entries = self.entries(&mut tx, pos)?;
            let stored = entries[located.cursor.entry].record;
            let new_version = if stored.is_expired(now) {
                initial_version(version, overriding)?
            } else {
                if options.contains(RecordOptions::ONLY_INSERT) {
                    return Err(Error::OptionMismatch(
                        "insert-only put on an existing key".to_string(),
                    ));
                }
                match (overriding, version) {
                    (true, Some(v)) => v,
                    (false, Some(v)) if v != stored.version => {
                        return Err(Error::VersionMismatch {
                            expected: v,
                            actual: stored.version,
                        })
                    }
                    _ => stored.version + 1,
                }
            };
            let record = Record::new(id, eol, new_version);
            entries[located.cursor.entry].record = record;
            self.store(&mut tx, pos, &entries)?;
            return Ok(PutOutcome {
                record,
                replaced: Some(stored),
            });
        }

        let record = Record::new(id, eol, initial_version(version, overriding)?);
        self.insert_at(&mut tx, located.cursor, key, record)?;
        self.rebalance(&mut tx);
        Ok(PutOutcome {
            record,
            replaced: None,
        })
    }

    fn place_inline(&self, tx: &mut BlockContainer, owned: &[KeyEntry], key: &[u8], spare: &mut Vec<u64>) -> Result<(u64, usize)> {
        let mut seen: SmallVec<[u64; 8]> = SmallVec::new();
        for entry in owned.iter().filter(|e| !self.layout.is_chained(e)) {
            if seen.contains(&entry.key_block) {
                continue;
            }
            seen.push(entry.key_block);
            let block = tx.get(entry.key_block, BlockType::Key)?;
            if self.area.free_space(&block)? >= key.len() {
                let offset = self.area.append(&block, key)?;
                return Ok((entry.key_block, offset));
            }
        }
        let index = match spare.pop() {
            Some(index) => index,
            None => self.allocator.allocate(1)?[0],
        };
        let block = tx.get(index, BlockType::Key)?;
        self.area.init(&block);
        let offset = self.area.append(&block, key)?;
        Ok((index, offset))
    }

    fn insert_at(&mut self, tx: &mut BlockContainer, at: KeyCursor, key: &[u8], record: Record) -> Result<()> {
        let pos = at.block;
        let entries = self.entries(tx, pos)?;
        if entries.len() >= self.layout.capacity() {
            return self.split_insert(tx, pos, at.entry, entries, key, record);
        }
        let mut entries = entries;
        let (key_block, key_offset) = if key.len() > self.layout.inline_limit() {
            (self.chain.store(tx, self.allocator.as_ref(), key)?, 0)
        } else {
            self.place_inline(tx, &entries, key, &mut Vec::new())?
        };
        entries.insert(
            at.entry,
            KeyEntry {
                key_block,
                key_offset,
                key_len: key.len(),
                record,
            },
        );
        self.store(tx, pos, &entries)
    }

    /// Blocks needed to pack `lens` greedily into fresh shared areas
    fn areas_needed(&self, lens: impl Iterator<Item = usize>) -> usize {
        let capacity = self.area.capacity();
        let mut blocks = 0;
        let mut free = 0;
        for len in lens {
            if blocks == 0 || len > free {
                blocks += 1;
                free = capacity;
            }
            free -= len;
        }
        blocks
    }

    /// Rewrite the shared areas in `blocks` so they hold exactly the inline keys
    /// of `entries`, compacted. Returns the areas left with no key.
    fn compact_areas(&self, tx: &mut BlockContainer, entries: &mut [KeyEntry], blocks: &[u64]) -> Result<Vec<u64>> {
        let mut emptied = Vec::new();
        for &index in blocks {
            let mut members: Vec<usize> = (0..entries.len())
                .filter(|&i| !self.layout.is_chained(&entries[i]) && entries[i].key_block == index)
                .collect();
            if members.is_empty() {
                emptied.push(index);
                continue;
            }
            members.sort_by_key(|&i| entries[i].key_offset);
            let block = tx.get(index, BlockType::Key)?;
            let mut keys = Vec::with_capacity(members.len());
            for &i in &members {
                keys.push(self.area.read(&block, entries[i].key_offset, entries[i].key_len)?);
            }
            self.area.init(&block);
            for (&i, key) in members.iter().zip(keys) {
                entries[i].key_offset = self.area.append(&block, &key)?;
            }
        }
        Ok(emptied)
    }

    fn split_insert(
        &mut self,
        tx: &mut BlockContainer,
        pos: usize,
        at: usize,
        old: Vec<KeyEntry>,
        key: &[u8],
        record: Record,
    ) -> Result<()> {
        let chained = key.len() > self.layout.inline_limit();
        let mid = (old.len() + 1) / 2;
        let new_in_lower = at < mid;

        // everything that can fail for lack of space happens before the first write
        self.sequence.ensure_free_block(tx, self.allocator.as_ref())?;
        let mut areas_before: SmallVec<[u64; 8]> = SmallVec::new();
        for entry in old.iter().filter(|e| !self.layout.is_chained(e)) {
            if !areas_before.contains(&entry.key_block) {
                areas_before.push(entry.key_block);
            }
        }

        let mut combined: Vec<Option<KeyEntry>> = old.iter().copied().map(Some).collect();
        combined.insert(at, None);
        let upper_slots = combined.split_off(mid);
        let mut lower_slots = combined;

        let mut upper_keys = Vec::with_capacity(upper_slots.len());
        for slot in &upper_slots {
            upper_keys.push(match slot {
                Some(entry) if !self.layout.is_chained(entry) => Some(self.read_key(tx, entry)?),
                Some(_) => None,
                None if chained => None,
                None => Some(key.to_vec()),
            });
        }
        let upper_areas = self.areas_needed(upper_keys.iter().flatten().map(|k| k.len()));
        let spare_needed = usize::from(new_in_lower && !chained);
        let mut fresh = self.allocator.allocate((upper_areas + spare_needed) as u64)?;
        let new_chain = if chained {
            match self.chain.store(tx, self.allocator.as_ref(), key) {
                Ok(first) => Some(first),
                Err(e) => {
                    self.allocator.free(&fresh)?;
                    return Err(e);
                }
            }
        } else {
            None
        };
        let mut spare = fresh.split_off(upper_areas);

        // lower half keeps its areas, compacted
        let mut lower: Vec<KeyEntry> = lower_slots.iter_mut().filter_map(|s| s.take()).collect();
        let emptied = self.compact_areas(tx, &mut lower, &areas_before)?;

        // upper half moves into fresh areas
        let mut upper = Vec::with_capacity(upper_slots.len());
        let mut fresh_iter = fresh.into_iter();
        let mut current: Option<u64> = None;
        for (slot, stored_key) in upper_slots.into_iter().zip(upper_keys) {
            let mut entry = slot.unwrap_or(KeyEntry {
                key_block: new_chain.unwrap_or(0),
                key_offset: 0,
                key_len: key.len(),
                record,
            });
            if let Some(bytes) = stored_key {
                let fits = match current {
                    Some(index) => {
                        let block = tx.get(index, BlockType::Key)?;
                        self.area.free_space(&block)? >= bytes.len()
                    }
                    None => false,
                };
                if !fits {
                    let index = fresh_iter
                        .next()
                        .ok_or_else(|| Error::corruption("split ran out of planned key areas"))?;
                    self.area.init(&tx.get(index, BlockType::Key)?);
                    current = Some(index);
                }
                let index = current.ok_or_else(|| Error::corruption("split lost its key area"))?;
                entry.key_block = index;
                entry.key_offset = self.area.append(&tx.get(index, BlockType::Key)?, &bytes)?;
            }
            upper.push(entry);
        }

        if new_in_lower {
            let (key_block, key_offset) = match new_chain {
                Some(first) => (first, 0),
                None => self.place_inline(tx, &lower, key, &mut spare)?,
            };
            lower.insert(
                at,
                KeyEntry {
                    key_block,
                    key_offset,
                    key_len: key.len(),
                    record,
                },
            );
        }

        self.sequence.add_free_block(tx, pos)?;
        self.counts.insert(pos + 1, 0);
        self.store(tx, pos, &lower)?;
        self.store(tx, pos + 1, &upper)?;

        let mut release = emptied;
        release.extend(spare);
        for &index in &release {
            tx.forget(index);
        }
        self.allocator.free(&release)
    }

    /// Drop the key bytes of `removed`, fixing every entry of the same area.
    fn release_key(&self, tx: &mut BlockContainer, entries: &mut [KeyEntry], removed: &KeyEntry) -> Result<()> {
        if self.layout.is_chained(removed) {
            self.chain.free(tx, self.allocator.as_ref(), removed.key_block)?;
            return Ok(());
        }
        let block = tx.get(removed.key_block, BlockType::Key)?;
        let remaining = self.area.remove(&block, removed.key_offset, removed.key_len)?;
        for entry in entries.iter_mut() {
            if !self.layout.is_chained(entry)
                && entry.key_block == removed.key_block
                && entry.key_offset > removed.key_offset
            {
                entry.key_offset -= removed.key_len;
            }
        }
        if remaining == 0 {
            drop(block);
            tx.forget(removed.key_block);
            self.allocator.free(&[removed.key_block])?;
        }
        Ok(())
    }

    fn remove_at(&mut self, tx: &mut BlockContainer, at: KeyCursor) -> Result<Record> {
        let pos = at.block;
        let mut entries = self.entries(tx, pos)?;
        let removed = entries.remove(at.entry);
        self.release_key(tx, &mut entries, &removed)?;

        if !entries.is_empty() {
            self.store(tx, pos, &entries)?;
            self.merge_neighbors(tx, pos)?;
        } else if pos > 0 {
            self.store(tx, pos, &[])?;
            self.sequence.remove_free_block(tx, pos)?;
            self.counts.remove(pos);
        } else if self.counts.len() > 1 {
            let moved = self.entries(tx, 1)?;
            self.store(tx, 0, &moved)?;
            self.sequence.remove_free_block(tx, 1)?;
            self.counts.remove(1);
        } else {
            self.store(tx, 0, &[])?;
        }
        self.rebalance(tx);
        Ok(removed.record)
    }

    fn merge_neighbors(&mut self, tx: &mut BlockContainer, pos: usize) -> Result<()> {
        let half = self.layout.capacity() / 2;
        let left = if pos > 0 && self.counts[pos - 1] + self.counts[pos] <= half {
            pos - 1
        } else if pos + 1 < self.counts.len() && self.counts[pos] + self.counts[pos + 1] <= half {
            pos
        } else {
            return Ok(());
        };
        let mut merged = self.entries(tx, left)?;
        merged.extend(self.entries(tx, left + 1)?);
        self.store(tx, left, &merged)?;
        self.store(tx, left + 1, &[])?;
        self.sequence.remove_free_block(tx, left + 1)?;
        self.counts.remove(left + 1);
        Ok(())
    }

    fn rebalance(&mut self, tx: &mut BlockContainer) {
        if let Err(e) = self.sequence.rebalance(tx, self.allocator.as_ref()) {
            tracing::warn!(first_block = self.sequence.first(), error = %e, "key index rebalance deferred");
        }
    }

    /// Remove `key`. Returns its record if a live entry was removed.
    ///
    /// An expired entry is removed as well but reported as absent.
    pub fn remove(&mut self, key: &[u8], now: u64) -> Result<Option<Record>> {
        let mut tx = self.tx();
        let located = self.search(&mut tx, key)?;
        if !located.found {
            return Ok(None);
        }
        let record = self.remove_at(&mut tx, located.cursor)?;
        Ok(if record.is_expired(now) { None } else { Some(record) })
    }

    /// Like `remove`, but also returns the record of an expired entry.
    pub fn remove_any(&mut self, key: &[u8]) -> Result<Option<Record>> {
        let mut tx = self.tx();
        let located = self.search(&mut tx, key)?;
        if !located.found {
            return Ok(None);
        }
        self.remove_at(&mut tx, located.cursor).map(Some)
    }

    /// Remove the first entry of block `pos` expired at `now`, if any.
    ///
    /// Meant to be called round-robin over `0..block_count()`.
    pub fn remove_if_expired(&mut self, pos: usize, now: u64) -> Result<Option<Record>> {
        if pos >= self.counts.len() {
            return Ok(None);
        }
        let mut tx = self.tx();
        let entries = self.entries(&mut tx, pos)?;
        match entries.iter().position(|e| e.record.is_expired(now)) {
            Some(entry) => self.remove_at(&mut tx, KeyCursor::new(pos, entry)).map(Some),
            None => Ok(None),
        }
    }

    /// List keys starting with `prefix`, after `continuation` when given.
    ///
    /// Expired entries are skipped without counting against the limits.
    /// `max_size` bounds the total key bytes returned.
    pub fn list(
        &self,
        prefix: &[u8],
        continuation: Option<&[u8]>,
        max_number: usize,
        max_size: usize,
        now: u64,
    ) -> Result<KeyListing> {
        let mut tx = self.tx();
        let mut listing = KeyListing::default();
        if self.is_empty() {
            return Ok(listing);
        }
        let mut cursor = match continuation {
            Some(after) => {
                let located = self.search(&mut tx, after)?;
                let mut cursor = located.cursor;
                if located.found {
                    cursor.entry += 1;
                }
                cursor
            }
            None => self.search(&mut tx, prefix)?.cursor,
        };

        let mut size = 0usize;
        let mut loaded: Option<(usize, Vec<KeyEntry>)> = None;
        if !cursor.settle(&self.counts) {
            return Ok(listing);
        }
        loop {
            if loaded.as_ref().map(|(pos, _)| *pos) != Some(cursor.block) {
                loaded = Some((cursor.block, self.entries(&mut tx, cursor.block)?));
            }
            let entry = match &loaded {
                Some((_, entries)) => entries[cursor.entry],
                None => return Err(Error::corruption("key listing lost its block")),
            };
            let key = self.read_key(&mut tx, &entry)?;
            if !key.starts_with(prefix) {
                if key.as_slice() > prefix {
                    break;
                }
            } else if !entry.record.is_expired(now) {
                if listing.keys.len() >= max_number || size + key.len() > max_size {
                    listing.more = true;
                    break;
                }
                size += key.len();
                listing.keys.push(key);
            }
            if !cursor.next(&self.counts) {
                break;
            }
        }
        Ok(listing)
    }

    /// Every block the index occupies: key blocks with their free tail,
    /// shared areas and key chains.
    pub fn occupied_blocks(&self) -> Result<Vec<u64>> {
        let mut tx = self.tx();
        let mut blocks = self.sequence.blocks().to_vec();
        for pos in 0..self.counts.len() {
            for entry in self.entries(&mut tx, pos)? {
                if self.layout.is_chained(&entry) {
                    blocks.extend(self.chain.chain_blocks(&mut tx, entry.key_block)?);
                } else if !blocks.contains(&entry.key_block) {
                    blocks.push(entry.key_block);
                }
            }
        }
        Ok(blocks)
    }

    /// Release the surplus of the free tail.
    pub fn close(&mut self) -> Result<()> {
        let mut tx = self.tx();
        self.sequence.rebalance(&mut tx, self.allocator.as_ref())
    }
}

fn initial_version(version: Option<u64>, overriding: bool) -> Result<u64> {
    match (overriding, version) {
        (true, Some(v)) => Ok(v),
        (false, Some(v)) => Err(Error::VersionMismatchInit { supplied: v }),
        (_, None) => Ok(VERSION_INITIAL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::RootBlockAllocator;
    use crate::device::MemoryBlockDevice;
    use crate::geometry::BlockGeometry;
    use tessera_core::{CacheBounds, EOL_NEVER};

    const NOW: u64 = 1_000_000;

    fn setup(block_size: usize) -> (Arc<BlockArena>, Arc<RootBlockAllocator>, KeyBlockOperations) {
        let device = Arc::new(MemoryBlockDevice::new(block_size, 4000));
        let arena = BlockArena::new(device, BlockGeometry::new(block_size, 4000).unwrap());
        let root = Arc::new(
            RootBlockAllocator::create(Arc::clone(&arena), CacheBounds::new(8, 32), None).unwrap(),
        );
        let keys = KeyBlockOperations::create(Arc::clone(&arena), root.clone()).unwrap();
        (arena, root, keys)
    }

    fn put(keys: &mut KeyBlockOperations, key: &[u8], id: u64) -> PutOutcome {
        keys.put(key, id, EOL_NEVER, None, RecordOptions::NONE, NOW).unwrap()
    }

    /// Free pool plus every block the index holds; constant across operations.
    fn accounted(root: &RootBlockAllocator, keys: &KeyBlockOperations) -> u64 {
        root.free_blocks() + root.catalog_blocks() + keys.occupied_blocks().unwrap().len() as u64
    }

    fn all(keys: &KeyBlockOperations) -> Vec<Vec<u8>> {
        keys.list(b"", None, usize::MAX, usize::MAX, NOW).unwrap().keys
    }

    #[test]
    fn test_put_get_remove() {
        let (_arena, _root, mut keys) = setup(128);
        let outcome = put(&mut keys, b"key1", 7);
        assert_eq!(outcome.record, Record::new(7, EOL_NEVER, VERSION_INITIAL));
        assert_eq!(outcome.replaced, None);
        assert_eq!(keys.get(b"key1", NOW).unwrap().map(|r| r.id), Some(7));
        assert_eq!(keys.get(b"key2", NOW).unwrap(), None);

        assert_eq!(keys.remove(b"key1", NOW).unwrap().map(|r| r.id), Some(7));
        assert_eq!(keys.remove(b"key1", NOW).unwrap(), None);
        assert!(keys.is_empty());
    }

    #[test]
    fn test_update_versions() {
        let (_arena, _root, mut keys) = setup(128);
        put(&mut keys, b"k", 1);
        let second = put(&mut keys, b"k", 2);
        assert_eq!(second.record.version, 2);
        assert_eq!(second.replaced.map(|r| r.id), Some(1));

        let err = keys
            .put(b"k", 3, EOL_NEVER, Some(1), RecordOptions::NONE, NOW)
            .unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { expected: 1, actual: 2 }));

        let third = keys
            .put(b"k", 3, EOL_NEVER, Some(2), RecordOptions::NONE, NOW)
            .unwrap();
        assert_eq!(third.record.version, 3);

        let forced = keys
            .put(b"k", 4, EOL_NEVER, Some(100), RecordOptions::OVERRIDE_VERSION, NOW)
            .unwrap();
        assert_eq!(forced.record.version, 100);
    }

    #[test]
    fn test_insert_options() {
        let (_arena, _root, mut keys) = setup(128);
        let err = keys
            .put(b"fresh", 1, EOL_NEVER, Some(5), RecordOptions::NONE, NOW)
            .unwrap_err();
        assert!(matches!(err, Error::VersionMismatchInit { supplied: 5 }));

        let seeded = keys
            .put(b"fresh", 1, EOL_NEVER, Some(5), RecordOptions::OVERRIDE_VERSION, NOW)
            .unwrap();
        assert_eq!(seeded.record.version, 5);

        let err = keys
            .put(b"fresh", 2, EOL_NEVER, None, RecordOptions::ONLY_INSERT, NOW)
            .unwrap_err();
        assert!(matches!(err, Error::OptionMismatch(_)));
        assert!(keys.put(b"", 1, EOL_NEVER, None, RecordOptions::NONE, NOW).is_err());
    }

    #[test]
    fn test_expired_key_behaves_as_absent() {
        let (_arena, _root, mut keys) = setup(128);
        keys.put(b"old", 1, NOW - 1, None, RecordOptions::NONE, NOW - 10).unwrap();
        assert_eq!(keys.get(b"old", NOW).unwrap(), None);
        assert!(all(&keys).is_empty());

        let outcome = keys
            .put(b"old", 2, EOL_NEVER, None, RecordOptions::ONLY_INSERT, NOW)
            .unwrap();
        assert_eq!(outcome.record.version, VERSION_INITIAL);
        assert_eq!(outcome.replaced.map(|r| r.id), Some(1));
    }

    #[test]
    fn test_many_keys_sorted_across_splits() {
        let (_arena, _root, mut keys) = setup(128);
        let mut expected = Vec::new();
        for i in 0..300u32 {
            let key = format!("key-{:05}", (i * 7919) % 300).into_bytes();
            put(&mut keys, &key, i as u64);
            expected.push(key);
        }
        expected.sort();
        assert!(keys.block_count() > 10);
        assert_eq!(all(&keys), expected);
        for key in &expected {
            assert!(keys.get(key, NOW).unwrap().is_some());
        }
    }

    #[test]
    fn test_long_keys_use_chains() {
        let (_arena, root, mut keys) = setup(128);
        let baseline = accounted(&root, &keys);
        let long_a = vec![b'a'; 500];
        let mut long_b = vec![b'a'; 500];
        long_b.push(b'b');
        put(&mut keys, &long_b, 1);
        put(&mut keys, &long_a, 2);
        put(&mut keys, b"a", 3);
        assert_eq!(all(&keys), vec![b"a".to_vec(), long_a.clone(), long_b.clone()]);
        assert_eq!(keys.get(&long_a, NOW).unwrap().map(|r| r.id), Some(2));
        assert_eq!(accounted(&root, &keys), baseline);

        keys.remove(&long_a, NOW).unwrap();
        keys.remove(&long_b, NOW).unwrap();
        keys.remove(b"a", NOW).unwrap();
        keys.close().unwrap();
        assert_eq!(accounted(&root, &keys), baseline);
    }

    #[test]
    fn test_remove_all_returns_blocks() {
        let (_arena, root, mut keys) = setup(128);
        let free_before = root.free_blocks();
        let baseline = accounted(&root, &keys);
        let names: Vec<Vec<u8>> = (0..200).map(|i| format!("item/{}", i).into_bytes()).collect();
        for (i, name) in names.iter().enumerate() {
            put(&mut keys, name, i as u64);
        }
        assert!(root.free_blocks() < free_before);
        assert_eq!(accounted(&root, &keys), baseline);
        for name in names.iter().rev() {
            assert!(keys.remove(name, NOW).unwrap().is_some());
        }
        assert!(keys.is_empty());
        assert_eq!(keys.block_count(), 1);
        keys.close().unwrap();
        assert_eq!(accounted(&root, &keys), baseline);
    }

    #[test]
    fn test_list_prefix_continuation_and_limits() {
        let (_arena, _root, mut keys) = setup(256);
        for name in ["a/1", "a/2", "a/3", "b/1", "b/2", "c"] {
            put(&mut keys, name.as_bytes(), 1);
        }
        let page = keys.list(b"a/", None, 2, usize::MAX, NOW).unwrap();
        assert_eq!(page.keys, vec![b"a/1".to_vec(), b"a/2".to_vec()]);
        assert!(page.more);

        let rest = keys.list(b"a/", Some(b"a/2"), 10, usize::MAX, NOW).unwrap();
        assert_eq!(rest.keys, vec![b"a/3".to_vec()]);
        assert!(!rest.more);

        let sized = keys.list(b"", None, 10, 7, NOW).unwrap();
        assert_eq!(sized.keys, vec![b"a/1".to_vec(), b"a/2".to_vec()]);
        assert!(sized.more);

        let b = keys.list(b"b", None, 10, usize::MAX, NOW).unwrap();
        assert_eq!(b.keys, vec![b"b/1".to_vec(), b"b/2".to_vec()]);
    }

    #[test]
    fn test_remove_if_expired_one_at_a_time() {
        let (_arena, _root, mut keys) = setup(128);
        keys.put(b"a", 1, NOW - 5, None, RecordOptions::NONE, NOW - 10).unwrap();
        keys.put(b"b", 2, NOW - 5, None, RecordOptions::NONE, NOW - 10).unwrap();
        put(&mut keys, b"c", 3);
        assert_eq!(keys.remove_if_expired(0, NOW).unwrap().map(|r| r.id), Some(1));
        assert_eq!(keys.remove_if_expired(0, NOW).unwrap().map(|r| r.id), Some(2));
        assert_eq!(keys.remove_if_expired(0, NOW).unwrap(), None);
        assert_eq!(keys.remove_if_expired(9, NOW).unwrap(), None);
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_reload_from_start_index() {
        let (arena, root, mut keys) = setup(128);
        for i in 0..50u64 {
            put(&mut keys, format!("{:03}", i).as_bytes(), i);
        }
        let start = keys.start_index();
        let before = all(&keys);
        drop(keys);

        let keys = KeyBlockOperations::load(arena, root, start).unwrap();
        assert_eq!(keys.len(), 50);
        assert_eq!(all(&keys), before);
        assert_eq!(keys.get(b"042", NOW).unwrap().map(|r| r.id), Some(42));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::{BTreeMap, BTreeSet};

        #[derive(Debug, Clone)]
        enum Op {
            Put(Vec<u8>),
            Remove(Vec<u8>),
        }

        /// Short inline keys and long chained ones sharing a prefix.
        fn key() -> impl Strategy<Value = Vec<u8>> {
            let suffix = prop::collection::vec(b'a'..b'e', 1..5);
            prop_oneof![
                suffix.clone(),
                suffix.prop_map(|s| {
                    let mut key = vec![b'c'; 300];
                    key.extend(s);
                    key
                }),
            ]
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                3 => key().prop_map(Op::Put),
                1 => key().prop_map(Op::Remove),
            ]
        }

        proptest! {
            #[test]
            fn prop_listing_matches_sorted_model(ops in prop::collection::vec(op(), 1..120)) {
                let (_arena, root, mut keys) = setup(128);
                let baseline = accounted(&root, &keys);
                let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
                for (id, op) in (1u64..).zip(ops) {
                    match op {
                        Op::Put(key) => {
                            let outcome = put(&mut keys, &key, id);
                            prop_assert_eq!(outcome.replaced.map(|r| r.id), model.insert(key, id));
                        }
                        Op::Remove(key) => {
                            let removed = keys.remove(&key, NOW).unwrap();
                            prop_assert_eq!(removed.map(|r| r.id), model.remove(&key));
                        }
                    }
                }

                prop_assert_eq!(all(&keys), model.keys().cloned().collect::<Vec<_>>());
                prop_assert_eq!(keys.len(), model.len());
                for (key, id) in &model {
                    prop_assert_eq!(keys.get(key, NOW).unwrap().map(|r| r.id), Some(*id));
                }
                let occupied = keys.occupied_blocks().unwrap();
                let distinct: BTreeSet<u64> = occupied.iter().copied().collect();
                prop_assert_eq!(distinct.len(), occupied.len());
                prop_assert_eq!(accounted(&root, &keys), baseline);
            }
        }
    }
}
