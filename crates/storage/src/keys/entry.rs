//! Fixed-size key entries and their block layout
//!
//! ```text
//! key block: [next: w][count: u16][entry]...
//! entry:     [key_block: w][key_offset: u16][key_len: u32][id: w][eol: u64][version: u64]
//! ```
//!
//! Keys up to `inline_limit` bytes live in a shared variable-size area owned by
//! the key block, addressed by `(key_block, key_offset)`. Longer keys get their
//! own chain starting at `key_block` with `key_offset` 0.

use byteorder::{BigEndian, ByteOrder};
use tessera_core::{Error, Record, Result};

use crate::geometry::BlockGeometry;
use crate::varsize::VarSizeMultiBlock;

const COUNT_BYTES: usize = 2;
const KEY_LEN_BYTES: usize = 4;
const EOL_BYTES: usize = 8;
const VERSION_BYTES: usize = 8;

/// One key and its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEntry {
    /// Shared area or first chain block holding the key bytes
    pub key_block: u64,
    /// Offset of the key inside the shared area (0 for chains)
    pub key_offset: usize,
    /// Key length in bytes
    pub key_len: usize,
    /// Value id, expiry and version
    pub record: Record,
}

/// Encoding of key blocks for one geometry.
#[derive(Debug, Clone, Copy)]
pub struct KeyBlockLayout {
    geometry: BlockGeometry,
    entry_size: usize,
    capacity: usize,
    inline_limit: usize,
}

impl KeyBlockLayout {
    /// Layout for `geometry`; rejects blocks too small for a useful fan-out.
    pub fn new(geometry: BlockGeometry) -> Result<Self> {
        let width = geometry.bytes_per_block_index();
        let entry_size = 2 * width + geometry.bytes_per_block_offset() + KEY_LEN_BYTES + EOL_BYTES + VERSION_BYTES;
        let capacity = (geometry.block_size() - width - COUNT_BYTES) / entry_size;
        if capacity < 4 {
            return Err(Error::invalid_argument(format!(
                "block size {} leaves room for only {} key entries",
                geometry.block_size(),
                capacity
            )));
        }
        let inline_limit = (geometry.block_size() - VarSizeMultiBlock::header_size(&geometry)) / 2;
        Ok(Self {
            geometry,
            entry_size,
            capacity,
            inline_limit,
        })
    }

    /// Entries per key block
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Longest key kept in a shared area
    pub fn inline_limit(&self) -> usize {
        self.inline_limit
    }

    /// Whether `entry` keeps its key in a dedicated chain
    pub fn is_chained(&self, entry: &KeyEntry) -> bool {
        entry.key_len > self.inline_limit
    }

    /// Number of entries in a key block
    pub fn count(&self, data: &[u8]) -> usize {
        let at = self.geometry.bytes_per_block_index();
        BigEndian::read_u16(&data[at..at + COUNT_BYTES]) as usize
    }

    fn entry_offset(&self, i: usize) -> usize {
        self.geometry.bytes_per_block_index() + COUNT_BYTES + i * self.entry_size
    }

    /// Decode every entry of a key block
    pub fn entries(&self, data: &[u8]) -> Vec<KeyEntry> {
        let g = &self.geometry;
        let width = g.bytes_per_block_index();
        let offset_width = g.bytes_per_block_offset();
        (0..self.count(data))
            .map(|i| {
                let mut at = self.entry_offset(i);
                let key_block = g.read_index(data, at);
                at += width;
                let key_offset = g.read_offset(data, at);
                at += offset_width;
                let key_len = BigEndian::read_u32(&data[at..at + KEY_LEN_BYTES]) as usize;
                at += KEY_LEN_BYTES;
                let id = g.read_index(data, at);
                at += width;
                let eol = BigEndian::read_u64(&data[at..at + EOL_BYTES]);
                at += EOL_BYTES;
                let version = BigEndian::read_u64(&data[at..at + VERSION_BYTES]);
                KeyEntry {
                    key_block,
                    key_offset,
                    key_len,
                    record: Record::new(id, eol, version),
                }
            })
            .collect()
    }

    /// Encode `entries` into a key block, leaving its next pointer untouched
    pub fn store(&self, data: &mut [u8], entries: &[KeyEntry]) {
        let g = &self.geometry;
        let width = g.bytes_per_block_index();
        let offset_width = g.bytes_per_block_offset();
        BigEndian::write_u16(&mut data[width..width + COUNT_BYTES], entries.len() as u16);
        for (i, entry) in entries.iter().enumerate() {
            let mut at = self.entry_offset(i);
            g.write_index(data, at, entry.key_block);
            at += width;
            g.write_offset(data, at, entry.key_offset);
            at += offset_width;
            BigEndian::write_u32(&mut data[at..at + KEY_LEN_BYTES], entry.key_len as u32);
            at += KEY_LEN_BYTES;
            g.write_index(data, at, entry.record.id);
            at += width;
            BigEndian::write_u64(&mut data[at..at + EOL_BYTES], entry.record.eol);
            at += EOL_BYTES;
            BigEndian::write_u64(&mut data[at..at + VERSION_BYTES], entry.record.version);
        }
        let tail = self.entry_offset(entries.len());
        data[tail..].fill(0);
    }
}

/// Position of one entry in a key index: block position and entry within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCursor {
    /// Position of the key block in the sequence
    pub block: usize,
    /// Entry within the block
    pub entry: usize,
}

impl KeyCursor {
    /// Cursor at `(block, entry)`
    pub fn new(block: usize, entry: usize) -> Self {
        Self { block, entry }
    }

    /// Reposition to `(block, entry)`
    pub fn move_to(&mut self, block: usize, entry: usize) {
        self.block = block;
        self.entry = entry;
    }

    /// Roll past-the-end positions forward to the next non-empty block.
    ///
    /// Returns false once the cursor has left the index.
    pub fn settle(&mut self, counts: &[usize]) -> bool {
        while self.block < counts.len() && self.entry >= counts[self.block] {
            self.block += 1;
            self.entry = 0;
        }
        self.block < counts.len()
    }

    /// Step to the next entry. Returns false at the end of the index.
    pub fn next(&mut self, counts: &[usize]) -> bool {
        self.entry += 1;
        self.settle(counts)
    }

    /// Step to the previous entry. Returns false at the start of the index.
    pub fn previous(&mut self, counts: &[usize]) -> bool {
        if self.entry > 0 {
            self.entry -= 1;
            return true;
        }
        while self.block > 0 {
            self.block -= 1;
            if counts[self.block] > 0 {
                self.entry = counts[self.block] - 1;
                return true;
            }
        }
        false
    }
}
