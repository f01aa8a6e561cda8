//! Fixed layout parameters of one store file
//!
//! Block indices and in-block offsets are stored with the smallest byte width
//! that can address the whole file. The all-ones value of the index width is
//! never a valid block index; it encodes `ID_UNDEFINED`.

use byteorder::{BigEndian, ByteOrder};
use tessera_core::{Error, Result, ID_UNDEFINED};

/// Byte width used to encode an in-block offset.
pub const BYTES_PER_BLOCK_OFFSET: usize = 2;

/// Block size, capacity and integer widths of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    block_size: usize,
    total_blocks: u64,
    index_width: usize,
}

impl BlockGeometry {
    /// Derive the geometry for `total_blocks` blocks of `block_size` bytes.
    pub fn new(block_size: usize, total_blocks: u64) -> Result<Self> {
        if block_size < 64 || block_size > (1 << (8 * BYTES_PER_BLOCK_OFFSET)) {
            return Err(Error::invalid_argument(format!(
                "block size {} cannot be addressed with {}-byte offsets",
                block_size, BYTES_PER_BLOCK_OFFSET
            )));
        }
        if total_blocks < 2 {
            return Err(Error::invalid_argument("a store needs at least two blocks"));
        }
        Ok(Self {
            block_size,
            total_blocks,
            index_width: width_for(total_blocks),
        })
    }

    /// Bytes per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks in the store
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Bytes used to encode a block index
    pub fn bytes_per_block_index(&self) -> usize {
        self.index_width
    }

    /// Bytes used to encode an in-block offset
    pub fn bytes_per_block_offset(&self) -> usize {
        BYTES_PER_BLOCK_OFFSET
    }

    /// The encoded all-ones value standing for `ID_UNDEFINED`
    pub fn index_sentinel(&self) -> u64 {
        max_for(self.index_width)
    }

    /// Read a block index at `offset`, mapping the sentinel to `ID_UNDEFINED`.
    pub fn read_index(&self, data: &[u8], offset: usize) -> u64 {
        let raw = BigEndian::read_uint(&data[offset..offset + self.index_width], self.index_width);
        if raw == self.index_sentinel() {
            ID_UNDEFINED
        } else {
            raw
        }
    }

    /// Write a block index at `offset`, mapping `ID_UNDEFINED` to the sentinel.
    pub fn write_index(&self, data: &mut [u8], offset: usize, value: u64) {
        let raw = if value == ID_UNDEFINED {
            self.index_sentinel()
        } else {
            value
        };
        BigEndian::write_uint(
            &mut data[offset..offset + self.index_width],
            raw,
            self.index_width,
        );
    }

    /// Read an in-block offset at `offset`.
    pub fn read_offset(&self, data: &[u8], offset: usize) -> usize {
        BigEndian::read_uint(
            &data[offset..offset + BYTES_PER_BLOCK_OFFSET],
            BYTES_PER_BLOCK_OFFSET,
        ) as usize
    }

    /// Write an in-block offset at `offset`.
    pub fn write_offset(&self, data: &mut [u8], offset: usize, value: usize) {
        BigEndian::write_uint(
            &mut data[offset..offset + BYTES_PER_BLOCK_OFFSET],
            value as u64,
            BYTES_PER_BLOCK_OFFSET,
        );
    }

    /// Check that `index` addresses a block of this store.
    pub fn check_index(&self, index: u64) -> Result<()> {
        if index >= self.total_blocks {
            return Err(Error::corruption(format!(
                "block index {} outside store of {} blocks",
                index, self.total_blocks
            )));
        }
        Ok(())
    }
}

fn max_for(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * width)) - 1
    }
}

/// Smallest width whose all-ones sentinel lies outside `0..total_blocks`.
fn width_for(total_blocks: u64) -> usize {
    (1..=8)
        .find(|&w| max_for(w) >= total_blocks)
        .unwrap_or(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_width_grows_with_capacity() {
        assert_eq!(BlockGeometry::new(4096, 200).unwrap().bytes_per_block_index(), 1);
        assert_eq!(BlockGeometry::new(4096, 255).unwrap().bytes_per_block_index(), 1);
        assert_eq!(BlockGeometry::new(4096, 256).unwrap().bytes_per_block_index(), 2);
        assert_eq!(BlockGeometry::new(4096, 70_000).unwrap().bytes_per_block_index(), 3);
    }

    #[test]
    fn test_index_roundtrip_and_sentinel() {
        let geometry = BlockGeometry::new(512, 1000).unwrap();
        let mut buf = vec![0u8; 16];
        geometry.write_index(&mut buf, 3, 999);
        assert_eq!(geometry.read_index(&buf, 3), 999);
        geometry.write_index(&mut buf, 3, ID_UNDEFINED);
        assert_eq!(&buf[3..5], &[0xFF, 0xFF]);
        assert_eq!(geometry.read_index(&buf, 3), ID_UNDEFINED);
    }

    #[test]
    fn test_offset_roundtrip() {
        let geometry = BlockGeometry::new(65_536, 100).unwrap();
        let mut buf = vec![0u8; 4];
        geometry.write_offset(&mut buf, 1, 65_535);
        assert_eq!(geometry.read_offset(&buf, 1), 65_535);
    }

    #[test]
    fn test_rejects_unaddressable_block_size() {
        assert!(BlockGeometry::new(1 << 17, 100).is_err());
        assert!(BlockGeometry::new(32, 100).is_err());
    }

    #[test]
    fn test_check_index() {
        let geometry = BlockGeometry::new(512, 10).unwrap();
        assert!(geometry.check_index(9).is_ok());
        assert!(geometry.check_index(10).is_err());
    }
}
