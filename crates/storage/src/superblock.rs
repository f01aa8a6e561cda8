//! Block 0: the store's self-description
//!
//! Holds the layout parameters fixed at creation and the two roots needed to
//! reopen everything else: the root catalog and the container list's key index.
//! Encoded with bincode at the start of block 0; the rest of the block is zero.

use serde::{Deserialize, Serialize};
use tessera_core::{Error, Result};

use crate::geometry::BlockGeometry;

/// Identifies a store file
pub const SUPERBLOCK_MAGIC: [u8; 8] = *b"TESSERA\0";

/// On-disk format revision
pub const FORMAT_VERSION: u32 = 1;

/// Index of the superblock
pub const SUPERBLOCK_INDEX: u64 = 0;

/// Persisted root state of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    magic: [u8; 8],
    format_version: u32,
    /// Bytes per block
    pub block_size: u32,
    /// Number of blocks in the file
    pub total_blocks: u64,
    /// First block of the root catalog
    pub root_catalog: u64,
    /// First block of the container list's key index, once created
    pub container_list: Option<u64>,
}

impl Superblock {
    /// Superblock for a fresh store
    pub fn new(geometry: &BlockGeometry, root_catalog: u64) -> Self {
        Self {
            magic: SUPERBLOCK_MAGIC,
            format_version: FORMAT_VERSION,
            block_size: geometry.block_size() as u32,
            total_blocks: geometry.total_blocks(),
            root_catalog,
            container_list: None,
        }
    }

    /// Serialize into a zero-padded block image
    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>> {
        let mut bytes = bincode::serialize(self)?;
        if bytes.len() > block_size {
            return Err(Error::invalid_argument(format!(
                "superblock of {} bytes does not fit a {}-byte block",
                bytes.len(),
                block_size
            )));
        }
        bytes.resize(block_size, 0);
        Ok(bytes)
    }

    /// Decode and validate a block image
    pub fn decode(data: &[u8]) -> Result<Self> {
        let superblock: Superblock = bincode::deserialize(data)?;
        if superblock.magic != SUPERBLOCK_MAGIC {
            return Err(Error::corruption("superblock magic mismatch: not a store file"));
        }
        if superblock.format_version != FORMAT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported store format version {}",
                superblock.format_version
            )));
        }
        Ok(superblock)
    }

    /// Check the recorded layout against the device it was read from
    pub fn check_geometry(&self, block_size: usize, total_blocks: u64) -> Result<()> {
        if self.block_size as usize != block_size || self.total_blocks != total_blocks {
            return Err(Error::corruption(format!(
                "superblock describes {} blocks of {} bytes, device has {} blocks of {} bytes",
                self.total_blocks, self.block_size, total_blocks, block_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let geometry = BlockGeometry::new(512, 100).unwrap();
        let mut superblock = Superblock::new(&geometry, 1);
        superblock.container_list = Some(42);
        let image = superblock.encode(512).unwrap();
        assert_eq!(image.len(), 512);
        assert_eq!(Superblock::decode(&image).unwrap(), superblock);
        assert!(superblock.check_geometry(512, 100).is_ok());
        assert!(superblock.check_geometry(1024, 100).is_err());
    }

    #[test]
    fn test_zeroed_block_is_not_a_store() {
        assert!(Superblock::decode(&[0u8; 512]).is_err());
    }
}
