//! Byte-addressable block devices
//!
//! The engine only needs a device that can read and write whole blocks by
//! absolute index and flush written blocks durably. Two implementations:
//! - `MemoryBlockDevice`: a heap buffer, for tests and ephemeral stores
//! - `MmapBlockDevice`: a pre-sized file mapped with `memmap2`

use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tessera_core::{Error, Result};

/// Fixed-size block storage addressed by absolute block index.
pub trait BlockDevice: Send + Sync {
    /// Bytes per block
    fn block_size(&self) -> usize;

    /// Number of blocks the device holds
    fn total_blocks(&self) -> u64;

    /// Copy block `index` into `buf` (`buf.len() == block_size`)
    fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()>;

    /// Overwrite block `index` with `data` (`data.len() == block_size`)
    fn write_block(&self, index: u64, data: &[u8]) -> Result<()>;

    /// Make every written block durable
    fn flush(&self) -> Result<()>;
}

fn block_range(index: u64, block_size: usize, total_blocks: u64) -> Result<std::ops::Range<usize>> {
    if index >= total_blocks {
        return Err(Error::corruption(format!(
            "device access to block {} beyond {} blocks",
            index, total_blocks
        )));
    }
    let start = index as usize * block_size;
    Ok(start..start + block_size)
}

/// Heap-backed device. Contents are lost when dropped.
pub struct MemoryBlockDevice {
    block_size: usize,
    total_blocks: u64,
    data: RwLock<Vec<u8>>,
}

impl MemoryBlockDevice {
    /// Zero-filled device of `total_blocks` blocks
    pub fn new(block_size: usize, total_blocks: u64) -> Self {
        Self {
            block_size,
            total_blocks,
            data: RwLock::new(vec![0u8; block_size * total_blocks as usize]),
        }
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        let range = block_range(index, self.block_size, self.total_blocks)?;
        buf.copy_from_slice(&self.data.read()[range]);
        Ok(())
    }

    fn write_block(&self, index: u64, data: &[u8]) -> Result<()> {
        let range = block_range(index, self.block_size, self.total_blocks)?;
        self.data.write()[range].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed device using a shared writable memory map.
#[derive(Debug)]
pub struct MmapBlockDevice {
    path: PathBuf,
    _file: File,
    mmap: RwLock<MmapMut>,
    block_size: usize,
    total_blocks: u64,
}

impl MmapBlockDevice {
    /// Create (or truncate) a file of `total_blocks` zeroed blocks and map it.
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, total_blocks: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_size as u64 * total_blocks)?;
        Self::map(path, file, block_size)
    }

    /// Map an existing store file with the given block size.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::map(path, file, block_size)
    }

    fn map(path: &Path, file: File, block_size: usize) -> Result<Self> {
        let len = file.metadata()?.len();
        if len == 0 || len % block_size as u64 != 0 {
            return Err(Error::corruption(format!(
                "store file '{}' of {} bytes is not a whole number of {}-byte blocks",
                path.display(),
                len,
                block_size
            )));
        }
        // SAFETY: the file is opened read-write and owned by this device for its
        // whole lifetime; every access goes through the RwLock below.
        let mmap = unsafe { MmapMut::map_mut(&file) }?;
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
            mmap: RwLock::new(mmap),
            block_size,
            total_blocks: len / block_size as u64,
        })
    }

    /// Path of the mapped file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for MmapBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        let range = block_range(index, self.block_size, self.total_blocks)?;
        buf.copy_from_slice(&self.mmap.read()[range]);
        Ok(())
    }

    fn write_block(&self, index: u64, data: &[u8]) -> Result<()> {
        let range = block_range(index, self.block_size, self.total_blocks)?;
        self.mmap.write()[range].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.mmap.read().flush()?;
        Ok(())
    }
}
