//! Block devices backing a volume.
//!
//! - [`MemoryDevice`]: heap buffer, used by tests and benchmarks
//! - [`FileDevice`]: memory-mapped image file

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use memmap2::{MmapMut, MmapOptions};

use crate::superblock::{Superblock, SUPERBLOCK_PROBE_LEN};
use crate::{check_block_size, Result, VolumeError};

/// Fixed-size block storage.
///
/// Implementations must be safe to share across threads; the buffer cache
/// serializes access per block, not per device.
pub trait BlockDevice: Send + Sync + fmt::Debug {
    /// Block size in bytes (a power of two)
    fn block_size(&self) -> usize;

    /// Number of blocks on the device
    fn block_count(&self) -> u64;

    /// Read one whole block into `buf` (`buf.len() == block_size`)
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;

    /// Write one whole block from `buf` (`buf.len() == block_size`)
    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()>;

    /// Make previous writes durable
    fn flush(&self) -> Result<()>;

    /// Capacity in bytes
    fn capacity(&self) -> u64 {
        self.block_count() * self.block_size() as u64
    }
}

/// Byte range of `block` after bounds and buffer checks.
fn block_range(block: u64, count: u64, block_size: usize, buf_len: usize) -> Result<Range<usize>> {
    if block >= count {
        return Err(VolumeError::BlockOutOfRange { block, count });
    }
    if buf_len != block_size {
        return Err(VolumeError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("buffer of {} bytes for a {}-byte block", buf_len, block_size),
        )));
    }
    let start = block as usize * block_size;
    Ok(start..start + block_size)
}

/// In-memory block device
pub struct MemoryDevice {
    block_size: usize,
    block_count: u64,
    data: RwLock<Vec<u8>>,
}

impl MemoryDevice {
    /// Create a zero-filled device of `block_count` blocks
    pub fn new(block_size: usize, block_count: u64) -> Result<Self> {
        check_block_size(block_size)?;
        let len = (block_count as usize)
            .checked_mul(block_size)
            .ok_or_else(|| VolumeError::DeviceTooSmall("device size overflows".into()))?;
        Ok(Self {
            block_size,
            block_count,
            data: RwLock::new(vec![0u8; len]),
        })
    }

    /// Copy of the raw device contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl fmt::Debug for MemoryDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDevice")
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .finish()
    }
}

impl BlockDevice for MemoryDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        let range = block_range(block, self.block_count, self.block_size, buf.len())?;
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()> {
        let range = block_range(block, self.block_count, self.block_size, buf.len())?;
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data[range].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Block device over a memory-mapped image file
pub struct FileDevice {
    path: PathBuf,
    block_size: usize,
    block_count: u64,
    map: RwLock<MmapMut>,
    _file: File,
}

impl FileDevice {
    /// Create (or truncate) an image file of `block_count` zeroed blocks
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, block_count: u64) -> Result<Self> {
        check_block_size(block_size)?;
        if block_count == 0 {
            return Err(VolumeError::DeviceTooSmall("zero blocks".into()));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(block_count * block_size as u64)?;
        Self::map(path, file, block_size)
    }

    /// Open an existing image with a known block size
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        check_block_size(block_size)?;
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Self::map(path, file, block_size)
    }

    /// Open a formatted image, taking the block size from its superblock
    pub fn open_volume<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut probe = [0u8; SUPERBLOCK_PROBE_LEN];
        File::open(path)?.read_exact(&mut probe)?;
        let block_size = Superblock::peek_block_size(&probe)?;
        Self::open(path, block_size)
    }

    /// Path of the backing image
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn map(path: PathBuf, file: File, block_size: usize) -> Result<Self> {
        let len = file.metadata()?.len();
        if len == 0 || len % block_size as u64 != 0 {
            return Err(VolumeError::DeviceTooSmall(format!(
                "{} is {} bytes, not a whole number of {}-byte blocks",
                path.display(),
                len,
                block_size
            )));
        }
        // SAFETY: the image is opened read-write by this process only; all
        // access to the mapping goes through the RwLock below.
        let map = unsafe { MmapOptions::new().map_mut(&file) }?;
        Ok(Self {
            path,
            block_size,
            block_count: len / block_size as u64,
            map: RwLock::new(map),
            _file: file,
        })
    }
}

impl fmt::Debug for FileDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDevice")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .finish()
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        let range = block_range(block, self.block_count, self.block_size, buf.len())?;
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        buf.copy_from_slice(&map[range]);
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()> {
        let range = block_range(block, self.block_count, self.block_size, buf.len())?;
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map[range].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        map.flush()?;
        Ok(())
    }
}
