//! # cdcfs-volume
//!
//! Block storage layer for cdcfs volumes.
//!
//! A volume is a flat array of fixed-size blocks on a [`BlockDevice`]:
//!
//! ```text
//! block 0              superblock
//! blocks 1..           block bitmap (covers [0, data_end))
//! next                 inode table, 128-byte inodes
//! data_start..data_end data zone (file extents, metadata blocks)
//! data_end..           heap region, owned by the chunk store
//! ```
//!
//! All access goes through the [`BufferCache`], which hands out per-block
//! handles guarded by their own mutex.

pub mod bitmap;
pub mod cache;
pub mod codec;
pub mod device;
pub mod inode;
pub mod superblock;
pub mod volume;

pub use bitmap::BlockBitmap;
pub use cache::{BlockRef, BufferCache};
pub use device::{BlockDevice, FileDevice, MemoryDevice};
pub use inode::{FileMode, Inode, SegmentListMeta, INODE_SIZE, NAME_MAX, ZONE_SLOTS};
pub use superblock::{Superblock, SUPERBLOCK_MAGIC};
pub use volume::{FileHandle, FormatOptions, Volume};

use std::io;
use thiserror::Error;

/// Smallest supported block size; block 0 must hold the whole superblock.
pub const MIN_BLOCK_SIZE: usize = 512;
/// Largest supported block size.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Errors that can occur during volume operations
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("block {block} is outside the device ({count} blocks)")]
    BlockOutOfRange { block: u64, count: u64 },

    #[error("not a cdcfs volume (magic {found:#010x})")]
    BadMagic { found: u32 },

    #[error("unsupported block size: {0}")]
    UnsupportedBlockSize(usize),

    #[error("device too small: {0}")]
    DeviceTooSmall(String),

    #[error("no free blocks left in the data zone")]
    NoSpace,

    #[error("no free inodes")]
    NoFreeInode,

    #[error("inode {0} is out of range")]
    InodeOutOfRange(u32),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("file name is empty")]
    EmptyName,

    #[error("file name too long ({len} bytes, max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("inode {0} is not a plain file")]
    NotPlainFile(u32),

    #[error("file handle belongs to a different volume")]
    ForeignHandle,

    #[error("corrupt volume: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, VolumeError>;

/// Check that `block_size` is a power of two the layout supports.
pub fn check_block_size(block_size: usize) -> Result<()> {
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(VolumeError::UnsupportedBlockSize(block_size));
    }
    Ok(())
}
