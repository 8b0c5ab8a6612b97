//! Primary superblock (block 0).
//!
//! ```text
//! off  size  field
//!   0     4  magic
//!   4     2  version
//!   6     2  extra_lo      low half of the extra superblock block number
//!   8     4  block_size
//!  12     4  inode_count
//!  16     8  total_blocks
//!  24     8  bitmap_start
//!  32     8  bitmap_blocks
//!  40     8  inode_start
//!  48     8  inode_blocks
//!  56     8  data_start
//!  64     8  data_end
//!  72     2  extra_hi      high half of the extra superblock block number
//!  80    16  volume_id
//! ```

use crate::codec::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use crate::inode::INODE_SIZE;
use crate::{check_block_size, Result, VolumeError};

/// "CDCF"
pub const SUPERBLOCK_MAGIC: u32 = 0x4344_4346;
pub const SUPERBLOCK_VERSION: u16 = 1;
/// Encoded length of the superblock record
pub const SUPERBLOCK_LEN: usize = 96;
/// Bytes needed to recognise a volume and learn its block size
pub const SUPERBLOCK_PROBE_LEN: usize = SUPERBLOCK_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub block_size: u32,
    pub inode_count: u32,
    pub total_blocks: u64,
    pub bitmap_start: u64,
    pub bitmap_blocks: u64,
    pub inode_start: u64,
    pub inode_blocks: u64,
    pub data_start: u64,
    pub data_end: u64,
    pub extra_lo: u16,
    pub extra_hi: u16,
    pub volume_id: u128,
}

impl Superblock {
    /// Compute the layout of a fresh volume.
    ///
    /// `heap_percent` of the device (rounded) is left past `data_end` for
    /// the chunk store.
    pub fn layout(
        block_size: usize,
        total_blocks: u64,
        inode_count: u32,
        heap_percent: u8,
        volume_id: u128,
    ) -> Result<Self> {
        check_block_size(block_size)?;
        if !(1..=99).contains(&heap_percent) {
            return Err(VolumeError::Corrupt(format!(
                "heap_percent {} outside 1..=99",
                heap_percent
            )));
        }
        if inode_count == 0 {
            return Err(VolumeError::DeviceTooSmall("no inodes requested".into()));
        }

        let bs = block_size as u64;
        let data_end = total_blocks * (100 - heap_percent as u64) / 100;
        let bitmap_blocks = data_end.div_ceil(bs * 8).max(1);
        // Inode 0 is reserved, so the table holds inode_count + 1 slots.
        let inode_bytes = (inode_count as u64 + 1) * INODE_SIZE as u64;
        let inode_blocks = inode_bytes.div_ceil(bs);

        let bitmap_start = 1;
        let inode_start = bitmap_start + bitmap_blocks;
        let data_start = inode_start + inode_blocks;

        // At least one block for the extra superblock and one for data.
        if data_start + 2 > data_end || data_end >= total_blocks {
            return Err(VolumeError::DeviceTooSmall(format!(
                "{} blocks leave no data zone (metadata ends at block {}, data zone ends at {})",
                total_blocks, data_start, data_end
            )));
        }

        Ok(Self {
            block_size: block_size as u32,
            inode_count,
            total_blocks,
            bitmap_start,
            bitmap_blocks,
            inode_start,
            inode_blocks,
            data_start,
            data_end,
            extra_lo: 0,
            extra_hi: 0,
            volume_id,
        })
    }

    /// Recognise a superblock and return its block size
    pub fn peek_block_size(buf: &[u8]) -> Result<usize> {
        if buf.len() < SUPERBLOCK_LEN {
            return Err(VolumeError::DeviceTooSmall("no room for a superblock".into()));
        }
        let magic = get_u32(buf, 0);
        if magic != SUPERBLOCK_MAGIC {
            return Err(VolumeError::BadMagic { found: magic });
        }
        let block_size = get_u32(buf, 8) as usize;
        check_block_size(block_size)?;
        Ok(block_size)
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[..SUPERBLOCK_LEN].fill(0);
        put_u32(buf, 0, SUPERBLOCK_MAGIC);
        put_u16(buf, 4, SUPERBLOCK_VERSION);
        put_u16(buf, 6, self.extra_lo);
        put_u32(buf, 8, self.block_size);
        put_u32(buf, 12, self.inode_count);
        put_u64(buf, 16, self.total_blocks);
        put_u64(buf, 24, self.bitmap_start);
        put_u64(buf, 32, self.bitmap_blocks);
        put_u64(buf, 40, self.inode_start);
        put_u64(buf, 48, self.inode_blocks);
        put_u64(buf, 56, self.data_start);
        put_u64(buf, 64, self.data_end);
        put_u16(buf, 72, self.extra_hi);
        buf[80..96].copy_from_slice(&self.volume_id.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Result<Self> {
        let block_size = Self::peek_block_size(buf)?;
        let version = get_u16(buf, 4);
        if version != SUPERBLOCK_VERSION {
            return Err(VolumeError::Corrupt(format!(
                "unsupported superblock version {}",
                version
            )));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[80..96]);

        let sb = Self {
            block_size: block_size as u32,
            inode_count: get_u32(buf, 12),
            total_blocks: get_u64(buf, 16),
            bitmap_start: get_u64(buf, 24),
            bitmap_blocks: get_u64(buf, 32),
            inode_start: get_u64(buf, 40),
            inode_blocks: get_u64(buf, 48),
            data_start: get_u64(buf, 56),
            data_end: get_u64(buf, 64),
            extra_lo: get_u16(buf, 6),
            extra_hi: get_u16(buf, 72),
            volume_id: u128::from_le_bytes(id),
        };

        let ordered = sb.bitmap_start == 1
            && sb.inode_start == sb.bitmap_start + sb.bitmap_blocks
            && sb.data_start == sb.inode_start + sb.inode_blocks
            && sb.data_start < sb.data_end
            && sb.data_end < sb.total_blocks;
        if !ordered {
            return Err(VolumeError::Corrupt(format!(
                "superblock regions out of order: {:?}",
                sb
            )));
        }
        Ok(sb)
    }

    /// Block holding the chunk store's extra superblock, if one exists
    pub fn extra_superblock(&self) -> Option<u64> {
        let block = ((self.extra_hi as u64) << 16) | self.extra_lo as u64;
        (block != 0).then_some(block)
    }

    /// Record the extra superblock location across the two u16 fields
    pub fn set_extra_superblock(&mut self, block: u64) -> Result<()> {
        if block > u32::MAX as u64 {
            return Err(VolumeError::Corrupt(format!(
                "extra superblock block {} does not fit in 32 bits",
                block
            )));
        }
        self.extra_lo = (block & 0xffff) as u16;
        self.extra_hi = (block >> 16) as u16;
        Ok(())
    }

    /// Byte range `[start, end)` reserved for the chunk store
    pub fn heap_region(&self) -> (u64, u64) {
        let bs = self.block_size as u64;
        (self.data_end * bs, self.total_blocks * bs)
    }

    /// Inode slots in the table (including the reserved inode 0)
    pub fn inode_slots(&self) -> u64 {
        self.inode_count as u64 + 1
    }
}
