//! Block allocation bitmap.
//!
//! One bit per block in `[0, data_end)`, LSB first within each byte. Blocks
//! before `data_start` (superblock, bitmap, inode table) are marked used at
//! format time and never handed out.

use std::sync::{Mutex, PoisonError};

use crate::cache::BufferCache;
use crate::superblock::Superblock;
use crate::{Result, VolumeError};

#[derive(Debug)]
pub struct BlockBitmap {
    start: u64,
    blocks: u64,
    bits_per_block: u64,
    data_start: u64,
    data_end: u64,
    /// Serializes find-and-set; holds where the next search starts.
    next: Mutex<u64>,
}

impl BlockBitmap {
    pub fn new(sb: &Superblock) -> Self {
        Self {
            start: sb.bitmap_start,
            blocks: sb.bitmap_blocks,
            bits_per_block: sb.block_size as u64 * 8,
            data_start: sb.data_start,
            data_end: sb.data_end,
            next: Mutex::new(sb.data_start),
        }
    }

    /// Clear the bitmap and reserve the metadata blocks
    pub fn format(&self, cache: &BufferCache) -> Result<()> {
        for block in self.start..self.start + self.blocks {
            cache.zero_block(block)?;
        }
        for block in 0..self.data_start {
            self.set(cache, block, true)?;
        }
        Ok(())
    }

    /// Allocate one data-zone block
    pub fn allocate(&self, cache: &BufferCache) -> Result<u64> {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let found = match self.find_clear(cache, *next, self.data_end)? {
            Some(block) => Some(block),
            None => self.find_clear(cache, self.data_start, *next)?,
        };
        let block = found.ok_or(VolumeError::NoSpace)?;
        self.set(cache, block, true)?;
        *next = block + 1;
        Ok(block)
    }

    /// Allocate `count` consecutive data-zone blocks (first fit)
    pub fn allocate_run(&self, cache: &BufferCache, count: u64) -> Result<u64> {
        if count == 0 {
            return Err(VolumeError::NoSpace);
        }
        let _guard = self.next.lock().unwrap_or_else(PoisonError::into_inner);

        let mut from = self.data_start;
        while from + count <= self.data_end {
            let Some(start) = self.find_clear(cache, from, self.data_end)? else {
                break;
            };
            if start + count > self.data_end {
                break;
            }
            let mut len = 1;
            while len < count && !self.get(cache, start + len)? {
                len += 1;
            }
            if len == count {
                for block in start..start + count {
                    self.set(cache, block, true)?;
                }
                return Ok(start);
            }
            from = start + len + 1;
        }
        Err(VolumeError::NoSpace)
    }

    /// Release one data-zone block
    pub fn free(&self, cache: &BufferCache, block: u64) -> Result<()> {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        self.check_data_block(block)?;
        if !self.get(cache, block)? {
            return Err(VolumeError::Corrupt(format!(
                "freeing block {} which is not allocated",
                block
            )));
        }
        self.set(cache, block, false)?;
        *next = (*next).min(block);
        Ok(())
    }

    pub fn is_allocated(&self, cache: &BufferCache, block: u64) -> Result<bool> {
        if block >= self.data_end {
            return Err(VolumeError::BlockOutOfRange {
                block,
                count: self.data_end,
            });
        }
        self.get(cache, block)
    }

    /// Free blocks left in the data zone
    pub fn count_free(&self, cache: &BufferCache) -> Result<u64> {
        let _guard = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let mut free = 0;
        for block in self.data_start..self.data_end {
            if !self.get(cache, block)? {
                free += 1;
            }
        }
        Ok(free)
    }

    fn check_data_block(&self, block: u64) -> Result<()> {
        if block < self.data_start || block >= self.data_end {
            return Err(VolumeError::BlockOutOfRange {
                block,
                count: self.data_end,
            });
        }
        Ok(())
    }

    fn position(&self, bit: u64) -> (u64, usize, u8) {
        let within = bit % self.bits_per_block;
        (
            self.start + bit / self.bits_per_block,
            (within / 8) as usize,
            1u8 << (within % 8),
        )
    }

    fn get(&self, cache: &BufferCache, bit: u64) -> Result<bool> {
        let (block, byte, mask) = self.position(bit);
        Ok(cache.load_block(block)?.read(|data| data[byte] & mask != 0))
    }

    fn set(&self, cache: &BufferCache, bit: u64, used: bool) -> Result<()> {
        let (block, byte, mask) = self.position(bit);
        cache.load_block(block)?.write(|data| {
            if used {
                data[byte] |= mask;
            } else {
                data[byte] &= !mask;
            }
        });
        Ok(())
    }

    /// First clear bit in `[from, to)`
    fn find_clear(&self, cache: &BufferCache, from: u64, to: u64) -> Result<Option<u64>> {
        let mut bit = from;
        while bit < to {
            let index = bit / self.bits_per_block;
            let block_end = ((index + 1) * self.bits_per_block).min(to);
            let block = cache.load_block(self.start + index)?;
            let bits_per_block = self.bits_per_block;
            let found = block.read(|data| {
                let mut b = bit;
                while b < block_end {
                    let within = b % bits_per_block;
                    let byte = data[(within / 8) as usize];
                    if byte == 0xff && within % 8 == 0 {
                        b += 8;
                        continue;
                    }
                    if byte & (1 << (within % 8)) == 0 {
                        return Some(b);
                    }
                    b += 1;
                }
                None
            });
            if found.is_some() {
                return Ok(found);
            }
            bit = block_end;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use std::sync::Arc;

    fn setup() -> (BufferCache, BlockBitmap, Superblock) {
        let sb = Superblock::layout(512, 256, 8, 50, 1).unwrap();
        let dev = Arc::new(MemoryDevice::new(512, 256).unwrap());
        let cache = BufferCache::new(dev, 64);
        let bitmap = BlockBitmap::new(&sb);
        bitmap.format(&cache).unwrap();
        (cache, bitmap, sb)
    }

    #[test]
    fn test_metadata_blocks_reserved() {
        let (cache, bitmap, sb) = setup();
        for block in 0..sb.data_start {
            assert!(bitmap.is_allocated(&cache, block).unwrap());
        }
        assert!(!bitmap.is_allocated(&cache, sb.data_start).unwrap());
        assert_eq!(
            bitmap.count_free(&cache).unwrap(),
            sb.data_end - sb.data_start
        );
    }

    #[test]
    fn test_allocate_until_full() {
        let (cache, bitmap, sb) = setup();
        let total = sb.data_end - sb.data_start;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..total {
            let block = bitmap.allocate(&cache).unwrap();
            assert!(block >= sb.data_start && block < sb.data_end);
            assert!(seen.insert(block));
        }
        assert!(matches!(bitmap.allocate(&cache), Err(VolumeError::NoSpace)));

        let victim = sb.data_start + 3;
        bitmap.free(&cache, victim).unwrap();
        assert_eq!(bitmap.allocate(&cache).unwrap(), victim);
    }

    #[test]
    fn test_double_free_is_corrupt() {
        let (cache, bitmap, _sb) = setup();
        let block = bitmap.allocate(&cache).unwrap();
        bitmap.free(&cache, block).unwrap();
        assert!(matches!(
            bitmap.free(&cache, block),
            Err(VolumeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_free_metadata_block_rejected() {
        let (cache, bitmap, _sb) = setup();
        assert!(matches!(
            bitmap.free(&cache, 0),
            Err(VolumeError::BlockOutOfRange { .. })
        ));
    }

    #[test]
    fn test_allocate_run_skips_fragments() {
        let (cache, bitmap, sb) = setup();
        let a = bitmap.allocate(&cache).unwrap();
        let b = bitmap.allocate(&cache).unwrap();
        let c = bitmap.allocate(&cache).unwrap();
        assert_eq!((a, b, c), (sb.data_start, sb.data_start + 1, sb.data_start + 2));
        bitmap.free(&cache, b).unwrap();

        // The one-block hole at `b` is too small for a run of 4.
        let run = bitmap.allocate_run(&cache, 4).unwrap();
        assert_eq!(run, c + 1);
        for block in run..run + 4 {
            assert!(bitmap.is_allocated(&cache, block).unwrap());
        }
        assert_eq!(bitmap.allocate_run(&cache, 1).unwrap(), b);

        let free = bitmap.count_free(&cache).unwrap();
        assert!(matches!(
            bitmap.allocate_run(&cache, free + 1),
            Err(VolumeError::NoSpace)
        ));
    }
}
