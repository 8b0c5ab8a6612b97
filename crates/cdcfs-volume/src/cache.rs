//! Read-through block cache.
//!
//! Every cached block lives behind its own `Mutex`, so byte-range writes
//! that land in the same block from different threads are serialized
//! without a volume-wide lock. A [`BlockRef`] pins a block; dropping it
//! releases the pin. Dirty blocks stay cached until [`BufferCache::sync`]
//! writes them back.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::device::BlockDevice;
use crate::{Result, VolumeError};

struct CachedBlock {
    data: Box<[u8]>,
    dirty: bool,
}

fn lock(slot: &Mutex<CachedBlock>) -> MutexGuard<'_, CachedBlock> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pinned handle to one cached block
#[derive(Clone)]
pub struct BlockRef {
    number: u64,
    slot: Arc<Mutex<CachedBlock>>,
}

impl BlockRef {
    /// Block number on the device
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Run `f` over the block contents
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let block = lock(&self.slot);
        f(&block.data)
    }

    /// Run `f` over mutable block contents and mark the block dirty
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut block = lock(&self.slot);
        block.dirty = true;
        f(&mut block.data)
    }

    /// Whether the block has unsynced changes
    pub fn is_dirty(&self) -> bool {
        lock(&self.slot).dirty
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRef").field("number", &self.number).finish()
    }
}

/// Buffer cache over a [`BlockDevice`]
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    capacity: usize,
    blocks: DashMap<u64, Arc<Mutex<CachedBlock>>>,
}

impl BufferCache {
    /// Create a cache holding roughly `capacity` blocks
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        let block_size = device.block_size();
        Self {
            device,
            block_size,
            capacity: capacity.max(16),
            blocks: DashMap::new(),
        }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.device.block_count()
    }

    /// Device capacity in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.device.capacity()
    }

    /// Number of blocks currently cached
    pub fn cached_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Pin block `block`, reading it from the device on a miss
    pub fn load_block(&self, block: u64) -> Result<BlockRef> {
        let count = self.block_count();
        if block >= count {
            return Err(VolumeError::BlockOutOfRange { block, count });
        }

        if let Some(slot) = self.blocks.get(&block) {
            return Ok(BlockRef {
                number: block,
                slot: Arc::clone(slot.value()),
            });
        }

        // The device read happens under the vacant entry so a concurrent
        // miss on the same block waits for it instead of racing the insert.
        let slot = match self.blocks.entry(block) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let mut data = vec![0u8; self.block_size].into_boxed_slice();
                self.device.read_block(block, &mut data)?;
                let slot = Arc::new(Mutex::new(CachedBlock { data, dirty: false }));
                entry.insert(Arc::clone(&slot));
                slot
            }
        };

        if self.blocks.len() > self.capacity {
            self.shrink()?;
        }

        Ok(BlockRef {
            number: block,
            slot,
        })
    }

    /// Pin the block holding byte `offset`.
    ///
    /// Returns the block, the offset inside it and the bytes left in it.
    pub fn load_by_offset(&self, offset: u64) -> Result<(BlockRef, usize, usize)> {
        let bs = self.block_size as u64;
        let block = self.load_block(offset / bs)?;
        let within = (offset % bs) as usize;
        Ok((block, within, self.block_size - within))
    }

    /// Copy `buf.len()` bytes starting at device byte `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let (block, within, left) = self.load_by_offset(offset + done as u64)?;
            let n = left.min(buf.len() - done);
            block.read(|data| buf[done..done + n].copy_from_slice(&data[within..within + n]));
            done += n;
        }
        Ok(())
    }

    /// Write `data` starting at device byte `offset`
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let (block, within, left) = self.load_by_offset(offset + done as u64)?;
            let n = left.min(data.len() - done);
            block.write(|bytes| bytes[within..within + n].copy_from_slice(&data[done..done + n]));
            done += n;
        }
        Ok(())
    }

    /// Zero `len` bytes starting at device byte `offset`
    pub fn zero_range(&self, offset: u64, len: u64) -> Result<()> {
        let mut done = 0u64;
        while done < len {
            let (block, within, left) = self.load_by_offset(offset + done)?;
            let n = (left as u64).min(len - done) as usize;
            block.write(|bytes| bytes[within..within + n].fill(0));
            done += n as u64;
        }
        Ok(())
    }

    /// Zero a whole block
    pub fn zero_block(&self, block: u64) -> Result<()> {
        self.zero_range(block * self.block_size as u64, self.block_size as u64)
    }

    /// Read a little-endian u64 at device byte `offset`
    pub fn read_u64_at(&self, offset: u64) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read_at(offset, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Write a little-endian u64 at device byte `offset`
    pub fn write_u64_at(&self, offset: u64, value: u64) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Write back every dirty block and flush the device
    pub fn sync(&self) -> Result<()> {
        self.write_back()?;
        self.device.flush()
    }

    fn write_back(&self) -> Result<()> {
        for entry in self.blocks.iter() {
            let mut block = lock(entry.value());
            if block.dirty {
                self.device.write_block(*entry.key(), &block.data)?;
                block.dirty = false;
            }
        }
        Ok(())
    }

    /// Drop unpinned blocks until the cache is back under capacity.
    /// Dirty blocks are written back first when clean ones do not suffice.
    fn shrink(&self) -> Result<()> {
        self.evict_clean();
        if self.blocks.len() > self.capacity {
            self.write_back()?;
            self.evict_clean();
        }
        Ok(())
    }

    fn evict_clean(&self) {
        let candidates: Vec<u64> = self
            .blocks
            .iter()
            .filter(|e| Arc::strong_count(e.value()) == 1)
            .map(|e| *e.key())
            .collect();

        for block in candidates {
            if self.blocks.len() <= self.capacity {
                break;
            }
            // Re-check under the shard lock: a pin taken after the scan
            // keeps the block resident.
            self.blocks.remove_if(&block, |_, slot| {
                Arc::strong_count(slot) == 1
                    && slot.try_lock().map(|b| !b.dirty).unwrap_or(false)
            });
        }
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("device", &self.device)
            .field("capacity", &self.capacity)
            .field("cached", &self.blocks.len())
            .finish()
    }
}
