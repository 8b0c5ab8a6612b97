//! Volume: superblock, block allocation and a flat file namespace.
//!
//! Files live in a single directory keyed by name. A plain file is one
//! contiguous extent in the data zone; other storage layouts (chunked
//! files) are managed by higher layers through [`Volume::write_inode`].

use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use cdcfs_config::{log_volume_debug, log_volume_info, VolumeConfig};
use uuid::Uuid;

use crate::bitmap::BlockBitmap;
use crate::cache::BufferCache;
use crate::device::BlockDevice;
use crate::inode::{FileMode, Inode, INODE_SIZE};
use crate::superblock::Superblock;
use crate::{Result, VolumeError};

/// Layout parameters for [`Volume::format`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    pub inode_count: u32,
    /// Share of the device reserved for the chunk store
    pub heap_percent: u8,
}

impl FormatOptions {
    pub fn from_config(config: &VolumeConfig) -> Self {
        Self {
            inode_count: config.inode_count,
            heap_percent: config.heap_percent,
        }
    }
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self::from_config(&VolumeConfig::default())
    }
}

/// Reference to a file on a specific volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle {
    volume_id: u128,
    ino: u32,
}

impl FileHandle {
    pub fn new(volume_id: u128, ino: u32) -> Self {
        Self { volume_id, ino }
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn volume_id(&self) -> u128 {
        self.volume_id
    }
}

pub struct Volume {
    cache: Arc<BufferCache>,
    sb: RwLock<Superblock>,
    bitmap: BlockBitmap,
    /// Serializes inode allocation and name lookups that precede it
    inode_lock: Mutex<()>,
}

impl Volume {
    /// Lay out a fresh volume on `device`, destroying its contents
    pub fn format(
        device: Arc<dyn BlockDevice>,
        options: &FormatOptions,
        cache_blocks: usize,
    ) -> Result<Self> {
        let sb = Superblock::layout(
            device.block_size(),
            device.block_count(),
            options.inode_count,
            options.heap_percent,
            Uuid::new_v4().as_u128(),
        )?;
        let cache = Arc::new(BufferCache::new(device, cache_blocks));
        let bitmap = BlockBitmap::new(&sb);

        cache.zero_block(0)?;
        cache.load_block(0)?.write(|block| sb.write_to(block));
        bitmap.format(&cache)?;
        for block in sb.inode_start..sb.inode_start + sb.inode_blocks {
            cache.zero_block(block)?;
        }
        cache.sync()?;

        let id = Uuid::from_u128(sb.volume_id).to_string();
        log_volume_info!(
            "Volume formatted",
            volume_id = id.as_str(),
            blocks = sb.total_blocks,
            data_start = sb.data_start,
            data_end = sb.data_end,
        );

        Ok(Self {
            cache,
            sb: RwLock::new(sb),
            bitmap,
            inode_lock: Mutex::new(()),
        })
    }

    /// Open a formatted volume
    pub fn open(device: Arc<dyn BlockDevice>, cache_blocks: usize) -> Result<Self> {
        let cache = Arc::new(BufferCache::new(device, cache_blocks));
        let sb = cache.load_block(0)?.read(Superblock::read_from)?;

        if sb.block_size as usize != cache.block_size() || sb.total_blocks != cache.block_count() {
            return Err(VolumeError::Corrupt(format!(
                "superblock describes {} blocks of {} bytes, device has {} blocks of {} bytes",
                sb.total_blocks,
                sb.block_size,
                cache.block_count(),
                cache.block_size()
            )));
        }

        let id = Uuid::from_u128(sb.volume_id).to_string();
        log_volume_debug!("Volume opened", volume_id = id.as_str(), blocks = sb.total_blocks);

        Ok(Self {
            bitmap: BlockBitmap::new(&sb),
            cache,
            sb: RwLock::new(sb),
            inode_lock: Mutex::new(()),
        })
    }

    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    pub fn block_size(&self) -> usize {
        self.cache.block_size()
    }

    /// Snapshot of the superblock
    pub fn superblock(&self) -> Superblock {
        self.sb.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn volume_id(&self) -> u128 {
        self.sb.read().unwrap_or_else(PoisonError::into_inner).volume_id
    }

    /// Byte range `[start, end)` past the data zone, owned by the chunk store
    pub fn heap_region(&self) -> (u64, u64) {
        self.sb.read().unwrap_or_else(PoisonError::into_inner).heap_region()
    }

    pub fn extra_superblock(&self) -> Option<u64> {
        self.sb
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .extra_superblock()
    }

    /// Record the extra superblock location in the primary superblock
    pub fn set_extra_superblock(&self, block: u64) -> Result<()> {
        let mut sb = self.sb.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = sb.clone();
        updated.set_extra_superblock(block)?;
        self.cache.load_block(0)?.write(|raw| updated.write_to(raw));
        *sb = updated;
        Ok(())
    }

    /// Allocate one data-zone block
    pub fn allocate_block(&self) -> Result<u64> {
        self.bitmap.allocate(&self.cache)
    }

    /// Allocate one data-zone block and zero it
    pub fn allocate_zeroed_block(&self) -> Result<u64> {
        let block = self.allocate_block()?;
        self.cache.zero_block(block)?;
        Ok(block)
    }

    pub fn free_block(&self, block: u64) -> Result<()> {
        self.bitmap.free(&self.cache, block)
    }

    pub fn is_allocated(&self, block: u64) -> Result<bool> {
        self.bitmap.is_allocated(&self.cache, block)
    }

    /// Free blocks left in the data zone
    pub fn free_blocks(&self) -> Result<u64> {
        self.bitmap.count_free(&self.cache)
    }

    fn inode_offset(&self, ino: u32) -> Result<u64> {
        let sb = self.sb.read().unwrap_or_else(PoisonError::into_inner);
        if ino == 0 || ino > sb.inode_count {
            return Err(VolumeError::InodeOutOfRange(ino));
        }
        Ok(sb.inode_start * sb.block_size as u64 + ino as u64 * INODE_SIZE as u64)
    }

    /// Read inode `ino`, free or not
    pub fn read_inode(&self, ino: u32) -> Result<Inode> {
        let mut raw = [0u8; INODE_SIZE];
        self.cache.read_at(self.inode_offset(ino)?, &mut raw)?;
        Inode::read_from(ino, &raw)
    }

    /// Persist `inode` in one block write
    pub fn write_inode(&self, inode: &Inode) -> Result<()> {
        let mut raw = [0u8; INODE_SIZE];
        inode.write_to(&mut raw);
        self.cache.write_at(self.inode_offset(inode.ino)?, &raw)
    }

    /// Resolve a handle to its in-use inode
    pub fn inode(&self, handle: FileHandle) -> Result<Inode> {
        if handle.volume_id != self.volume_id() {
            return Err(VolumeError::ForeignHandle);
        }
        let inode = self.read_inode(handle.ino)?;
        if inode.is_free() {
            return Err(VolumeError::NotFound(format!("inode {}", handle.ino)));
        }
        Ok(inode)
    }

    pub fn handle(&self, ino: u32) -> FileHandle {
        FileHandle::new(self.volume_id(), ino)
    }

    /// Find a file by name
    pub fn lookup(&self, name: &str) -> Result<FileHandle> {
        self.find(name)?
            .map(|inode| self.handle(inode.ino))
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    fn find(&self, name: &str) -> Result<Option<Inode>> {
        for inode in self.inodes()? {
            if inode.name() == name {
                return Ok(Some(inode));
            }
        }
        Ok(None)
    }

    /// All in-use inodes, by inode number
    pub fn list(&self) -> Result<Vec<Inode>> {
        self.inodes()
    }

    fn inodes(&self) -> Result<Vec<Inode>> {
        let count = self.superblock().inode_count;
        let mut out = Vec::new();
        for ino in 1..=count {
            let inode = self.read_inode(ino)?;
            if !inode.is_free() {
                out.push(inode);
            }
        }
        Ok(out)
    }

    fn free_inode_number(&self) -> Result<u32> {
        let count = self.superblock().inode_count;
        for ino in 1..=count {
            if self.read_inode(ino)?.is_free() {
                return Ok(ino);
            }
        }
        Err(VolumeError::NoFreeInode)
    }

    /// Create a plain file holding `data`
    pub fn create_file(&self, name: &str, data: &[u8]) -> Result<FileHandle> {
        self.create_extent_file(name, FileMode::Plain, data.len() as u64, data)
    }

    /// Create a plain file from exactly `size` bytes of `reader`
    pub fn create_file_from_reader<R: Read>(
        &self,
        name: &str,
        size: u64,
        reader: R,
    ) -> Result<FileHandle> {
        self.create_extent_file(name, FileMode::Plain, size, reader)
    }

    pub fn symlink(&self, name: &str, target: &str) -> Result<FileHandle> {
        self.create_extent_file(name, FileMode::Symlink, target.len() as u64, target.as_bytes())
    }

    pub fn read_link(&self, handle: FileHandle) -> Result<String> {
        let inode = self.inode(handle)?;
        if inode.mode != FileMode::Symlink {
            return Err(VolumeError::NotPlainFile(inode.ino));
        }
        let mut buf = vec![0u8; inode.size as usize];
        self.read_extent(&inode, 0, &mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| VolumeError::Corrupt(format!("inode {}: link target is not UTF-8", inode.ino)))
    }

    fn create_extent_file<R: Read>(
        &self,
        name: &str,
        mode: FileMode,
        size: u64,
        mut reader: R,
    ) -> Result<FileHandle> {
        let _guard = self.inode_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Validates the name before anything is allocated.
        let mut inode = Inode::new(0, mode, name)?;
        if self.find(name)?.is_some() {
            return Err(VolumeError::AlreadyExists(name.to_string()));
        }
        inode.ino = self.free_inode_number()?;

        let bs = self.block_size() as u64;
        let blocks = size.div_ceil(bs);
        let start = if blocks > 0 {
            self.bitmap.allocate_run(&self.cache, blocks)?
        } else {
            0
        };

        let filled = self.fill_extent(start, size, &mut reader);
        let recorded = filled.and_then(|_| {
            inode.size = size;
            inode.set_extent(start, blocks)
        });
        if let Err(e) = recorded {
            for block in start..start + blocks {
                self.bitmap.free(&self.cache, block)?;
            }
            return Err(e);
        }
        self.write_inode(&inode)?;

        log_volume_debug!(
            "File created",
            ino = inode.ino,
            name = name,
            size = size,
            start = start,
            blocks = blocks,
        );
        Ok(self.handle(inode.ino))
    }

    fn fill_extent<R: Read>(&self, start: u64, size: u64, reader: &mut R) -> Result<()> {
        let bs = self.block_size();
        let mut buf = vec![0u8; bs];
        let mut written = 0u64;
        let mut block = start;
        while written < size {
            let n = (size - written).min(bs as u64) as usize;
            reader.read_exact(&mut buf[..n])?;
            buf[n..].fill(0);
            self.cache.write_at(block * bs as u64, &buf)?;
            written += n as u64;
            block += 1;
        }
        Ok(())
    }

    /// Read from a plain file; returns bytes copied (0 at or past EOF)
    pub fn read_plain(&self, handle: FileHandle, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let inode = self.inode(handle)?;
        if inode.mode != FileMode::Plain {
            return Err(VolumeError::NotPlainFile(inode.ino));
        }
        self.read_extent(&inode, pos, buf)
    }

    /// Copy extent bytes of an already-resolved plain or symlink inode
    pub fn read_extent(&self, inode: &Inode, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let (start, _) = inode
            .extent()
            .ok_or(VolumeError::NotPlainFile(inode.ino))?;
        if pos >= inode.size {
            return Ok(0);
        }
        let n = (inode.size - pos).min(buf.len() as u64) as usize;
        let offset = start * self.block_size() as u64 + pos;
        self.cache.read_at(offset, &mut buf[..n])?;
        Ok(n)
    }

    /// Return a plain file's extent to the allocator.
    ///
    /// Only the in-memory inode is updated; the caller persists it.
    pub fn free_extent(&self, inode: &mut Inode) -> Result<()> {
        let (start, blocks) = inode
            .extent()
            .ok_or(VolumeError::NotPlainFile(inode.ino))?;
        for block in start..start + blocks {
            self.bitmap.free(&self.cache, block)?;
        }
        inode.zones[0] = 0;
        inode.zones[1] = 0;
        Ok(())
    }

    /// Write back all dirty blocks and flush the device
    pub fn sync(&self) -> Result<()> {
        self.cache.sync()
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("superblock", &self.superblock())
            .field("cache", &self.cache)
            .finish()
    }
}
