//! Deduplicating file system: a volume plus its chunk store.
//!
//! [`DedupFs`] is the entry point for everything above the block layer:
//! formatting and opening volumes, running the chunking pipeline, and
//! reading chunked files back.

use std::path::Path;
use std::sync::Arc;

use cdcfs_config::{log_store_info, log_store_warn, Config};
use cdcfs_volume::{
    BlockDevice, FileDevice, FileHandle, FileMode, FormatOptions, Inode, Volume, VolumeError,
};
use dashmap::DashSet;

use crate::chunker::{Chunker, ChunkerParams};
use crate::error::{CasError, Result};
use crate::pipeline::{ChunkPipeline, ChunkReport};
use crate::reader::ChunkedReader;
use crate::segments::{locate, SegmentEntry, SegmentIter};
use crate::store::{ChunkStore, StoreStats};

/// Everything needed to format or open a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsOptions {
    pub block_size: usize,
    pub format: FormatOptions,
    /// Hash table size in bytes, 8 per bucket
    pub hashtable_size: u32,
    pub chunker: ChunkerParams,
    pub verify_payload: bool,
    pub cache_blocks: usize,
}

impl FsOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            block_size: config.volume.block_size as usize,
            format: FormatOptions::from_config(&config.volume),
            hashtable_size: config.volume.hashtable_size,
            chunker: ChunkerParams::from_config(&config.chunking)?,
            verify_payload: config.store.verify_payload,
            cache_blocks: config.volume.cache_blocks,
        })
    }
}

impl Default for FsOptions {
    fn default() -> Self {
        let config = Config::default();
        Self {
            block_size: config.volume.block_size as usize,
            format: FormatOptions::from_config(&config.volume),
            hashtable_size: config.volume.hashtable_size,
            chunker: ChunkerParams::default(),
            verify_payload: config.store.verify_payload,
            cache_blocks: config.volume.cache_blocks,
        }
    }
}

pub struct DedupFs {
    volume: Arc<Volume>,
    store: ChunkStore,
    chunker: Chunker,
    /// Inodes with a pipeline in flight
    busy: DashSet<u32>,
}

impl DedupFs {
    /// Format `device` and initialise an empty chunk store
    pub fn format(device: Arc<dyn BlockDevice>, options: &FsOptions) -> Result<Self> {
        let chunker = Chunker::new(options.chunker)?;
        let volume = Volume::format(device, &options.format, options.cache_blocks)?;
        let store = Self::create_store(&volume, options)?;
        volume.sync()?;
        Ok(Self {
            volume: Arc::new(volume),
            store,
            chunker,
            busy: DashSet::new(),
        })
    }

    /// Open a formatted device.
    ///
    /// A volume without an extra superblock gets one now, with an empty
    /// store sized by `options.hashtable_size`.
    pub fn open(device: Arc<dyn BlockDevice>, options: &FsOptions) -> Result<Self> {
        let chunker = Chunker::new(options.chunker)?;
        let volume = Volume::open(device, options.cache_blocks)?;
        let store = match volume.extra_superblock() {
            Some(block) => {
                let (start, end) = volume.heap_region();
                ChunkStore::open(
                    volume.cache().clone(),
                    block,
                    start,
                    end,
                    options.verify_payload,
                )?
            }
            None => {
                log_store_warn!("Volume has no chunk store, initialising one");
                let store = Self::create_store(&volume, options)?;
                volume.sync()?;
                store
            }
        };
        Ok(Self {
            volume: Arc::new(volume),
            store,
            chunker,
            busy: DashSet::new(),
        })
    }

    fn create_store(volume: &Volume, options: &FsOptions) -> Result<ChunkStore> {
        let esb = volume.allocate_zeroed_block()?;
        let (start, end) = volume.heap_region();
        let store = match ChunkStore::create(
            volume.cache().clone(),
            esb,
            start,
            options.hashtable_size,
            end,
            options.verify_payload,
        ) {
            Ok(store) => store,
            Err(e) => {
                volume.free_block(esb)?;
                return Err(e);
            }
        };
        volume.set_extra_superblock(esb)?;
        log_store_info!(
            "Chunk store initialised",
            extra_superblock = esb,
            hashtable = start,
            hashtable_size = options.hashtable_size,
            max_brk = end,
        );
        Ok(store)
    }

    /// Create an image file of `size` bytes and format it
    pub fn create_image<P: AsRef<Path>>(path: P, size: u64, options: &FsOptions) -> Result<Self> {
        let blocks = size / options.block_size as u64;
        let device = FileDevice::create(path, options.block_size, blocks)?;
        Self::format(Arc::new(device), options)
    }

    /// Open a formatted image file
    pub fn open_image<P: AsRef<Path>>(path: P, options: &FsOptions) -> Result<Self> {
        let device = FileDevice::open_volume(path)?;
        Self::open(Arc::new(device), options)
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub(crate) fn busy_set(&self) -> &DashSet<u32> {
        &self.busy
    }

    /// Resolve a handle, rejecting handles from other volumes
    pub fn inode(&self, handle: FileHandle) -> Result<Inode> {
        self.volume.inode(handle).map_err(|e| match e {
            VolumeError::ForeignHandle => CasError::ForeignVolume,
            other => other.into(),
        })
    }

    /// Start a pipeline without running it
    pub fn pipeline(&self, handle: FileHandle) -> Result<ChunkPipeline<'_>> {
        ChunkPipeline::new(self, handle)
    }

    /// Replace a plain file's contents with deduplicated segments
    pub fn chunk_file(&self, handle: FileHandle) -> Result<ChunkReport> {
        self.pipeline(handle)?.run()
    }

    /// Read from a chunked file.
    ///
    /// Copies from at most one segment; returns 0 at or past EOF.
    pub fn read(&self, handle: FileHandle, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let inode = self.inode(handle)?;
        self.read_chunked(&inode, pos, buf)
    }

    fn read_chunked(&self, inode: &Inode, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let meta = inode
            .segment_list()
            .ok_or(CasError::NotChunked(inode.ino))?;
        if pos >= inode.size || buf.is_empty() {
            return Ok(0);
        }
        let (entry, start) = locate(self.volume.cache(), meta.head, pos)?;
        let header = self.store.header(entry.location)?;
        if u64::from(header.length) != entry.size {
            return Err(CasError::CorruptSegmentList(format!(
                "segment at {} maps {} bytes but the chunk holds {}",
                entry.location, entry.size, header.length
            )));
        }
        let intra = pos - start;
        let to_read = (entry.size - intra).min(buf.len() as u64) as usize;
        self.store.read_at(entry.location, intra, &mut buf[..to_read])
    }

    /// Read from any file, whatever its storage layout
    pub fn read_any(&self, handle: FileHandle, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let inode = self.inode(handle)?;
        match inode.mode {
            FileMode::Chunked => self.read_chunked(&inode, pos, buf),
            _ => Ok(self.volume.read_extent(&inode, pos, buf)?),
        }
    }

    /// Stream a file from the start
    pub fn reader(&self, handle: FileHandle) -> Result<ChunkedReader<'_>> {
        let inode = self.inode(handle)?;
        Ok(ChunkedReader::new(self, handle, inode.size))
    }

    /// Segment list of a chunked file
    pub fn segments(&self, handle: FileHandle) -> Result<Vec<SegmentEntry>> {
        let inode = self.inode(handle)?;
        let meta = inode
            .segment_list()
            .ok_or(CasError::NotChunked(inode.ino))?;
        let entries = SegmentIter::new(self.volume.cache(), meta.head).collect::<Result<Vec<_>>>()?;
        if entries.len() as u64 != meta.count {
            return Err(CasError::CorruptSegmentList(format!(
                "inode {} records {} segments, list holds {}",
                inode.ino,
                meta.count,
                entries.len()
            )));
        }
        Ok(entries)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    pub fn sync(&self) -> Result<()> {
        Ok(self.volume.sync()?)
    }
}

impl std::fmt::Debug for DedupFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupFs")
            .field("volume", &self.volume)
            .field("store", &self.store)
            .field("busy", &self.busy.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdcfs_volume::MemoryDevice;
    use std::io::Read;

    fn device() -> Arc<MemoryDevice> {
        Arc::new(MemoryDevice::new(1024, 4096).unwrap())
    }

    fn sample(len: usize) -> Vec<u8> {
        let mut seed = 0x9e37_79b9u64;
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (seed >> 56) as u8
            })
            .collect()
    }

    #[test]
    fn test_format_places_store_after_data_zone() {
        let fs = DedupFs::format(device(), &FsOptions::default()).unwrap();
        let (start, end) = fs.volume().heap_region();
        assert_eq!(fs.store().hashtable_location(), start);
        assert_eq!(fs.store().heap_start(), start + 32 * 1024);
        assert_eq!(fs.store().max_brk(), end);
        let esb = fs.volume().extra_superblock().unwrap();
        assert!(fs.volume().is_allocated(esb).unwrap());
    }

    #[test]
    fn test_read_serves_one_segment_per_call() {
        let fs = DedupFs::format(device(), &FsOptions::default()).unwrap();
        let data = sample(200 * 1024);
        let handle = fs.volume().create_file("data", &data).unwrap();
        fs.chunk_file(handle).unwrap();

        let segments = fs.segments(handle).unwrap();
        let first = segments[0].size as usize;
        let mut buf = vec![0u8; data.len()];
        let n = fs.read(handle, 0, &mut buf).unwrap();
        assert_eq!(n, first);
        assert_eq!(&buf[..n], &data[..n]);

        // Starting mid-segment stops at the segment end.
        let n = fs.read(handle, 10, &mut buf).unwrap();
        assert_eq!(n, first - 10);
        assert_eq!(&buf[..n], &data[10..first]);

        assert_eq!(fs.read(handle, data.len() as u64, &mut buf).unwrap(), 0);
        assert_eq!(fs.read(handle, u64::MAX, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_reassembles_file() {
        let fs = DedupFs::format(device(), &FsOptions::default()).unwrap();
        let data = sample(300 * 1024 + 17);
        let handle = fs.volume().create_file("data", &data).unwrap();
        fs.chunk_file(handle).unwrap();

        for step in [1usize, 333, 4096, 70_000] {
            let mut out = Vec::with_capacity(data.len());
            let mut buf = vec![0u8; step];
            let mut pos = 0u64;
            loop {
                let n = fs.read(handle, pos, &mut buf).unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
                pos += n as u64;
            }
            assert_eq!(out, data, "step {}", step);
        }
    }

    #[test]
    fn test_segment_longer_than_chunk_is_corrupt() {
        let fs = DedupFs::format(device(), &FsOptions::default()).unwrap();
        let data = sample(100 * 1024);
        let handle = fs.volume().create_file("data", &data).unwrap();
        fs.chunk_file(handle).unwrap();

        let first = fs.segments(handle).unwrap()[0];
        let head = fs.inode(handle).unwrap().segment_list().unwrap().head;
        let bs = fs.volume().block_size() as u64;
        fs.volume()
            .cache()
            .write_u64_at(head * bs + 8, first.size + 2000)
            .unwrap();

        let mut buf = vec![0u8; data.len()];
        assert!(matches!(
            fs.read(handle, 0, &mut buf),
            Err(CasError::CorruptSegmentList(_))
        ));
        let mut out = Vec::new();
        assert!(fs.reader(handle).unwrap().read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_failed_store_creation_leaves_volume_untouched() {
        let options = FsOptions::default();
        let volume = Volume::format(device(), &options.format, 64).unwrap();
        let free = volume.free_blocks().unwrap();
        let (start, end) = volume.heap_region();
        let oversized = FsOptions {
            hashtable_size: ((end - start) as u32 + 8) & !7,
            ..FsOptions::default()
        };

        assert!(matches!(
            DedupFs::create_store(&volume, &oversized),
            Err(CasError::InvalidArgument(_))
        ));
        assert_eq!(volume.extra_superblock(), None);
        assert_eq!(volume.free_blocks().unwrap(), free);

        let store = DedupFs::create_store(&volume, &options).unwrap();
        assert_eq!(store.hashtable_location(), start);
        assert!(volume.extra_superblock().is_some());
    }

    #[test]
    fn test_plain_file_is_not_chunked() {
        let fs = DedupFs::format(device(), &FsOptions::default()).unwrap();
        let handle = fs.volume().create_file("plain", b"abc").unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            fs.read(handle, 0, &mut buf),
            Err(CasError::NotChunked(_))
        ));
        assert!(matches!(fs.segments(handle), Err(CasError::NotChunked(_))));
        assert_eq!(fs.read_any(handle, 0, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn test_foreign_handle() {
        let a = DedupFs::format(device(), &FsOptions::default()).unwrap();
        let b = DedupFs::format(device(), &FsOptions::default()).unwrap();
        let handle = a.volume().create_file("x", b"data").unwrap();
        assert!(matches!(b.chunk_file(handle), Err(CasError::ForeignVolume)));
        let mut buf = [0u8; 4];
        assert!(matches!(b.read(handle, 0, &mut buf), Err(CasError::ForeignVolume)));
    }

    #[test]
    fn test_open_without_store_initialises_one() {
        let dev = device();
        let options = FsOptions::default();
        {
            let volume = Volume::format(dev.clone(), &options.format, 64).unwrap();
            volume.create_file("old", b"kept").unwrap();
            volume.sync().unwrap();
        }
        let fs = DedupFs::open(dev.clone(), &options).unwrap();
        assert!(fs.volume().extra_superblock().is_some());
        assert_eq!(fs.stats().unwrap().chunks, 0);
        let handle = fs.volume().lookup("old").unwrap();
        fs.chunk_file(handle).unwrap();
        drop(fs);

        let fs = DedupFs::open(dev, &options).unwrap();
        let handle = fs.volume().lookup("old").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(handle, 0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"kept");
    }

    #[test]
    fn test_bad_chunker_options_rejected() {
        let options = FsOptions {
            chunker: ChunkerParams {
                min_size: 0,
                ..ChunkerParams::default()
            },
            ..FsOptions::default()
        };
        assert!(matches!(
            DedupFs::format(device(), &options),
            Err(CasError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.store.verify_payload = false;
        config.volume.hashtable_size = 4096;
        let options = FsOptions::from_config(&config).unwrap();
        assert!(!options.verify_payload);
        assert_eq!(options.hashtable_size, 4096);
        assert_eq!(options.chunker, ChunkerParams::default());
    }
}
