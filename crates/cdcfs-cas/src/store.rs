//! On-volume chunk store.
//!
//! The heap region past the data zone holds a fixed hash table followed by
//! an append-only chunk heap:
//!
//! ```text
//! hashtable_location           u64 bucket heads (0 = empty)
//! + hashtable_size             heap_start: first chunk
//! ...                          [header 24B][payload] [header][payload] ...
//! heap_brk                     next free byte
//! max_brk                      end of device
//! ```
//!
//! Chunks are immutable once written. A new chunk is prepended to its
//! bucket chain, so every `next` pointer is strictly below the chunk that
//! holds it. Headers never straddle a block boundary.
//!
//! The break and the table location live in the extra superblock, a single
//! data-zone block rewritten whenever the break advances.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cdcfs_config::{log_store_debug, log_store_trace, log_store_warn};
use cdcfs_volume::codec::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use cdcfs_volume::BufferCache;
use serde::Serialize;
use tracing::instrument;

use crate::digest::ContentDigest;
use crate::error::{CasError, Result};

/// Byte offset of a chunk header on the device
pub type ChunkLocation = u64;

pub const CHUNK_HEADER_SIZE: u64 = 24;

/// "ESB1"
pub const EXTRA_SUPERBLOCK_MAGIC: u32 = 0x4553_4231;
const EXTRA_SUPERBLOCK_LEN: usize = 24;

/// Fixed-size prefix of every stored chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Truncated digest of the payload
    pub hash: u64,
    pub length: u32,
    pub refcount: u16,
    pub flags: u16,
    /// Previous head of the bucket chain (0 = end)
    pub next: ChunkLocation,
}

impl ChunkHeader {
    pub fn write_to(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.hash);
        put_u32(buf, 8, self.length);
        put_u16(buf, 12, self.refcount);
        put_u16(buf, 14, self.flags);
        put_u64(buf, 16, self.next);
    }

    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            hash: get_u64(buf, 0),
            length: get_u32(buf, 8),
            refcount: get_u16(buf, 12),
            flags: get_u16(buf, 14),
            next: get_u64(buf, 16),
        }
    }
}

/// Persistent chunk-store record
///
/// ```text
/// off  size  field
///   0     4  magic
///   4     4  hashtable_size
///   8     8  hashtable_location
///  16     8  heap_brk
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraSuperblock {
    pub hashtable_location: u64,
    pub hashtable_size: u32,
    pub heap_brk: u64,
}

impl ExtraSuperblock {
    pub fn write_to(&self, buf: &mut [u8]) {
        put_u32(buf, 0, EXTRA_SUPERBLOCK_MAGIC);
        put_u32(buf, 4, self.hashtable_size);
        put_u64(buf, 8, self.hashtable_location);
        put_u64(buf, 16, self.heap_brk);
    }

    pub fn read_from(buf: &[u8]) -> Result<Self> {
        let magic = get_u32(buf, 0);
        if magic != EXTRA_SUPERBLOCK_MAGIC {
            return Err(CasError::CorruptStore(format!(
                "extra superblock magic {:#010x}",
                magic
            )));
        }
        Ok(Self {
            hashtable_size: get_u32(buf, 4),
            hashtable_location: get_u64(buf, 8),
            heap_brk: get_u64(buf, 16),
        })
    }
}

/// Outcome of [`ChunkStore::lookup_or_insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// An identical chunk was already stored here
    Existing(ChunkLocation),
    /// The payload was written as a new chunk
    Inserted(ChunkLocation),
}

impl Placement {
    pub fn location(&self) -> ChunkLocation {
        match *self {
            Placement::Existing(loc) | Placement::Inserted(loc) => loc,
        }
    }

    pub fn is_dedup(&self) -> bool {
        matches!(self, Placement::Existing(_))
    }
}

/// Store occupancy, as reported by `cdcfs stat`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub hashtable_location: u64,
    pub hashtable_size: u64,
    pub buckets: u64,
    pub used_buckets: u64,
    pub chunks: u64,
    pub longest_chain: u64,
    pub payload_bytes: u64,
    pub heap_start: u64,
    pub heap_brk: u64,
    pub max_brk: u64,
}

impl StoreStats {
    /// Heap bytes consumed by headers, payloads and alignment padding
    pub fn heap_used(&self) -> u64 {
        self.heap_brk - self.heap_start
    }

    pub fn heap_free(&self) -> u64 {
        self.max_brk - self.heap_brk
    }
}

#[derive(Debug, Clone, Copy)]
struct Heap {
    hashtable: u64,
    hashtable_size: u64,
    brk: u64,
}

impl Heap {
    fn start(&self) -> u64 {
        self.hashtable + self.hashtable_size
    }

    fn buckets(&self) -> u64 {
        self.hashtable_size / 8
    }

    fn bucket_offset(&self, hash: u64) -> u64 {
        self.hashtable + (hash % self.buckets()) * 8
    }
}

/// Hash table plus bump-allocated chunk heap
pub struct ChunkStore {
    cache: Arc<BufferCache>,
    esb_block: u64,
    region_start: u64,
    max_brk: u64,
    verify_payload: bool,
    /// Guards the break and every lookup or insert.
    heap: Mutex<Heap>,
}

impl ChunkStore {
    /// Initialise a store in `[region_start, max_brk)` with a fresh table
    pub fn create(
        cache: Arc<BufferCache>,
        esb_block: u64,
        region_start: u64,
        hashtable_size: u32,
        max_brk: u64,
        verify_payload: bool,
    ) -> Result<Self> {
        let store = Self {
            cache,
            esb_block,
            region_start,
            max_brk,
            verify_payload,
            heap: Mutex::new(Heap {
                hashtable: region_start,
                hashtable_size: 0,
                brk: region_start,
            }),
        };
        store.reset(region_start, hashtable_size)?;
        Ok(store)
    }

    /// Load a store from its extra superblock
    pub fn open(
        cache: Arc<BufferCache>,
        esb_block: u64,
        region_start: u64,
        max_brk: u64,
        verify_payload: bool,
    ) -> Result<Self> {
        let mut raw = [0u8; EXTRA_SUPERBLOCK_LEN];
        cache.read_at(esb_block * cache.block_size() as u64, &mut raw)?;
        let esb = ExtraSuperblock::read_from(&raw)?;

        let heap = Heap {
            hashtable: esb.hashtable_location,
            hashtable_size: esb.hashtable_size as u64,
            brk: esb.heap_brk,
        };
        check_table(region_start, max_brk, heap.hashtable, heap.hashtable_size)
            .map_err(|e| CasError::CorruptStore(e.to_string()))?;
        if heap.brk < heap.start() || heap.brk >= max_brk {
            return Err(CasError::CorruptStore(format!(
                "heap break {} outside [{}, {})",
                heap.brk,
                heap.start(),
                max_brk
            )));
        }

        log_store_debug!(
            "Chunk store opened",
            hashtable = heap.hashtable,
            hashtable_size = heap.hashtable_size,
            heap_brk = heap.brk,
            max_brk = max_brk,
        );

        Ok(Self {
            cache,
            esb_block,
            region_start,
            max_brk,
            verify_payload,
            heap: Mutex::new(heap),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Zero the hash table, point the break just past it and persist.
    ///
    /// Every previously stored chunk becomes unreachable.
    pub fn reset(&self, hashtable_location: u64, hashtable_size: u32) -> Result<()> {
        check_table(
            self.region_start,
            self.max_brk,
            hashtable_location,
            hashtable_size as u64,
        )?;
        let mut heap = self.lock();
        self.cache
            .zero_range(hashtable_location, hashtable_size as u64)?;
        *heap = Heap {
            hashtable: hashtable_location,
            hashtable_size: hashtable_size as u64,
            brk: hashtable_location + hashtable_size as u64,
        };
        self.persist(&heap)?;

        log_store_debug!(
            "Chunk store reset",
            hashtable = hashtable_location,
            hashtable_size = hashtable_size,
            heap_brk = heap.brk,
        );
        Ok(())
    }

    fn persist(&self, heap: &Heap) -> Result<()> {
        let esb = ExtraSuperblock {
            hashtable_location: heap.hashtable,
            hashtable_size: heap.hashtable_size as u32,
            heap_brk: heap.brk,
        };
        let mut raw = [0u8; EXTRA_SUPERBLOCK_LEN];
        esb.write_to(&mut raw);
        self.cache
            .write_at(self.esb_block * self.cache.block_size() as u64, &raw)?;
        Ok(())
    }

    /// Location of the most recent chunk stored under `hash`
    pub fn lookup(&self, hash: u64) -> Result<Option<ChunkLocation>> {
        let heap = self.lock();
        self.find(&heap, hash, None)
    }

    /// Store `payload` as a new chunk, without checking for an existing copy
    pub fn insert(&self, hash: u64, payload: &[u8]) -> Result<ChunkLocation> {
        let mut heap = self.lock();
        self.insert_locked(&mut heap, hash, payload)
    }

    /// Deduplicating insert: lookup and insert under one lock.
    ///
    /// With payload verification on, a hash match counts only when the
    /// stored bytes are identical; otherwise the payload gets its own chunk.
    #[instrument(skip(self, payload), fields(len = payload.len()), level = "trace")]
    pub fn lookup_or_insert(&self, digest: &ContentDigest, payload: &[u8]) -> Result<Placement> {
        let hash = digest.truncated();
        let mut heap = self.lock();
        let verify = self.verify_payload.then_some(payload);
        if let Some(location) = self.find(&heap, hash, verify)? {
            log_store_trace!("Chunk deduplicated", location = location, hash = hash);
            return Ok(Placement::Existing(location));
        }
        let location = self.insert_locked(&mut heap, hash, payload)?;
        Ok(Placement::Inserted(location))
    }

    /// Walk the bucket for `hash`. With `payload`, skip entries whose
    /// stored bytes differ.
    fn find(&self, heap: &Heap, hash: u64, payload: Option<&[u8]>) -> Result<Option<ChunkLocation>> {
        let mut location = self.cache.read_u64_at(heap.bucket_offset(hash))?;
        let mut above = heap.brk;
        while location != 0 {
            let header = self.checked_header(heap, location, above)?;
            if header.hash == hash {
                match payload {
                    None => return Ok(Some(location)),
                    Some(data) => {
                        if self.payload_matches(location, &header, data)? {
                            return Ok(Some(location));
                        }
                        let digest_hex = format!("{:016x}", hash);
                        log_store_warn!(
                            "Hash collision, storing payload separately",
                            hash = digest_hex.as_str(),
                            location = location,
                        );
                    }
                }
            }
            above = location;
            location = header.next;
        }
        Ok(None)
    }

    fn payload_matches(&self, location: ChunkLocation, header: &ChunkHeader, data: &[u8]) -> Result<bool> {
        if header.length as usize != data.len() {
            return Ok(false);
        }
        let mut offset = location + CHUNK_HEADER_SIZE;
        let mut rest = data;
        while !rest.is_empty() {
            let (block, within, left) = self.cache.load_by_offset(offset)?;
            let n = left.min(rest.len());
            let equal = block.read(|bytes| bytes[within..within + n] == rest[..n]);
            if !equal {
                return Ok(false);
            }
            rest = &rest[n..];
            offset += n as u64;
        }
        Ok(true)
    }

    fn insert_locked(&self, heap: &mut Heap, hash: u64, payload: &[u8]) -> Result<ChunkLocation> {
        if payload.is_empty() {
            return Err(CasError::InvalidArgument("empty chunk payload".into()));
        }
        let length = u32::try_from(payload.len()).map_err(|_| {
            CasError::InvalidArgument(format!("chunk of {} bytes is too large", payload.len()))
        })?;

        let bs = self.cache.block_size() as u64;
        let mut location = heap.brk;
        if location / bs != (location + CHUNK_HEADER_SIZE - 1) / bs {
            location = (location / bs + 1) * bs;
        }
        let end = location + CHUNK_HEADER_SIZE + length as u64;
        if end >= self.max_brk {
            log_store_warn!(
                "Chunk heap exhausted",
                requested = CHUNK_HEADER_SIZE + length as u64,
                heap_brk = heap.brk,
                max_brk = self.max_brk,
            );
            return Err(CasError::OutOfSpace {
                requested: CHUNK_HEADER_SIZE + length as u64,
                heap_brk: heap.brk,
                max_brk: self.max_brk,
            });
        }

        let bucket = heap.bucket_offset(hash);
        let header = ChunkHeader {
            hash,
            length,
            refcount: 0,
            flags: 0,
            next: self.cache.read_u64_at(bucket)?,
        };
        let mut raw = [0u8; CHUNK_HEADER_SIZE as usize];
        header.write_to(&mut raw);
        self.cache.write_at(location, &raw)?;
        self.cache.write_at(location + CHUNK_HEADER_SIZE, payload)?;
        self.cache.write_u64_at(bucket, location)?;

        heap.brk = end;
        self.persist(heap)?;

        log_store_trace!(
            "Chunk inserted",
            location = location,
            length = length,
            heap_brk = end,
        );
        Ok(location)
    }

    /// Header at `location`, validated against the current break
    pub fn header(&self, location: ChunkLocation) -> Result<ChunkHeader> {
        let heap = *self.lock();
        self.checked_header(&heap, location, heap.brk)
    }

    /// Read a header, requiring it to sit in the heap below `above` and its
    /// payload to end before the break.
    fn checked_header(&self, heap: &Heap, location: ChunkLocation, above: u64) -> Result<ChunkHeader> {
        if location < heap.start() || location >= above || location + CHUNK_HEADER_SIZE > heap.brk {
            return Err(CasError::CorruptStore(format!(
                "chunk pointer {} outside [{}, {})",
                location,
                heap.start(),
                above.min(heap.brk)
            )));
        }
        let mut raw = [0u8; CHUNK_HEADER_SIZE as usize];
        self.cache.read_at(location, &mut raw)?;
        let header = ChunkHeader::read_from(&raw);
        if location + CHUNK_HEADER_SIZE + header.length as u64 > heap.brk {
            return Err(CasError::CorruptStore(format!(
                "chunk at {} with length {} runs past the break {}",
                location, header.length, heap.brk
            )));
        }
        Ok(header)
    }

    /// Copy payload bytes of the chunk at `location` from `offset` on.
    ///
    /// Returns `min(buf.len(), length - offset)`, or 0 past the end.
    pub fn read_at(&self, location: ChunkLocation, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let header = self.header(location)?;
        let length = header.length as u64;
        if offset >= length {
            return Ok(0);
        }
        let n = (length - offset).min(buf.len() as u64) as usize;
        self.cache
            .read_at(location + CHUNK_HEADER_SIZE + offset, &mut buf[..n])?;
        Ok(n)
    }

    /// Every chunk in the bucket `hash` falls into, most recent first
    pub fn chain(&self, hash: u64) -> Result<Vec<ChunkLocation>> {
        let heap = *self.lock();
        self.walk(&heap, self.cache.read_u64_at(heap.bucket_offset(hash))?)
    }

    fn walk(&self, heap: &Heap, head: ChunkLocation) -> Result<Vec<ChunkLocation>> {
        let mut out = Vec::new();
        let mut location = head;
        let mut above = heap.brk;
        while location != 0 {
            let header = self.checked_header(heap, location, above)?;
            out.push(location);
            above = location;
            location = header.next;
        }
        Ok(out)
    }

    /// Scan the whole table
    pub fn stats(&self) -> Result<StoreStats> {
        let heap = *self.lock();
        let mut stats = StoreStats {
            hashtable_location: heap.hashtable,
            hashtable_size: heap.hashtable_size,
            buckets: heap.buckets(),
            heap_start: heap.start(),
            heap_brk: heap.brk,
            max_brk: self.max_brk,
            ..StoreStats::default()
        };
        for bucket in 0..heap.buckets() {
            let head = self.cache.read_u64_at(heap.hashtable + bucket * 8)?;
            if head == 0 {
                continue;
            }
            let chain = self.walk(&heap, head)?;
            stats.used_buckets += 1;
            stats.chunks += chain.len() as u64;
            stats.longest_chain = stats.longest_chain.max(chain.len() as u64);
            for location in chain {
                stats.payload_bytes += self.checked_header(&heap, location, heap.brk)?.length as u64;
            }
        }
        Ok(stats)
    }

    pub fn heap_brk(&self) -> u64 {
        self.lock().brk
    }

    pub fn heap_start(&self) -> u64 {
        self.lock().start()
    }

    pub fn max_brk(&self) -> u64 {
        self.max_brk
    }

    pub fn hashtable_location(&self) -> u64 {
        self.lock().hashtable
    }

    pub fn hashtable_size(&self) -> u64 {
        self.lock().hashtable_size
    }

    pub fn verify_payload(&self) -> bool {
        self.verify_payload
    }

    pub fn extra_superblock_block(&self) -> u64 {
        self.esb_block
    }
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let heap = *self.lock();
        f.debug_struct("ChunkStore")
            .field("esb_block", &self.esb_block)
            .field("hashtable", &heap.hashtable)
            .field("hashtable_size", &heap.hashtable_size)
            .field("heap_brk", &heap.brk)
            .field("max_brk", &self.max_brk)
            .field("verify_payload", &self.verify_payload)
            .finish()
    }
}

fn check_table(region_start: u64, max_brk: u64, location: u64, size: u64) -> Result<()> {
    if size == 0 || size % 8 != 0 {
        return Err(CasError::InvalidArgument(format!(
            "hash table size {} is not a non-zero multiple of 8",
            size
        )));
    }
    if location < region_start || location + size >= max_brk {
        return Err(CasError::InvalidArgument(format!(
            "hash table [{}, {}) does not fit in the heap region [{}, {})",
            location,
            location + size,
            region_start,
            max_brk
        )));
    }
    Ok(())
}
