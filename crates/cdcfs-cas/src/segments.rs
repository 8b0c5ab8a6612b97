//! Segment lists: the block-linked map from file offsets to chunks.
//!
//! ```text
//! block:  [entry 0][entry 1] ... [entry epb-1][ 8 unused | next u64 ]
//! entry:  location u64, size u64   (size 0 = unused slot)
//! ```
//!
//! `epb = block_size / 16 - 1`. Lists are written once, head to tail, and
//! never modified afterwards.

use cdcfs_config::log_chunk_debug;
use cdcfs_volume::codec::{get_u64, put_u64};
use cdcfs_volume::{BufferCache, SegmentListMeta, Volume};
use serde::Serialize;

use crate::error::{CasError, Result};
use crate::store::ChunkLocation;

pub const SEGMENT_ENTRY_SIZE: usize = 16;

/// One `(location, size)` reference into the chunk store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentEntry {
    pub location: ChunkLocation,
    pub size: u64,
}

impl SegmentEntry {
    fn write_to(&self, buf: &mut [u8]) {
        put_u64(buf, 0, self.location);
        put_u64(buf, 8, self.size);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            location: get_u64(buf, 0),
            size: get_u64(buf, 8),
        }
    }
}

/// Entry slots in one segment-list block
#[inline]
pub fn entries_per_block(block_size: usize) -> usize {
    block_size / SEGMENT_ENTRY_SIZE - 1
}

#[inline]
fn next_pointer_offset(block_size: usize) -> usize {
    block_size - 8
}

/// Appends entries to a new segment list
pub struct SegmentWriter<'a> {
    volume: &'a Volume,
    head: u64,
    tail: u64,
    count: u64,
}

impl<'a> SegmentWriter<'a> {
    /// Allocate and zero the head block
    pub fn create(volume: &'a Volume) -> Result<Self> {
        let head = volume.allocate_zeroed_block()?;
        log_chunk_debug!("Segment list created", head = head);
        Ok(Self {
            volume,
            head,
            tail: head,
            count: 0,
        })
    }

    pub fn append(&mut self, entry: SegmentEntry) -> Result<()> {
        if entry.size == 0 {
            return Err(CasError::InvalidArgument(
                "zero-length segment entry".into(),
            ));
        }
        let cache = self.volume.cache();
        let bs = cache.block_size();
        let epb = entries_per_block(bs) as u64;

        let slot = self.count % epb;
        if slot == 0 && self.count != 0 {
            let block = self.volume.allocate_zeroed_block()?;
            cache.write_u64_at(self.tail * bs as u64 + next_pointer_offset(bs) as u64, block)?;
            log_chunk_debug!("Segment list extended", tail = self.tail, next = block);
            self.tail = block;
        }

        let mut raw = [0u8; SEGMENT_ENTRY_SIZE];
        entry.write_to(&mut raw);
        cache.write_at(
            self.tail * bs as u64 + slot * SEGMENT_ENTRY_SIZE as u64,
            &raw,
        )?;
        self.count += 1;
        Ok(())
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Head, entry count and tail, as recorded in the inode
    pub fn meta(&self) -> SegmentListMeta {
        SegmentListMeta {
            head: self.head,
            count: self.count,
            tail: self.tail,
        }
    }
}

/// Find the entry covering byte `target` of the list starting at `head`.
///
/// Returns the entry and the file offset at which it starts.
pub fn locate(cache: &BufferCache, head: u64, target: u64) -> Result<(SegmentEntry, u64)> {
    let mut start = 0u64;
    for entry in SegmentIter::new(cache, head) {
        let entry = entry?;
        let end = start.checked_add(entry.size).ok_or_else(|| {
            CasError::CorruptSegmentList(format!(
                "segment sizes overflow at block {} ({} bytes mapped before entry of {} bytes)",
                head, start, entry.size
            ))
        })?;
        if target < end {
            return Ok((entry, start));
        }
        start = end;
    }
    Err(CasError::CorruptSegmentList(format!(
        "offset {} is past the end of the list at block {} ({} bytes mapped)",
        target, head, start
    )))
}

/// Every entry of a segment list, in file order
pub struct SegmentIter<'a> {
    cache: &'a BufferCache,
    block: u64,
    slot: usize,
    visited: u64,
    entries: Vec<SegmentEntry>,
    next: u64,
    done: bool,
}

impl<'a> SegmentIter<'a> {
    pub fn new(cache: &'a BufferCache, head: u64) -> Self {
        Self {
            cache,
            block: head,
            slot: 0,
            visited: 0,
            entries: Vec::new(),
            next: 0,
            done: false,
        }
    }

    /// Decode the current block's populated entries and its next pointer
    fn load(&mut self) -> Result<()> {
        let count = self.cache.block_count();
        if self.block == 0 || self.block >= count {
            return Err(CasError::CorruptSegmentList(format!(
                "block pointer {} outside the device ({} blocks)",
                self.block, count
            )));
        }
        self.visited += 1;
        if self.visited > count {
            return Err(CasError::CorruptSegmentList(format!(
                "cycle through block {}",
                self.block
            )));
        }

        let bs = self.cache.block_size();
        let (entries, next) = self.cache.load_block(self.block)?.read(|raw| {
            let entries = raw[..entries_per_block(bs) * SEGMENT_ENTRY_SIZE]
                .chunks_exact(SEGMENT_ENTRY_SIZE)
                .map(SegmentEntry::read_from)
                .take_while(|e| e.size != 0)
                .collect::<Vec<_>>();
            (entries, get_u64(raw, next_pointer_offset(bs)))
        });
        self.entries = entries;
        self.next = next;
        self.slot = 0;
        Ok(())
    }
}

impl Iterator for SegmentIter<'_> {
    type Item = Result<SegmentEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.visited == 0 {
                if let Err(e) = self.load() {
                    self.done = true;
                    return Some(Err(e));
                }
            }
            if let Some(entry) = self.entries.get(self.slot) {
                self.slot += 1;
                return Some(Ok(*entry));
            }
            // A partially filled block is the tail.
            let full = self.entries.len() == entries_per_block(self.cache.block_size());
            if !full || self.next == 0 {
                self.done = true;
                return None;
            }
            self.block = self.next;
            if let Err(e) = self.load() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdcfs_volume::{FormatOptions, MemoryDevice};
    use std::sync::Arc;

    fn volume() -> Volume {
        let dev = Arc::new(MemoryDevice::new(512, 1024).unwrap());
        let options = FormatOptions {
            inode_count: 8,
            heap_percent: 25,
        };
        Volume::format(dev, &options, 128).unwrap()
    }

    fn entry(location: u64, size: u64) -> SegmentEntry {
        SegmentEntry { location, size }
    }

    #[test]
    fn test_entries_per_block() {
        assert_eq!(entries_per_block(512), 31);
        assert_eq!(entries_per_block(1024), 63);
        assert_eq!(entries_per_block(4096), 255);
    }

    #[test]
    fn test_locate_resolves_owning_segment() {
        let vol = volume();
        let mut writer = SegmentWriter::create(&vol).unwrap();
        writer.append(entry(1000, 100)).unwrap();
        writer.append(entry(2000, 250)).unwrap();
        writer.append(entry(3000, 50)).unwrap();
        let head = writer.head();
        let cache = vol.cache();

        assert_eq!(locate(cache, head, 150).unwrap(), (entry(2000, 250), 100));
        assert_eq!(locate(cache, head, 0).unwrap(), (entry(1000, 100), 0));
        assert_eq!(locate(cache, head, 99).unwrap(), (entry(1000, 100), 0));
        assert_eq!(locate(cache, head, 100).unwrap(), (entry(2000, 250), 100));
        assert_eq!(locate(cache, head, 399).unwrap(), (entry(3000, 50), 350));
        assert!(matches!(
            locate(cache, head, 400),
            Err(CasError::CorruptSegmentList(_))
        ));
    }

    #[test]
    fn test_oversized_entry_is_corrupt() {
        let vol = volume();
        let mut writer = SegmentWriter::create(&vol).unwrap();
        writer.append(entry(1, 100)).unwrap();
        writer.append(entry(2, 50)).unwrap();
        writer.append(entry(3, 50)).unwrap();
        let head = writer.head();
        let cache = vol.cache();
        cache.write_u64_at(head * 512 + 8, u64::MAX).unwrap();

        assert_eq!(locate(cache, head, 10).unwrap(), (entry(1, u64::MAX), 0));
        assert!(matches!(
            locate(cache, head, u64::MAX),
            Err(CasError::CorruptSegmentList(_))
        ));
    }

    #[test]
    fn test_list_spans_blocks() {
        let vol = volume();
        let epb = entries_per_block(512) as u64;
        let total = epb * 3 + 5;
        let mut writer = SegmentWriter::create(&vol).unwrap();
        for i in 0..total {
            writer.append(entry(10_000 + i, i + 1)).unwrap();
        }
        let meta = writer.meta();
        assert_eq!(meta.count, total);
        assert_ne!(meta.head, meta.tail);

        let entries: Vec<_> = SegmentIter::new(vol.cache(), meta.head)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len() as u64, total);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(*e, entry(10_000 + i as u64, i as u64 + 1));
        }

        // Last byte of the last entry.
        let mapped: u64 = (1..=total).sum();
        let (last, start) = locate(vol.cache(), meta.head, mapped - 1).unwrap();
        assert_eq!(last.size, total);
        assert_eq!(start, mapped - total);
    }

    #[test]
    fn test_exactly_full_block_stays_single() {
        let vol = volume();
        let epb = entries_per_block(512) as u64;
        let free = vol.free_blocks().unwrap();
        let mut writer = SegmentWriter::create(&vol).unwrap();
        for i in 0..epb {
            writer.append(entry(i + 1, 1)).unwrap();
        }
        assert_eq!(writer.meta().head, writer.meta().tail);
        assert_eq!(vol.free_blocks().unwrap(), free - 1);
        let n = SegmentIter::new(vol.cache(), writer.head()).count();
        assert_eq!(n as u64, epb);
    }

    #[test]
    fn test_zero_size_rejected() {
        let vol = volume();
        let mut writer = SegmentWriter::create(&vol).unwrap();
        assert!(matches!(
            writer.append(entry(5, 0)),
            Err(CasError::InvalidArgument(_))
        ));
        assert_eq!(writer.count(), 0);
    }

    #[test]
    fn test_empty_list() {
        let vol = volume();
        let writer = SegmentWriter::create(&vol).unwrap();
        assert_eq!(SegmentIter::new(vol.cache(), writer.head()).count(), 0);
        assert!(locate(vol.cache(), writer.head(), 0).is_err());
    }

    #[test]
    fn test_cycle_detected() {
        let vol = volume();
        let epb = entries_per_block(512) as u64;
        let mut writer = SegmentWriter::create(&vol).unwrap();
        for i in 0..epb * 2 {
            writer.append(entry(i + 1, 1)).unwrap();
        }
        let meta = writer.meta();
        // Point the full tail back at the head.
        let cache = vol.cache();
        cache
            .write_u64_at(meta.tail * 512 + 504, meta.head)
            .unwrap();
        assert!(matches!(
            locate(cache, meta.head, u64::MAX - 1),
            Err(CasError::CorruptSegmentList(_))
        ));
    }

    #[test]
    fn test_pointer_outside_device() {
        let vol = volume();
        let epb = entries_per_block(512) as u64;
        let mut writer = SegmentWriter::create(&vol).unwrap();
        for i in 0..epb {
            writer.append(entry(i + 1, 1)).unwrap();
        }
        vol.cache()
            .write_u64_at(writer.head() * 512 + 504, 1 << 40)
            .unwrap();
        assert!(matches!(
            locate(vol.cache(), writer.head(), epb + 3),
            Err(CasError::CorruptSegmentList(_))
        ));
        assert!(matches!(
            locate(vol.cache(), 0, 0),
            Err(CasError::CorruptSegmentList(_))
        ));
    }
}
