//! Chunking pipeline: replace a plain file's extent with a segment list.
//!
//! ```text
//! Scanning -> Hashing -> Deduplicating -> Appending -> Scanning ...
//!          \-> Finalizing -> Done          (once the whole file is mapped)
//! ```
//!
//! The inode is rewritten exactly once, in `Finalizing`, after the segment
//! list has been flushed. Failing earlier leaves the plain file intact; the
//! partial segment list and any chunks inserted so far are leaked.

use std::fmt;

use cdcfs_config::{log_chunk_debug, log_chunk_info};
use cdcfs_volume::{FileHandle, FileMode, Inode, VolumeError};
use dashmap::DashSet;
use serde::Serialize;
use tracing::instrument;

use crate::digest::ContentDigest;
use crate::error::{CasError, Result};
use crate::fs::DedupFs;
use crate::segments::{SegmentEntry, SegmentWriter};
use crate::store::Placement;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Find the next chunk boundary
    Scanning,
    /// Digest the current chunk
    Hashing,
    /// Lookup-or-insert in the chunk store
    Deduplicating,
    /// Record the chunk in the segment list
    Appending,
    /// Swap the inode over to the segment list
    Finalizing,
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Scanning => "scanning",
            PipelineState::Hashing => "hashing",
            PipelineState::Deduplicating => "deduplicating",
            PipelineState::Appending => "appending",
            PipelineState::Finalizing => "finalizing",
            PipelineState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Outcome of chunking one file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChunkReport {
    pub ino: u32,
    pub segments: u64,
    pub new_chunks: u64,
    pub deduplicated_chunks: u64,
    /// Payload bytes written to the heap
    pub bytes_stored: u64,
    /// Logical file size
    pub bytes_total: u64,
}

impl ChunkReport {
    /// Fraction of the file's bytes that were already stored
    pub fn dedup_ratio(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        1.0 - self.bytes_stored as f64 / self.bytes_total as f64
    }
}

/// Marks an inode as being chunked until dropped
struct BusyGuard<'a> {
    busy: &'a DashSet<u32>,
    ino: u32,
}

impl<'a> BusyGuard<'a> {
    fn acquire(busy: &'a DashSet<u32>, ino: u32) -> Result<Self> {
        if !busy.insert(ino) {
            return Err(CasError::Busy(ino));
        }
        Ok(Self { busy, ino })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.remove(&self.ino);
    }
}

/// In-progress conversion of one file
pub struct ChunkPipeline<'a> {
    fs: &'a DedupFs,
    inode: Inode,
    writer: SegmentWriter<'a>,
    state: PipelineState,
    pos: u64,
    window: Vec<u8>,
    chunk_len: usize,
    digest: Option<ContentDigest>,
    placement: Option<Placement>,
    report: ChunkReport,
    _busy: BusyGuard<'a>,
}

impl<'a> ChunkPipeline<'a> {
    /// Check preconditions and allocate the segment-list head.
    ///
    /// Rejections leave the volume untouched.
    pub fn new(fs: &'a DedupFs, handle: FileHandle) -> Result<Self> {
        if handle.volume_id() != fs.volume().volume_id() {
            return Err(CasError::ForeignVolume);
        }
        // The mode is read under the guard so a pipeline finishing
        // concurrently is seen as AlreadyChunked.
        let busy = BusyGuard::acquire(fs.busy_set(), handle.ino())?;
        let inode = fs.inode(handle)?;
        match inode.mode {
            FileMode::Plain => {}
            FileMode::Chunked => return Err(CasError::AlreadyChunked(inode.ino)),
            _ => return Err(CasError::NotRegularFile(inode.ino)),
        }
        let writer = SegmentWriter::create(fs.volume())?;

        log_chunk_debug!(
            "Pipeline started",
            ino = inode.ino,
            size = inode.size,
            head = writer.head(),
        );

        let report = ChunkReport {
            ino: inode.ino,
            bytes_total: inode.size,
            ..ChunkReport::default()
        };
        Ok(Self {
            fs,
            inode,
            writer,
            state: PipelineState::Scanning,
            pos: 0,
            window: Vec::new(),
            chunk_len: 0,
            digest: None,
            placement: None,
            report,
            _busy: busy,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Bytes of the file mapped so far
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn report(&self) -> &ChunkReport {
        &self.report
    }

    /// Advance one state; returns the new state.
    ///
    /// Stepping a finished pipeline is a no-op.
    pub fn step(&mut self) -> Result<PipelineState> {
        self.state = match self.state {
            PipelineState::Scanning => self.scan()?,
            PipelineState::Hashing => {
                self.digest = Some(ContentDigest::of(self.chunk()));
                PipelineState::Deduplicating
            }
            PipelineState::Deduplicating => self.deduplicate()?,
            PipelineState::Appending => self.append()?,
            PipelineState::Finalizing => {
                self.finalize()?;
                PipelineState::Done
            }
            PipelineState::Done => PipelineState::Done,
        };
        Ok(self.state)
    }

    /// Drive the pipeline to completion
    #[instrument(skip(self), fields(ino = self.inode.ino), level = "debug")]
    pub fn run(mut self) -> Result<ChunkReport> {
        while self.step()? != PipelineState::Done {}
        Ok(self.report)
    }

    fn chunk(&self) -> &[u8] {
        &self.window[..self.chunk_len]
    }

    fn scan(&mut self) -> Result<PipelineState> {
        if self.pos >= self.inode.size {
            return Ok(PipelineState::Finalizing);
        }
        let chunker = self.fs.chunker();
        let remaining = self.inode.size - self.pos;
        let n = chunker.window_len(remaining);
        self.window.resize(n, 0);
        let read = self
            .fs
            .volume()
            .read_extent(&self.inode, self.pos, &mut self.window)?;
        if read != n {
            return Err(CasError::Volume(VolumeError::Corrupt(format!(
                "inode {}: short read of {} bytes at offset {}, expected {}",
                self.inode.ino, read, self.pos, n
            ))));
        }
        self.chunk_len = chunker.next_chunk_length(remaining, &self.window)?;
        Ok(PipelineState::Hashing)
    }

    fn deduplicate(&mut self) -> Result<PipelineState> {
        let digest = self
            .digest
            .take()
            .ok_or_else(|| CasError::InvalidArgument("deduplicating before hashing".into()))?;
        let placement = self.fs.store().lookup_or_insert(&digest, self.chunk())?;
        if placement.is_dedup() {
            self.report.deduplicated_chunks += 1;
        } else {
            self.report.new_chunks += 1;
            self.report.bytes_stored += self.chunk_len as u64;
        }
        self.placement = Some(placement);
        Ok(PipelineState::Appending)
    }

    fn append(&mut self) -> Result<PipelineState> {
        let placement = self
            .placement
            .take()
            .ok_or_else(|| CasError::InvalidArgument("appending before deduplicating".into()))?;
        self.writer.append(SegmentEntry {
            location: placement.location(),
            size: self.chunk_len as u64,
        })?;
        self.pos += self.chunk_len as u64;
        self.report.segments += 1;
        Ok(PipelineState::Scanning)
    }

    fn finalize(&mut self) -> Result<()> {
        let meta = self.writer.meta();
        for (field, value) in [("head", meta.head), ("count", meta.count), ("tail", meta.tail)] {
            if u32::try_from(value).is_err() {
                return Err(CasError::InvalidArgument(format!(
                    "segment list {} {} does not fit an inode zone",
                    field, value
                )));
            }
        }

        let volume = self.fs.volume();
        // The segment list and every chunk must be durable before the inode
        // points at them.
        volume.sync()?;

        let size = self.inode.size;
        volume.free_extent(&mut self.inode)?;
        self.inode.size = size;
        self.inode.set_chunked(meta)?;
        volume.write_inode(&self.inode)?;
        volume.sync()?;

        let r = &self.report;
        log_chunk_info!(
            "File chunked",
            ino = r.ino,
            segments = r.segments,
            new_chunks = r.new_chunks,
            deduplicated = r.deduplicated_chunks,
            bytes_stored = r.bytes_stored,
            bytes_total = r.bytes_total,
        );
        Ok(())
    }
}

impl fmt::Debug for ChunkPipeline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkPipeline")
            .field("ino", &self.inode.ino)
            .field("state", &self.state)
            .field("pos", &self.pos)
            .field("size", &self.inode.size)
            .finish()
    }
}
