//! # cdcfs-cas
//!
//! Content-defined chunking and deduplicated storage on a cdcfs volume.
//!
//! A plain file is converted in one pass: the [`Chunker`] finds
//! content-aligned boundaries, each chunk is digested with BLAKE3 and placed
//! in the [`ChunkStore`] (or matched against an identical stored chunk), and
//! the resulting `(location, size)` pairs are appended to a block-linked
//! segment list recorded in the file's inode.
//!
//! ## On-volume layout
//!
//! ```text
//! data zone   plain extents, segment-list blocks, extra superblock
//! heap region [hash table][chunk][chunk]...         -> heap_brk
//! chunk       [hash u64 | length u32 | refcount u16 | flags u16 | next u64][payload]
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use cdcfs_cas::{DedupFs, FsOptions};
//!
//! let fs = DedupFs::create_image("disk.img", 64 << 20, &FsOptions::default())?;
//! let handle = fs.volume().create_file("notes.txt", b"hello")?;
//! let report = fs.chunk_file(handle)?;
//! assert_eq!(report.bytes_total, 5);
//! # Ok::<(), cdcfs_cas::CasError>(())
//! ```

pub mod chunker;
pub mod digest;
pub mod error;
pub mod fs;
mod gear;
pub mod pipeline;
pub mod reader;
pub mod segments;
pub mod store;

pub use chunker::{Chunker, ChunkerParams, Chunks};
pub use digest::{ContentDigest, DIGEST_LEN};
pub use error::{CasError, Result};
pub use fs::{DedupFs, FsOptions};
pub use pipeline::{ChunkPipeline, ChunkReport, PipelineState};
pub use reader::ChunkedReader;
pub use segments::{entries_per_block, locate, SegmentEntry, SegmentIter, SegmentWriter};
pub use store::{
    ChunkHeader, ChunkLocation, ChunkStore, ExtraSuperblock, Placement, StoreStats,
    CHUNK_HEADER_SIZE,
};
