use std::io;

use cdcfs_volume::VolumeError;
use thiserror::Error;

/// Errors that can occur during chunking, storage and chunked reads
#[derive(Error, Debug)]
pub enum CasError {
    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("chunk heap exhausted: {requested} bytes requested at break {heap_brk}, heap ends at {max_brk}")]
    OutOfSpace {
        requested: u64,
        heap_brk: u64,
        max_brk: u64,
    },

    #[error("corrupt chunk store: {0}")]
    CorruptStore(String),

    #[error("corrupt segment list: {0}")]
    CorruptSegmentList(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("inode {0} is already chunked")]
    AlreadyChunked(u32),

    #[error("inode {0} is not a regular file")]
    NotRegularFile(u32),

    #[error("inode {0} is not chunked")]
    NotChunked(u32),

    #[error("file handle belongs to a different volume")]
    ForeignVolume,

    #[error("inode {0} is already being chunked")]
    Busy(u32),
}

pub type Result<T> = std::result::Result<T, CasError>;
