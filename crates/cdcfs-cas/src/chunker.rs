//! Content-defined boundary detection.
//!
//! A gear fingerprint `fp = (fp << 1) + GEAR[byte]` is rolled over the
//! window starting at `min_size`. Below `normal_size` a cut needs
//! `fp & mask_small == 0`; from there to `max_size` it needs
//! `fp & mask_large == 0`. The index of the byte that triggers the cut is
//! the chunk length, so that byte opens the next chunk. Boundaries depend
//! only on content, which lets insertions shift data without disturbing
//! chunks further along.

use std::io::Read;

use cdcfs_config::{ChunkingConfig, DEFAULT_GEAR_MASK};

use crate::error::{CasError, Result};
use crate::gear::GEAR;

/// Chunk size bounds and cut masks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerParams {
    pub min_size: usize,
    pub normal_size: usize,
    pub max_size: usize,
    pub mask_small: u64,
    pub mask_large: u64,
}

impl Default for ChunkerParams {
    fn default() -> Self {
        Self {
            min_size: 2 * 1024,
            normal_size: 8 * 1024,
            max_size: 64 * 1024,
            mask_small: DEFAULT_GEAR_MASK,
            mask_large: DEFAULT_GEAR_MASK,
        }
    }
}

impl ChunkerParams {
    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        let params = Self {
            min_size: config.min_size as usize,
            normal_size: config.normal_size as usize,
            max_size: config.max_size as usize,
            mask_small: config.mask_small,
            mask_large: config.mask_large,
        };
        params.validate()?;
        Ok(params)
    }

    /// `0 < min < normal <= max`, and `max` must fit a chunk header length
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 || self.min_size >= self.normal_size || self.normal_size > self.max_size
        {
            return Err(CasError::InvalidArgument(format!(
                "chunk sizes must satisfy 0 < min < normal <= max, got {}/{}/{}",
                self.min_size, self.normal_size, self.max_size
            )));
        }
        if self.max_size as u64 > u32::MAX as u64 {
            return Err(CasError::InvalidArgument(format!(
                "max chunk size {} exceeds the 32-bit length field",
                self.max_size
            )));
        }
        Ok(())
    }
}

/// Gear-hash boundary detector
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunker {
    params: ChunkerParams,
}

impl Chunker {
    pub fn new(params: ChunkerParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &ChunkerParams {
        &self.params
    }

    /// Bytes the detector needs to see for `remaining` bytes of input
    #[inline]
    pub fn window_len(&self, remaining: u64) -> usize {
        remaining.min(self.params.max_size as u64) as usize
    }

    /// Length of the next chunk.
    ///
    /// `window` holds the input from the current position and must contain
    /// at least [`window_len(remaining)`](Self::window_len) bytes.
    pub fn next_chunk_length(&self, remaining: u64, window: &[u8]) -> Result<usize> {
        if remaining <= self.params.min_size as u64 {
            return Ok(remaining as usize);
        }
        let n = self.window_len(remaining);
        if window.len() < n {
            return Err(CasError::InvalidArgument(format!(
                "window of {} bytes, detector needs {}",
                window.len(),
                n
            )));
        }
        Ok(self.cut(&window[..n]))
    }

    /// Length of the next chunk, reading the window from `reader`.
    ///
    /// `window` is resized to the bytes consumed; the chunk is
    /// `window[..length]`. Short reads are retried until the window is full.
    pub fn next_chunk_length_from<R: Read>(
        &self,
        remaining: u64,
        reader: &mut R,
        window: &mut Vec<u8>,
    ) -> Result<usize> {
        let n = self.window_len(remaining);
        window.resize(n, 0);
        reader.read_exact(window)?;
        self.next_chunk_length(remaining, window)
    }

    /// Iterate `(offset, length)` chunk spans over an in-memory buffer
    pub fn chunks<'a>(&self, data: &'a [u8]) -> Chunks<'a> {
        Chunks {
            chunker: *self,
            data,
            pos: 0,
        }
    }

    /// Cut point inside `window`, where `window.len()` is the scan limit
    fn cut(&self, window: &[u8]) -> usize {
        let p = &self.params;
        let n = window.len();
        if n <= p.min_size {
            return n;
        }
        let normal = p.normal_size.min(n);

        let mut fp = 0u64;
        let mut i = p.min_size;
        while i < normal {
            fp = (fp << 1).wrapping_add(GEAR[window[i] as usize]);
            if fp & p.mask_small == 0 {
                return i;
            }
            i += 1;
        }
        while i < n {
            fp = (fp << 1).wrapping_add(GEAR[window[i] as usize]);
            if fp & p.mask_large == 0 {
                return i;
            }
            i += 1;
        }
        n
    }
}

/// Chunk spans over a byte slice
pub struct Chunks<'a> {
    chunker: Chunker,
    data: &'a [u8],
    pos: usize,
}

impl Iterator for Chunks<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let n = self.chunker.window_len(rest.len() as u64);
        let len = self.chunker.cut(&rest[..n]);
        let span = (self.pos, len);
        self.pos += len;
        Some(span)
    }
}
