//! Streaming access to files on a [`DedupFs`].

use std::io::{self, Read, Seek, SeekFrom};

use cdcfs_volume::FileHandle;

use crate::fs::DedupFs;

/// `Read + Seek` over a file of any layout.
///
/// Unlike [`DedupFs::read`], each `read` call fills as much of the buffer as
/// the file allows, crossing segment boundaries.
pub struct ChunkedReader<'a> {
    fs: &'a DedupFs,
    handle: FileHandle,
    size: u64,
    pos: u64,
}

impl<'a> ChunkedReader<'a> {
    pub(crate) fn new(fs: &'a DedupFs, handle: FileHandle, size: u64) -> Self {
        Self {
            fs,
            handle,
            size,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for ChunkedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() && self.pos < self.size {
            let n = self
                .fs
                .read_any(self.handle, self.pos, &mut buf[filled..])
                .map_err(io::Error::other)?;
            if n == 0 {
                break;
            }
            filled += n;
            self.pos += n as u64;
        }
        Ok(filled)
    }
}

impl Seek for ChunkedReader<'_> {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match target {
            SeekFrom::Start(n) => {
                self.pos = n;
                return Ok(n);
            }
            SeekFrom::End(n) => (self.size, n),
            SeekFrom::Current(n) => (self.pos, n),
        };
        match base.checked_add_signed(offset) {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsOptions;
    use cdcfs_volume::MemoryDevice;
    use std::sync::Arc;

    fn chunked(data: &[u8]) -> (DedupFs, FileHandle) {
        let dev = Arc::new(MemoryDevice::new(1024, 4096).unwrap());
        let fs = DedupFs::format(dev, &FsOptions::default()).unwrap();
        let handle = fs.volume().create_file("f", data).unwrap();
        fs.chunk_file(handle).unwrap();
        (fs, handle)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 2654435761) >> 13) as u8).collect()
    }

    #[test]
    fn test_read_to_end() {
        let data = pattern(150 * 1024 + 3);
        let (fs, handle) = chunked(&data);
        let mut reader = fs.reader(handle).unwrap();
        assert_eq!(reader.len(), data.len() as u64);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(reader.read(&mut [0u8; 16]).unwrap(), 0);
    }

    #[test]
    fn test_read_crosses_segments() {
        let data = pattern(150 * 1024);
        let (fs, handle) = chunked(&data);
        let first = fs.segments(handle).unwrap()[0].size as usize;
        let mut reader = fs.reader(handle).unwrap();
        let mut buf = vec![0u8; first + 100];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, data[..first + 100]);
    }

    #[test]
    fn test_seek() {
        let data = pattern(100 * 1024);
        let (fs, handle) = chunked(&data);
        let mut reader = fs.reader(handle).unwrap();

        assert_eq!(reader.seek(SeekFrom::Start(5000)).unwrap(), 5000);
        let mut buf = [0u8; 10];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, data[5000..5010]);

        assert_eq!(reader.seek(SeekFrom::Current(-10)).unwrap(), 5000);
        assert_eq!(reader.seek(SeekFrom::End(-4)).unwrap(), data.len() as u64 - 4);
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, data[data.len() - 4..]);

        assert!(reader.seek(SeekFrom::Current(-1_000_000)).is_err());
        reader.seek(SeekFrom::End(100)).unwrap();
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_plain_file_stream() {
        let dev = Arc::new(MemoryDevice::new(1024, 4096).unwrap());
        let fs = DedupFs::format(dev, &FsOptions::default()).unwrap();
        let handle = fs.volume().create_file("plain", b"not chunked").unwrap();
        let mut out = String::new();
        fs.reader(handle).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "not chunked");
    }
}
