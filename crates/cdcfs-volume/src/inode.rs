//! On-disk inode records.
//!
//! Each inode is 128 bytes:
//!
//! ```text
//! off  size  field
//!   0     2  mode
//!   2     2  name_len
//!   8     8  size
//!  16    40  zones[10] (u32 each)
//!  56    64  name
//! ```
//!
//! Zone usage depends on the mode. Plain files keep a contiguous extent in
//! `zones[0]` (first block) and `zones[1]` (block count). Chunked files keep
//! their segment list in `zones[1..=3]` (head, count, tail). Symlinks store
//! their target as a plain extent.

use crate::codec::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use crate::{Result, VolumeError};

pub const INODE_SIZE: usize = 128;
pub const NAME_MAX: usize = 64;
pub const ZONE_SLOTS: usize = 10;

const ZONES_AT: usize = 16;
const NAME_AT: usize = 56;

/// File type stored in the inode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum FileMode {
    #[default]
    Free = 0,
    /// Regular file stored as one contiguous extent
    Plain = 1,
    /// Regular file stored as a segment list over the chunk store
    Chunked = 2,
    Symlink = 3,
}

impl FileMode {
    fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(FileMode::Free),
            1 => Some(FileMode::Plain),
            2 => Some(FileMode::Chunked),
            3 => Some(FileMode::Symlink),
            _ => None,
        }
    }

    /// Regular files, whatever their storage
    pub fn is_regular(self) -> bool {
        matches!(self, FileMode::Plain | FileMode::Chunked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::Free => "free",
            FileMode::Plain => "plain",
            FileMode::Chunked => "chunked",
            FileMode::Symlink => "symlink",
        }
    }
}

/// Segment-list location of a chunked file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentListMeta {
    pub head: u64,
    pub count: u64,
    pub tail: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Inode {
    pub ino: u32,
    pub mode: FileMode,
    pub size: u64,
    pub zones: [u32; ZONE_SLOTS],
    name: String,
}

impl Inode {
    pub fn new(ino: u32, mode: FileMode, name: &str) -> Result<Self> {
        check_name(name)?;
        Ok(Self {
            ino,
            mode,
            size: 0,
            zones: [0; ZONE_SLOTS],
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_free(&self) -> bool {
        self.mode == FileMode::Free
    }

    /// `(first_block, block_count)` of a plain or symlink extent
    pub fn extent(&self) -> Option<(u64, u64)> {
        match self.mode {
            FileMode::Plain | FileMode::Symlink => {
                Some((self.zones[0] as u64, self.zones[1] as u64))
            }
            _ => None,
        }
    }

    pub fn set_extent(&mut self, start: u64, blocks: u64) -> Result<()> {
        self.zones[0] = zone_value(start)?;
        self.zones[1] = zone_value(blocks)?;
        Ok(())
    }

    /// Segment list of a chunked file
    pub fn segment_list(&self) -> Option<SegmentListMeta> {
        (self.mode == FileMode::Chunked).then(|| SegmentListMeta {
            head: self.zones[1] as u64,
            count: self.zones[2] as u64,
            tail: self.zones[3] as u64,
        })
    }

    /// Switch to chunked storage, replacing the zone slots.
    ///
    /// Fails without modifying the inode when a value does not fit a zone.
    pub fn set_chunked(&mut self, meta: SegmentListMeta) -> Result<()> {
        let head = zone_value(meta.head)?;
        let count = zone_value(meta.count)?;
        let tail = zone_value(meta.tail)?;
        self.zones = [0; ZONE_SLOTS];
        self.zones[1] = head;
        self.zones[2] = count;
        self.zones[3] = tail;
        self.mode = FileMode::Chunked;
        Ok(())
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[..INODE_SIZE].fill(0);
        put_u16(buf, 0, self.mode as u16);
        put_u16(buf, 2, self.name.len() as u16);
        put_u64(buf, 8, self.size);
        for (i, zone) in self.zones.iter().enumerate() {
            put_u32(buf, ZONES_AT + i * 4, *zone);
        }
        buf[NAME_AT..NAME_AT + self.name.len()].copy_from_slice(self.name.as_bytes());
    }

    pub fn read_from(ino: u32, buf: &[u8]) -> Result<Self> {
        let raw_mode = get_u16(buf, 0);
        let mode = FileMode::from_raw(raw_mode)
            .ok_or_else(|| VolumeError::Corrupt(format!("inode {}: bad mode {}", ino, raw_mode)))?;

        let name_len = get_u16(buf, 2) as usize;
        if name_len > NAME_MAX {
            return Err(VolumeError::Corrupt(format!(
                "inode {}: name length {}",
                ino, name_len
            )));
        }
        let name = std::str::from_utf8(&buf[NAME_AT..NAME_AT + name_len])
            .map_err(|_| VolumeError::Corrupt(format!("inode {}: name is not UTF-8", ino)))?
            .to_string();

        let mut zones = [0u32; ZONE_SLOTS];
        for (i, zone) in zones.iter_mut().enumerate() {
            *zone = get_u32(buf, ZONES_AT + i * 4);
        }

        Ok(Self {
            ino,
            mode,
            size: get_u64(buf, 8),
            zones,
            name,
        })
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VolumeError::EmptyName);
    }
    if name.len() > NAME_MAX {
        return Err(VolumeError::NameTooLong {
            len: name.len(),
            max: NAME_MAX,
        });
    }
    Ok(())
}

fn zone_value(value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| VolumeError::Corrupt(format!("{} does not fit in a 32-bit zone", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_inode_roundtrip() {
        let mut inode = Inode::new(5, FileMode::Plain, "report.bin").unwrap();
        inode.size = 12345;
        inode.set_extent(40, 13).unwrap();

        let mut buf = [0u8; INODE_SIZE];
        inode.write_to(&mut buf);
        let decoded = Inode::read_from(5, &buf).unwrap();
        assert_eq!(decoded, inode);
        assert_eq!(decoded.extent(), Some((40, 13)));
        assert_eq!(decoded.segment_list(), None);
    }

    #[test]
    fn test_set_chunked() {
        let mut inode = Inode::new(2, FileMode::Plain, "a").unwrap();
        inode.set_extent(40, 13).unwrap();
        inode
            .set_chunked(SegmentListMeta {
                head: 100,
                count: 7,
                tail: 101,
            })
            .unwrap();
        assert_eq!(inode.mode, FileMode::Chunked);
        assert_eq!(inode.zones[0], 0);
        assert_eq!(&inode.zones[1..4], &[100, 7, 101]);
        assert_eq!(inode.extent(), None);
    }

    #[test]
    fn test_set_chunked_rejects_wide_values() {
        let mut inode = Inode::new(2, FileMode::Plain, "a").unwrap();
        inode.set_extent(40, 13).unwrap();
        let before = inode.clone();
        let result = inode.set_chunked(SegmentListMeta {
            head: 1,
            count: u32::MAX as u64 + 1,
            tail: 1,
        });
        assert!(result.is_err());
        assert_eq!(inode, before);
    }

    #[test]
    fn test_name_limits() {
        assert!(Inode::new(1, FileMode::Plain, &"x".repeat(NAME_MAX)).is_ok());
        assert!(matches!(
            Inode::new(1, FileMode::Plain, &"x".repeat(NAME_MAX + 1)),
            Err(VolumeError::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_bad_mode_is_corrupt() {
        let mut buf = [0u8; INODE_SIZE];
        buf[0] = 9;
        assert!(matches!(
            Inode::read_from(1, &buf),
            Err(VolumeError::Corrupt(_))
        ));
    }
}
