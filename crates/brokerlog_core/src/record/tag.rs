//! Lifecycle tags written at the start of every stored record.

use std::fmt;

/// Tag of a block inside the region file.
///
/// Written last when a record is stored and first when it is freed, so a
/// scan after a crash can tell finished records from torn ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RecordTag {
    /// Reusable space.
    Free = 0x4652,
    /// Reserved by `allocate`, nothing written yet.
    Allocated = 0x414C,
    /// Payload write in progress.
    Pending = 0x5057,
    /// Payload fully written.
    Done = 0x444E,
}

impl RecordTag {
    /// Converts a raw tag to a record tag.
    #[must_use]
    pub const fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0x4652 => Some(Self::Free),
            0x414C => Some(Self::Allocated),
            0x5057 => Some(Self::Pending),
            0x444E => Some(Self::Done),
            _ => None,
        }
    }

    /// Returns the raw tag value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for RecordTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Free => "free",
            Self::Allocated => "allocated",
            Self::Pending => "pending",
            Self::Done => "done",
        })
    }
}

/// Tag in the first bytes of an individual overflow file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTag {
    /// Holds a complete record.
    Good,
    /// Idle, kept for reuse.
    Free,
    /// A write was in progress.
    Writing,
}

impl FileTag {
    /// Size of the tag on disk.
    pub const LEN: usize = 4;

    /// Returns the on-disk bytes.
    #[must_use]
    pub const fn as_bytes(self) -> [u8; 4] {
        match self {
            Self::Good => *b"GOOD",
            Self::Free => *b"FREE",
            Self::Writing => *b"WRIT",
        }
    }

    /// Parses on-disk bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"GOOD" => Some(Self::Good),
            b"FREE" => Some(Self::Free),
            b"WRIT" => Some(Self::Writing),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tag_roundtrip() {
        for t in [
            RecordTag::Free,
            RecordTag::Allocated,
            RecordTag::Pending,
            RecordTag::Done,
        ] {
            assert_eq!(RecordTag::from_u16(t.as_u16()), Some(t));
        }
        assert_eq!(RecordTag::from_u16(0), None);
    }

    #[test]
    fn file_tag_roundtrip() {
        for t in [FileTag::Good, FileTag::Free, FileTag::Writing] {
            assert_eq!(FileTag::from_bytes(&t.as_bytes()), Some(t));
        }
        assert_eq!(FileTag::from_bytes(b"\0\0\0\0"), None);
    }
}
