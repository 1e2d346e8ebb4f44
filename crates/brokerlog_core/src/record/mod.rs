//! Variable-length record storage for prepared transactions.
//!
//! Small records share one growable region file with an internal free list.
//! Records larger than [`RecordStoreConfig::max_region_record_size`] (or all
//! records, when the region is disabled) get a numbered file of their own,
//! recycled through a pool.
//!
//! Every record carries eight bytes of client data that can be rewritten in
//! place without touching the payload.
//!
//! [`RecordStoreConfig::max_region_record_size`]: crate::config::RecordStoreConfig

mod pool;
mod region;
mod store;
mod tag;

pub use store::{RecordStore, StoredRecord};
pub use tag::{FileTag, RecordTag};

use std::fmt;

/// Number of client-data bytes attached to every record.
pub const CLIENT_DATA_LEN: usize = 8;

/// Small fixed-size field stored beside each record payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientData([u8; CLIENT_DATA_LEN]);

impl ClientData {
    /// Creates client data from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; CLIENT_DATA_LEN]) -> Self {
        Self(bytes)
    }

    /// Copies up to [`CLIENT_DATA_LEN`] bytes from `bytes`, zero-padding
    /// the rest.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut out = [0u8; CLIENT_DATA_LEN];
        let n = bytes.len().min(CLIENT_DATA_LEN);
        out[..n].copy_from_slice(&bytes[..n]);
        Self(out)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CLIENT_DATA_LEN] {
        &self.0
    }

    /// Returns the raw bytes for modification.
    pub fn as_mut_bytes(&mut self) -> &mut [u8; CLIENT_DATA_LEN] {
        &mut self.0
    }
}

/// Location of a stored record.
///
/// Handles are only valid until the next [`RecordStore::compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordHandle {
    /// Byte offset of the block in the region file.
    Region(u64),
    /// Number of an individual overflow file.
    File(u32),
}

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Region(offset) => write!(f, "vrfile@{offset}"),
            Self::File(number) => write!(f, "file:{number}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_data_from_short_slice() {
        let c = ClientData::from_slice(&[1, 2, 3]);
        assert_eq!(c.as_bytes(), &[1, 2, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn handle_display() {
        assert_eq!(RecordHandle::Region(24).to_string(), "vrfile@24");
        assert_eq!(RecordHandle::File(7).to_string(), "file:7");
    }
}
