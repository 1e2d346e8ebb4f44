//! The transaction log.
//!
//! Every broker operation that must survive a crash is appended here before
//! it is acknowledged. A checkpoint moves what is still needed into the
//! prepared store and truncates the log back to its header.
//!
//! ## Layout
//!
//! ```text
//! header: | magic (4) | version (2) | status (2) | checkpoint_seq (8) | cookie (8) | crc32 (4) |
//! record: | length (4) | type (4) | sequence (8) | body (CBOR) | crc32 (4) |
//! ```
//!
//! ## Recovery policy
//!
//! - A record cut short at the end of the file is a crash mid-append: the
//!   tail is dropped when the log is opened.
//! - A checksum mismatch drops the damaged record and everything after it,
//!   with a [`CorruptionWarning`](crate::CorruptionWarning).
//! - A damaged header or a cookie from another record format refuses to
//!   open.
//! - If the header does not say `CLEAN_SHUTDOWN`, the records must be
//!   replayed before anything new is appended.

mod iterator;
mod record;
mod writer;

pub use iterator::LogIterator;
pub use record::{
    compute_crc32, LogEvent, LogHeader, LogRecord, LogRecordType, LogStatus, LOG_HEADER_SIZE,
};
pub use writer::{CheckpointListener, CheckpointReason, LogOptions, TransactionLog};
