//! Error types for the broker transaction log core.

use crate::transaction::TransactionState;
use crate::types::{BrokerAddress, TransactionId};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the transaction log core.
///
/// Draining timeouts are not errors; see [`crate::transaction::DrainOutcome`].
/// Record-level corruption found while scanning is usually reported as a
/// [`CorruptionWarning`] rather than returned.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] brokerlog_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A transaction record could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The transaction id is unknown to the component.
    #[error("transaction not found: {id}")]
    TransactionNotFound {
        /// The transaction that was referenced.
        id: TransactionId,
    },

    /// The transaction id is already stored.
    #[error("transaction already exists: {id}")]
    TransactionExists {
        /// The duplicate transaction.
        id: TransactionId,
    },

    /// A participant update was made against a stale transaction state.
    #[error("state conflict on {id}: expected {expected}, found {actual}")]
    StateConflict {
        /// The transaction being updated.
        id: TransactionId,
        /// The state the caller expected.
        expected: TransactionState,
        /// The state actually held.
        actual: TransactionState,
    },

    /// The broker is not a participant of the cluster transaction.
    #[error("broker {broker} is not a participant of {id}")]
    ParticipantNotFound {
        /// The cluster transaction.
        id: TransactionId,
        /// The unknown broker.
        broker: BrokerAddress,
    },

    /// A record handle does not refer to a live record.
    #[error("record not found: {message}")]
    RecordNotFound {
        /// Description of the handle.
        message: String,
    },

    /// A stored record failed its sanity checks.
    #[error("record corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// The transaction log header or a record envelope is damaged.
    #[error("transaction log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// A file has an unknown magic number or an incompatible version cookie.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Log-based and table-based transaction state were both found.
    #[error("inconsistent store format: {message}")]
    DualFormat {
        /// Description of what was found.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Another process holds the broker directory.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// The component has been closed.
    #[error("transaction log is closed")]
    Closed,
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a record corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates a record-not-found error.
    pub fn record_not_found(message: impl Into<String>) -> Self {
        Self::RecordNotFound {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a dual-format error.
    pub fn dual_format(message: impl Into<String>) -> Self {
        Self::DualFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for errors that stem from the filesystem.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage(_))
    }
}

/// A non-fatal corruption found while scanning persisted state.
///
/// The damaged record has already been freed or skipped when one of these
/// is produced. Each one stands for potential data loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionWarning {
    /// Where the damage was found, e.g. `vrfile@4096` or `txnlog#12`.
    pub location: String,
    /// What was wrong with it.
    pub message: String,
}

impl CorruptionWarning {
    /// Creates a warning.
    pub fn new(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CorruptionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}
