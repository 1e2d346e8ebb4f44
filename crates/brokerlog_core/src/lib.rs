//! # brokerlog core
//!
//! Crash recovery for a message broker's transaction state.
//!
//! This crate provides:
//! - [`TransactionLog`]: append-only, checksummed log of prepares,
//!   completions and non-transacted operations
//! - [`PreparedTransactionStore`]: transactions that must outlive a log
//!   truncation, on top of the [`record`] store
//! - [`TransactionCoordinator`]: one per transaction kind, deciding what
//!   stays in memory, what is stored and what may be evicted
//! - [`CheckpointCoordinator`]: truncates the log once committed work has
//!   drained into the message store
//! - [`RecoveryReplayer`]: rebuilds state after a restart
//! - [`TxnLogManager`]: the façade a broker uses, tying the above together
//!
//! The message store and destination directory stay outside the crate,
//! behind the traits in [`broker`].
//!
//! ```rust,ignore
//! use brokerlog_core::{Config, TxnLogManager};
//!
//! let manager = TxnLogManager::open(path, Config::default(), messages, destinations)?;
//! for warning in &manager.recovery_report().warnings {
//!     eprintln!("lost: {warning}");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod checkpoint;
mod codec;
mod config;
mod dir;
mod error;
mod log_manager;
mod logged;
mod prepared;
pub mod record;
mod replay;
mod stats;
pub mod transaction;
mod types;
pub mod wal;

pub use broker::{DestinationDirectory, InMemoryMessageStore, InterestState, MessageStore};
pub use checkpoint::{CheckpointCoordinator, CheckpointPhase, CheckpointScheduler, CheckpointSummary};
pub use codec::RECORD_FORMAT_VERSION;
pub use config::{Config, RecordStoreConfig};
pub use dir::{ConversionDirection, StoreDir, PREPARED_STORE_DIR, TXN_LOG_FILE};
pub use error::{CoreError, CoreResult, CorruptionWarning};
pub use log_manager::TxnLogManager;
pub use logged::LoggedMessages;
pub use prepared::{InPlaceUpdate, LoadReport, PreparedTransactionStore, RecordUpdater, RewriteUpdate};
pub use record::{ClientData, RecordHandle, RecordStore};
pub use replay::{RecoveryReplayer, RecoveryReport};
pub use stats::{LogStats, StatsSnapshot};
pub use transaction::{
    DrainOutcome, DrainSignal, KindDetails, KindPolicy, MessageAck, Participant, Residence,
    SentMessage, TransactionCoordinator, TransactionKind, TransactionRecord, TransactionState,
    Workload,
};
pub use types::{
    BrokerAddress, ConsumerId, DestinationId, DestinationType, MessageId, SequenceNumber,
    TransactionId,
};
pub use wal::{LogEvent, LogHeader, LogOptions, LogRecord, LogRecordType, LogStatus, TransactionLog};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
