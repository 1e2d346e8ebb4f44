//! Broker transactions and the per-kind coordinators that track them.
//!
//! A transaction is Local, Cluster or Remote. One [`TransactionCoordinator`]
//! per kind decides when a transaction may be dropped from memory, when it
//! must be kept in the prepared store, and when the store copy may go.

mod coordinator;
mod state;

pub use coordinator::{
    DrainOutcome, DrainSignal, KindPolicy, Residence, TransactionCoordinator,
};
pub use state::{
    KindDetails, MessageAck, Participant, SentMessage, TransactionKind, TransactionRecord,
    TransactionState, Workload,
};
