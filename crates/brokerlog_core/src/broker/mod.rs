//! Interfaces to the broker's message store and destination directory.
//!
//! The transaction log never stores message payloads itself. Replay and
//! checkpoint reach the broker's stores through these traits.

mod memory;

pub use memory::{InMemoryMessageStore, MessageStoreSnapshot};

use crate::error::CoreResult;
use crate::transaction::SentMessage;
use crate::types::{ConsumerId, DestinationId, DestinationType, MessageId};
use std::collections::HashMap;
use std::fmt;

/// Delivery state of one consumer interest on one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InterestState {
    /// Routed, not delivered yet.
    Routed,
    /// Delivered, not acknowledged yet.
    Delivered,
    /// Acknowledged.
    Acknowledged,
}

impl fmt::Display for InterestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Routed => "routed",
            Self::Delivered => "delivered",
            Self::Acknowledged => "acknowledged",
        })
    }
}

/// The broker's persistent message store.
pub trait MessageStore: Send + Sync {
    /// Stores a message routed to `message.interests`.
    fn store_message(&self, destination: &DestinationId, message: &SentMessage) -> CoreResult<()>;

    /// Removes a message and its interest states.
    fn remove_message(&self, destination: &DestinationId, message_id: MessageId) -> CoreResult<()>;

    /// Returns true if the message is stored.
    fn contains_message(&self, destination: &DestinationId, message_id: MessageId)
        -> CoreResult<bool>;

    /// Records the state of one interest.
    fn update_interest_state(
        &self,
        destination: &DestinationId,
        message_id: MessageId,
        consumer: ConsumerId,
        state: InterestState,
    ) -> CoreResult<()>;

    /// Returns the state of every interest the message is routed to.
    fn interest_states(
        &self,
        destination: &DestinationId,
        message_id: MessageId,
    ) -> CoreResult<HashMap<ConsumerId, InterestState>>;

    /// Makes every change durable.
    fn force_to_disk(&self) -> CoreResult<()>;
}

/// The broker's registry of destinations.
pub trait DestinationDirectory: Send + Sync {
    /// Looks up a destination, creating it if it does not exist.
    fn get_or_create_destination(
        &self,
        name: &str,
        kind: DestinationType,
    ) -> CoreResult<DestinationId>;

    /// Loads the destination's stored messages into memory.
    fn load_destination(&self, destination: &DestinationId) -> CoreResult<()>;
}
