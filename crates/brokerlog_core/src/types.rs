//! Identifier types shared across the transaction log core.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a broker transaction.
///
/// Assigned monotonically by the broker and never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Position of a record in the transaction log.
///
/// Restarts from zero after every checkpoint reset; the log header's
/// checkpoint sequence distinguishes generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// System-assigned message identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Creates a new message ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg:{}", self.0)
    }
}

/// Identifier of a consumer interest on a message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConsumerId(pub u64);

impl ConsumerId {
    /// The single interest every queue message carries.
    ///
    /// Queue deliveries are acknowledged against this id regardless of
    /// which receiver consumed the message.
    pub const QUEUE: Self = Self(0);

    /// Creates a new consumer ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid:{}", self.0)
    }
}

/// Network address of a broker in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BrokerAddress(pub String);

impl BrokerAddress {
    /// Creates a broker address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a destination is point-to-point or publish/subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationType {
    /// Point-to-point; one interest per message.
    Queue,
    /// Publish/subscribe; one interest per subscriber.
    Topic,
}

/// A named destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationId {
    /// Destination name.
    pub name: String,
    /// Destination type.
    pub kind: DestinationType,
}

impl DestinationId {
    /// Creates a queue destination id.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationType::Queue,
        }
    }

    /// Creates a topic destination id.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationType::Topic,
        }
    }

    /// Returns true if this is a queue.
    #[must_use]
    pub fn is_queue(&self) -> bool {
        self.kind == DestinationType::Queue
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            DestinationType::Queue => 'Q',
            DestinationType::Topic => 'T',
        };
        write!(f, "{prefix}:{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_ordering_and_display() {
        assert!(TransactionId::new(1) < TransactionId::new(2));
        assert_eq!(TransactionId::new(7).to_string(), "txn:7");
    }

    #[test]
    fn sequence_number_next() {
        assert_eq!(SequenceNumber::new(5).next().as_u64(), 6);
    }

    #[test]
    fn destination_display() {
        assert_eq!(DestinationId::queue("orders").to_string(), "Q:orders");
        assert_eq!(DestinationId::topic("prices").to_string(), "T:prices");
        assert!(DestinationId::queue("q").is_queue());
    }
}
