//! Transaction records and their lifecycle state.

use crate::types::{BrokerAddress, ConsumerId, DestinationId, MessageId, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a broker transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Work is being collected.
    Started,
    /// Phase one of two-phase commit is durable.
    Prepared,
    /// The transaction committed.
    Committed,
    /// The transaction rolled back.
    RolledBack,
}

impl TransactionState {
    /// Converts the state to its client-data byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Started => 1,
            Self::Prepared => 2,
            Self::Committed => 3,
            Self::RolledBack => 4,
        }
    }

    /// Converts a client-data byte back to a state.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Started),
            2 => Some(Self::Prepared),
            3 => Some(Self::Committed),
            4 => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Returns true once the outcome is decided.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Started => "STARTED",
            Self::Prepared => "PREPARED",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLEDBACK",
        })
    }
}

/// Who coordinates a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Coordinated by this broker alone.
    Local,
    /// Coordinated by this broker across participant brokers.
    Cluster,
    /// Coordinated by another (home) broker; this broker applies its share.
    Remote,
}

impl TransactionKind {
    /// Every kind, in coordinator order.
    pub const ALL: [Self; 3] = [Self::Local, Self::Cluster, Self::Remote];

    /// Stable index of the kind, used for per-kind tables.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Local => 0,
            Self::Cluster => 1,
            Self::Remote => 2,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Cluster => "cluster",
            Self::Remote => "remote",
        })
    }
}

/// A message produced by a transaction or a non-transacted send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    /// Destination the message was sent to.
    pub destination: DestinationId,
    /// System message id.
    pub message_id: MessageId,
    /// Encoded message, opaque to this crate.
    pub payload: Vec<u8>,
    /// Consumer interests the message was routed to.
    pub interests: Vec<ConsumerId>,
    /// Expiration as milliseconds since the Unix epoch.
    pub expires_at: Option<u64>,
}

impl SentMessage {
    /// Creates a message routed to `interests` that never expires.
    pub fn new(
        destination: DestinationId,
        message_id: MessageId,
        payload: Vec<u8>,
        interests: Vec<ConsumerId>,
    ) -> Self {
        Self {
            destination,
            message_id,
            payload,
            interests,
            expires_at: None,
        }
    }

    /// Sets the expiration time.
    #[must_use]
    pub fn expiring_at(mut self, millis: u64) -> Self {
        self.expires_at = Some(millis);
        self
    }

    /// Returns true if the message expired before `now_millis`.
    #[must_use]
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_millis)
    }
}

/// A consumer acknowledgement of one message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageAck {
    /// Destination holding the message.
    pub destination: DestinationId,
    /// Acknowledged message.
    pub message_id: MessageId,
    /// Interest that acknowledged it.
    pub consumer: ConsumerId,
}

impl MessageAck {
    /// Creates an acknowledgement.
    pub fn new(destination: DestinationId, message_id: MessageId, consumer: ConsumerId) -> Self {
        Self {
            destination,
            message_id,
            consumer,
        }
    }
}

/// The sends and acknowledgements of one transaction, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    /// Messages sent, in send order.
    pub sent: Vec<SentMessage>,
    /// Messages acknowledged, in ack order.
    pub acks: Vec<MessageAck>,
}

impl Workload {
    /// Creates an empty workload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sent message.
    #[must_use]
    pub fn send(mut self, message: SentMessage) -> Self {
        self.sent.push(message);
        self
    }

    /// Adds an acknowledgement.
    #[must_use]
    pub fn ack(mut self, ack: MessageAck) -> Self {
        self.acks.push(ack);
        self
    }

    /// Returns true if there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.acks.is_empty()
    }
}

/// A participant broker of a cluster transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant address.
    pub broker: BrokerAddress,
    /// Whether the participant reported completion.
    pub completed: bool,
}

/// Data that only some transaction kinds carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KindDetails {
    /// No extra data.
    Local,
    /// Brokers that must each confirm completion.
    Cluster {
        /// Participant brokers.
        participants: Vec<Participant>,
    },
    /// The coordinating broker and the acknowledgements applied here.
    Remote {
        /// The broker that owns the transaction.
        home_broker: BrokerAddress,
        /// Acknowledgements of messages held by this broker.
        remote_acks: Vec<MessageAck>,
    },
}

/// A broker transaction as logged and stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction id.
    pub id: TransactionId,
    /// Current state.
    pub state: TransactionState,
    /// Committed in a single phase without a prepare record.
    pub one_phase: bool,
    /// Sends and acknowledgements.
    pub workload: Workload,
    /// Kind-specific data.
    pub details: KindDetails,
    /// No further participant confirmations are outstanding.
    pub complete: bool,
}

impl TransactionRecord {
    /// Creates a local transaction in the `Prepared` state.
    #[must_use]
    pub fn local(id: TransactionId, workload: Workload) -> Self {
        Self::with_details(id, workload, KindDetails::Local)
    }

    /// Creates a cluster transaction over `brokers`, none of them complete.
    #[must_use]
    pub fn cluster(
        id: TransactionId,
        workload: Workload,
        brokers: impl IntoIterator<Item = BrokerAddress>,
    ) -> Self {
        let participants = brokers
            .into_iter()
            .map(|broker| Participant {
                broker,
                completed: false,
            })
            .collect();
        Self::with_details(id, workload, KindDetails::Cluster { participants })
    }

    /// Creates a remote transaction owned by `home_broker`.
    #[must_use]
    pub fn remote(id: TransactionId, home_broker: BrokerAddress, remote_acks: Vec<MessageAck>) -> Self {
        Self::with_details(
            id,
            Workload::new(),
            KindDetails::Remote {
                home_broker,
                remote_acks,
            },
        )
    }

    fn with_details(id: TransactionId, workload: Workload, details: KindDetails) -> Self {
        Self {
            id,
            state: TransactionState::Prepared,
            one_phase: false,
            workload,
            details,
            complete: false,
        }
    }

    /// Marks the transaction as a one-phase commit.
    #[must_use]
    pub fn one_phase(mut self) -> Self {
        self.one_phase = true;
        self.state = TransactionState::Committed;
        self
    }

    /// Returns the transaction kind.
    #[must_use]
    pub fn kind(&self) -> TransactionKind {
        match self.details {
            KindDetails::Local => TransactionKind::Local,
            KindDetails::Cluster { .. } => TransactionKind::Cluster,
            KindDetails::Remote { .. } => TransactionKind::Remote,
        }
    }

    /// Returns the cluster participants, empty for other kinds.
    #[must_use]
    pub fn participants(&self) -> &[Participant] {
        match &self.details {
            KindDetails::Cluster { participants } => participants,
            _ => &[],
        }
    }

    /// Returns the acknowledgements relayed by the home broker.
    #[must_use]
    pub fn remote_acks(&self) -> &[MessageAck] {
        match &self.details {
            KindDetails::Remote { remote_acks, .. } => remote_acks,
            _ => &[],
        }
    }

    /// Returns true when every participant reported completion.
    ///
    /// Vacuously true for kinds without participants.
    #[must_use]
    pub fn all_participants_complete(&self) -> bool {
        self.participants().iter().all(|p| p.completed)
    }

    /// Marks `broker` complete. Returns `None` if it is not a participant,
    /// otherwise whether every participant is now complete.
    pub fn complete_participant(&mut self, broker: &BrokerAddress) -> Option<bool> {
        let KindDetails::Cluster { participants } = &mut self.details else {
            return None;
        };
        let entry = participants.iter_mut().find(|p| &p.broker == broker)?;
        entry.completed = true;
        Some(participants.iter().all(|p| p.completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(name: &str) -> BrokerAddress {
        BrokerAddress::new(name)
    }

    #[test]
    fn state_byte_roundtrip() {
        for s in [
            TransactionState::Started,
            TransactionState::Prepared,
            TransactionState::Committed,
            TransactionState::RolledBack,
        ] {
            assert_eq!(TransactionState::from_byte(s.as_byte()), Some(s));
        }
        assert_eq!(TransactionState::from_byte(0), None);
    }

    #[test]
    fn kind_follows_details() {
        let id = TransactionId::new(1);
        assert_eq!(TransactionRecord::local(id, Workload::new()).kind(), TransactionKind::Local);
        assert_eq!(
            TransactionRecord::cluster(id, Workload::new(), [broker("a")]).kind(),
            TransactionKind::Cluster
        );
        assert_eq!(
            TransactionRecord::remote(id, broker("home"), Vec::new()).kind(),
            TransactionKind::Remote
        );
    }

    #[test]
    fn one_phase_commits_immediately() {
        let txn = TransactionRecord::local(TransactionId::new(3), Workload::new()).one_phase();
        assert!(txn.one_phase);
        assert_eq!(txn.state, TransactionState::Committed);
    }

    #[test]
    fn participants_complete_in_any_order() {
        let mut txn = TransactionRecord::cluster(
            TransactionId::new(2),
            Workload::new(),
            [broker("a"), broker("b"), broker("c")],
        );
        assert!(!txn.all_participants_complete());

        assert_eq!(txn.complete_participant(&broker("c")), Some(false));
        assert_eq!(txn.complete_participant(&broker("a")), Some(false));
        assert_eq!(txn.complete_participant(&broker("x")), None);
        assert_eq!(txn.complete_participant(&broker("b")), Some(true));
        assert!(txn.all_participants_complete());
    }

    #[test]
    fn expiry() {
        let msg = SentMessage::new(DestinationId::queue("q"), MessageId::new(1), vec![], vec![])
            .expiring_at(1_000);
        assert!(!msg.is_expired(999));
        assert!(msg.is_expired(1_000));
    }
}
