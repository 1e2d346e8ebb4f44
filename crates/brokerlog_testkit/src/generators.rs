//! Property-based test generators using proptest.
//!
//! Strategies produce broker workloads: sequences of [`BrokerOp`]s for the
//! [`OpDriver`](crate::integration::OpDriver), and single messages and
//! transactions for narrower tests.

use brokerlog_core::{
    BrokerAddress, ConsumerId, DestinationId, MessageAck, MessageId, SentMessage, TransactionId,
    TransactionRecord, Workload,
};
use proptest::prelude::*;

/// Where a generated message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One of a few queues, by index.
    Queue(u8),
    /// One of a few topics, by index, with its subscribers.
    Topic(u8, Vec<u64>),
}

impl Target {
    /// Builds the message with id `id` for this target.
    pub fn message(&self, id: u64) -> SentMessage {
        match self {
            Self::Queue(q) => SentMessage::new(
                DestinationId::queue(format!("queue-{q}")),
                MessageId::new(id),
                id.to_le_bytes().to_vec(),
                vec![ConsumerId::QUEUE],
            ),
            Self::Topic(t, subscribers) => SentMessage::new(
                DestinationId::topic(format!("topic-{t}")),
                MessageId::new(id),
                id.to_le_bytes().to_vec(),
                subscribers.iter().copied().map(ConsumerId::new).collect(),
            ),
        }
    }
}

/// One step of a generated broker workload.
///
/// `pick` fields select among whatever exists when the step runs, modulo
/// its count; a step with nothing to pick from does nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    /// A one-phase local commit sending one message.
    OnePhaseSend(Target),
    /// A local transaction prepared with one send and possibly one ack of
    /// a stored message.
    Prepare {
        /// Where the transaction sends.
        target: Target,
        /// Stored message to acknowledge.
        ack: Option<usize>,
    },
    /// Commits or rolls back a prepared transaction.
    Resolve {
        /// Prepared transaction to resolve.
        pick: usize,
        /// Commit if true, roll back otherwise.
        commit: bool,
    },
    /// A send outside any transaction.
    NonTransactedSend(Target),
    /// An acknowledgement outside any transaction.
    Ack {
        /// Stored message to acknowledge.
        pick: usize,
    },
    /// Removal of a stored message.
    Remove {
        /// Stored message to remove.
        pick: usize,
    },
    /// A checkpoint.
    Checkpoint,
}

/// Strategy for subscriber sets: one to four distinct subscribers.
pub fn subscribers_strategy() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::btree_set(1u64..8, 1..=4).prop_map(|set| set.into_iter().collect())
}

/// Strategy for message targets over three queues and three topics.
pub fn target_strategy() -> impl Strategy<Value = Target> {
    prop_oneof![
        (0u8..3).prop_map(Target::Queue),
        (0u8..3, subscribers_strategy()).prop_map(|(t, subs)| Target::Topic(t, subs)),
    ]
}

/// Strategy for a single broker step. Checkpoints are rare.
pub fn broker_op_strategy() -> impl Strategy<Value = BrokerOp> {
    prop_oneof![
        4 => target_strategy().prop_map(BrokerOp::OnePhaseSend),
        3 => (target_strategy(), prop::option::of(any::<usize>()))
            .prop_map(|(target, ack)| BrokerOp::Prepare { target, ack }),
        3 => (any::<usize>(), any::<bool>())
            .prop_map(|(pick, commit)| BrokerOp::Resolve { pick, commit }),
        2 => target_strategy().prop_map(BrokerOp::NonTransactedSend),
        2 => any::<usize>().prop_map(|pick| BrokerOp::Ack { pick }),
        2 => any::<usize>().prop_map(|pick| BrokerOp::Remove { pick }),
        1 => Just(BrokerOp::Checkpoint),
    ]
}

/// Strategy for a workload of up to `max_len` steps.
pub fn broker_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<BrokerOp>> {
    prop::collection::vec(broker_op_strategy(), 1..=max_len)
}

/// Strategy for a sent message with a fixed id.
pub fn sent_message_strategy(id: u64) -> impl Strategy<Value = SentMessage> {
    target_strategy().prop_map(move |target| target.message(id))
}

/// Strategy for a local transaction with `sends` messages, ids starting at
/// `first_message`.
pub fn local_transaction_strategy(
    id: u64,
    first_message: u64,
    sends: usize,
) -> impl Strategy<Value = TransactionRecord> {
    prop::collection::vec(target_strategy(), sends).prop_map(move |targets| {
        let workload = targets
            .iter()
            .zip(first_message..)
            .fold(Workload::new(), |w, (target, msg)| w.send(target.message(msg)));
        TransactionRecord::local(TransactionId::new(id), workload)
    })
}

/// Strategy for a cluster transaction over `participants` brokers, named
/// `broker-0` and up.
pub fn cluster_transaction_strategy(
    id: u64,
    participants: usize,
) -> impl Strategy<Value = TransactionRecord> {
    sent_message_strategy(id).prop_map(move |message| {
        TransactionRecord::cluster(
            TransactionId::new(id),
            Workload::new().send(message),
            (0..participants).map(|i| BrokerAddress::new(format!("broker-{i}"))),
        )
    })
}

/// Strategy for a remote transaction acknowledging `acks` queue messages
/// numbered from 1.
pub fn remote_transaction_strategy(id: u64, acks: u64) -> impl Strategy<Value = TransactionRecord> {
    (0u8..3).prop_map(move |q| {
        let acks = (1..=acks)
            .map(|m| {
                MessageAck::new(
                    DestinationId::queue(format!("queue-{q}")),
                    MessageId::new(m),
                    ConsumerId::QUEUE,
                )
            })
            .collect();
        TransactionRecord::remote(TransactionId::new(id), BrokerAddress::new("home"), acks)
    })
}

/// Strategy for the order in which `n` participants report completion.
pub fn arrival_order_strategy(n: usize) -> impl Strategy<Value = Vec<usize>> {
    Just((0..n).collect::<Vec<_>>()).prop_shuffle()
}
