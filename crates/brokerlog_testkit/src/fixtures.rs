//! Test fixtures: a broker directory with a crashable log and an in-memory
//! message store.

use crate::crash::CrashableBackend;
use brokerlog_core::{
    Config, ConsumerId, CoreResult, DestinationDirectory, DestinationId, InMemoryMessageStore,
    InterestState, MessageAck, MessageId, MessageStore, SentMessage, TransactionId, TransactionRecord,
    TxnLogManager, Workload,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// A broker whose log can be crashed and whose state survives restarts.
///
/// The prepared store lives in a temporary directory; the log lives in a
/// [`CrashableBackend`]. A crash keeps only what the message store last
/// forced to disk.
pub struct TestBroker {
    dir: TempDir,
    /// The log's backend.
    pub log: CrashableBackend,
    /// The broker's message store and destination directory.
    pub messages: Arc<InMemoryMessageStore>,
    /// Configuration used for every open.
    pub config: Config,
}

impl TestBroker {
    /// Creates a broker with default settings.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a broker with the given settings.
    pub fn with_config(config: Config) -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
            log: CrashableBackend::new(),
            messages: Arc::new(InMemoryMessageStore::new()),
            config,
        }
    }

    /// Directory of the prepared transaction store.
    pub fn store_dir(&self) -> PathBuf {
        self.dir.path().join("incompleteTxnStore")
    }

    /// Opens a manager, running recovery.
    pub fn open(&self) -> CoreResult<TxnLogManager> {
        TxnLogManager::open_with_backend(
            self.config.clone(),
            Box::new(self.log.clone()),
            &self.store_dir(),
            Arc::clone(&self.messages) as Arc<dyn MessageStore>,
            Arc::clone(&self.messages) as Arc<dyn DestinationDirectory>,
        )
    }

    /// Kills the manager without a clean shutdown. Whatever reached the log
    /// backend survives; a torn write stays torn. Message store changes
    /// made since its last `force_to_disk` are lost.
    pub fn crash(&mut self, manager: TxnLogManager) {
        manager.abandon();
        self.log = CrashableBackend::wrap(self.log.surviving_data());
        self.messages = Arc::new(self.messages.durable_copy());
    }

    /// Crashes the manager and opens a new one.
    pub fn restart(&mut self, manager: TxnLogManager) -> CoreResult<TxnLogManager> {
        self.crash(manager);
        self.open()
    }

    /// Replaces the message store with an empty one, as if nothing written
    /// to it had been forced to disk.
    pub fn lose_message_store(&mut self) {
        self.messages = Arc::new(InMemoryMessageStore::new());
    }
}

impl Default for TestBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// A queue message routed to the queue's shared interest.
pub fn queue_message(queue: &str, id: u64) -> SentMessage {
    SentMessage::new(
        DestinationId::queue(queue),
        MessageId::new(id),
        id.to_le_bytes().to_vec(),
        vec![ConsumerId::QUEUE],
    )
}

/// A topic message routed to `subscribers`.
pub fn topic_message(topic: &str, id: u64, subscribers: &[u64]) -> SentMessage {
    SentMessage::new(
        DestinationId::topic(topic),
        MessageId::new(id),
        id.to_le_bytes().to_vec(),
        subscribers.iter().copied().map(ConsumerId::new).collect(),
    )
}

/// Applies a committed workload to a message store the way a broker does
/// after logging the commit.
pub fn apply_workload(messages: &InMemoryMessageStore, workload: &Workload) -> CoreResult<()> {
    for message in &workload.sent {
        apply_send(messages, message)?;
    }
    for ack in &workload.acks {
        apply_ack(messages, ack)?;
    }
    Ok(())
}

/// Marks an interest acknowledged. Acks of messages that are gone are
/// ignored.
pub fn apply_ack(messages: &InMemoryMessageStore, ack: &MessageAck) -> CoreResult<()> {
    let dest = messages.get_or_create_destination(&ack.destination.name, ack.destination.kind)?;
    let consumer = if dest.is_queue() {
        ConsumerId::QUEUE
    } else {
        ack.consumer
    };
    if messages.contains_message(&dest, ack.message_id)? {
        messages.update_interest_state(&dest, ack.message_id, consumer, InterestState::Acknowledged)?;
    }
    Ok(())
}

/// Stores one message, creating its destination.
pub fn apply_send(messages: &InMemoryMessageStore, message: &SentMessage) -> CoreResult<()> {
    let dest = messages.get_or_create_destination(&message.destination.name, message.destination.kind)?;
    if !messages.contains_message(&dest, message.message_id)? {
        messages.store_message(&dest, message)?;
    }
    Ok(())
}

/// Logs a one-phase local commit, applies it and confirms it.
pub fn commit_one_phase(
    manager: &TxnLogManager,
    messages: &InMemoryMessageStore,
    id: u64,
    workload: Workload,
) -> CoreResult<()> {
    let txn = TransactionRecord::local(TransactionId::new(id), workload.clone()).one_phase();
    manager.log_transaction(txn)?;
    apply_workload(messages, &workload)?;
    manager.commit_applied(TransactionId::new(id));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_reopen() {
        let broker = TestBroker::new();
        let manager = broker.open().unwrap();
        commit_one_phase(
            &manager,
            &broker.messages,
            1,
            Workload::new().send(queue_message("q", 1)),
        )
        .unwrap();
        manager.close().unwrap();
        drop(manager);

        let manager = broker.open().unwrap();
        assert!(!manager.recovery_report().playback);
        assert_eq!(
            broker.messages.message_ids(&DestinationId::queue("q")),
            vec![MessageId::new(1)]
        );
    }

    #[test]
    fn crash_loses_unforced_messages() {
        let mut broker = TestBroker::new();
        let manager = broker.open().unwrap();
        apply_send(&broker.messages, &queue_message("q", 7)).unwrap();
        broker.crash(manager);
        assert!(broker.messages.message_ids(&DestinationId::queue("q")).is_empty());
    }

    #[test]
    fn restart_replays_after_crash() {
        let mut broker = TestBroker::new();
        let manager = broker.open().unwrap();
        commit_one_phase(
            &manager,
            &broker.messages,
            1,
            Workload::new().send(topic_message("t", 1, &[1, 2])),
        )
        .unwrap();

        broker.lose_message_store();
        let manager = broker.restart(manager).unwrap();
        assert!(manager.recovery_report().playback);
        assert_eq!(
            broker.messages.message_ids(&DestinationId::topic("t")),
            vec![MessageId::new(1)]
        );
    }
}
