//! Startup recovery.
//!
//! Recovery runs before the broker accepts work:
//!
//! 1. Every prepared-store entry is routed to its kind's coordinator.
//! 2. If the log was not closed cleanly its records are applied in order.
//!    Committed workloads are re-applied to the message store, sends before
//!    acknowledgements.
//! 3. A checkpoint moves what the log held into the prepared store and
//!    resets the log.
//! 4. Committed transactions left in the prepared store are removed,
//!    except cluster transactions still waiting on participants.
//!
//! Re-applying a message that is already stored does nothing when its
//! interests match the logged ones and re-routes it once when they differ.

use crate::broker::{DestinationDirectory, InterestState, MessageStore};
use crate::checkpoint::{CheckpointCoordinator, CheckpointSummary};
use crate::error::{CoreError, CoreResult, CorruptionWarning};
use crate::prepared::PreparedTransactionStore;
use crate::stats::LogStats;
use crate::transaction::{
    MessageAck, SentMessage, TransactionCoordinator, TransactionKind, TransactionRecord,
    TransactionState,
};
use crate::types::{ConsumerId, DestinationId, MessageId};
use crate::wal::{LogEvent, TransactionLog};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// What recovery found and did.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Transactions loaded from the prepared store.
    pub prepared_loaded: usize,
    /// Whether the log had to be replayed.
    pub playback: bool,
    /// Log records applied.
    pub records_replayed: u64,
    /// Committed transactions whose workload was re-applied.
    pub transactions_reapplied: usize,
    /// Messages written to the message store.
    pub messages_stored: usize,
    /// Messages already stored with the logged interests.
    pub messages_unchanged: usize,
    /// Messages already stored with different interests, re-routed.
    pub messages_rerouted: usize,
    /// Messages not restored because they expired.
    pub messages_expired: usize,
    /// Acknowledgements applied.
    pub acks_applied: usize,
    /// Message removals applied.
    pub removals_applied: usize,
    /// Destinations looked up or re-created and loaded.
    pub destinations_loaded: usize,
    /// Committed transactions removed from the prepared store after the
    /// recovery checkpoint.
    pub committed_removed: usize,
    /// The recovery checkpoint.
    pub checkpoint: Option<CheckpointSummary>,
    /// Damaged records that were discarded.
    pub warnings: Vec<CorruptionWarning>,
}

/// Rebuilds coordinator and message-store state after a restart.
pub struct RecoveryReplayer<'a> {
    log: &'a TransactionLog,
    store: &'a PreparedTransactionStore,
    coordinators: &'a [Arc<TransactionCoordinator>],
    messages: &'a dyn MessageStore,
    destinations: &'a dyn DestinationDirectory,
    checkpoint: &'a CheckpointCoordinator,
    stats: &'a LogStats,
    loaded: HashSet<DestinationId>,
    now_millis: u64,
}

impl<'a> RecoveryReplayer<'a> {
    /// Creates a replayer over the given components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: &'a TransactionLog,
        store: &'a PreparedTransactionStore,
        coordinators: &'a [Arc<TransactionCoordinator>],
        messages: &'a dyn MessageStore,
        destinations: &'a dyn DestinationDirectory,
        checkpoint: &'a CheckpointCoordinator,
        stats: &'a LogStats,
    ) -> Self {
        let now_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self {
            log,
            store,
            coordinators,
            messages,
            destinations,
            checkpoint,
            stats,
            loaded: HashSet::new(),
            now_millis,
        }
    }

    /// Sets the time messages are checked for expiry against.
    #[must_use]
    pub fn at_time(mut self, now_millis: u64) -> Self {
        self.now_millis = now_millis;
        self
    }

    /// Runs recovery.
    ///
    /// # Errors
    ///
    /// Any I/O error, or a checkpoint failure. Damaged records are not
    /// errors; they are returned in the report.
    pub fn run(mut self) -> CoreResult<RecoveryReport> {
        let mut report = RecoveryReport {
            warnings: self.log.take_warnings(),
            ..RecoveryReport::default()
        };

        let load = self.store.load()?;
        report.warnings.extend(load.warnings);
        for txn in load.transactions {
            let id = txn.id;
            let residence = self.coordinator(txn.kind())?.load_stored(txn)?;
            debug!(%id, ?residence, "loaded prepared transaction");
            report.prepared_loaded += 1;
        }

        report.playback = self.log.playback_required();
        if report.playback {
            self.replay_log(&mut report)?;
        }

        report.checkpoint = Some(self.checkpoint.checkpoint()?);

        for coordinator in self.coordinators {
            report.committed_removed += coordinator.remove_committed_on_startup()?;
        }

        self.stats.record_replayed(report.records_replayed);
        self.stats.record_reroutes(report.messages_rerouted as u64);
        self.stats.record_corruption(report.warnings.len() as u64);
        for warning in &report.warnings {
            warn!(%warning, "data lost to corruption");
        }
        info!(
            prepared = report.prepared_loaded,
            replayed = report.records_replayed,
            reapplied = report.transactions_reapplied,
            rerouted = report.messages_rerouted,
            warnings = report.warnings.len(),
            "recovery complete"
        );
        Ok(report)
    }

    fn coordinator(&self, kind: TransactionKind) -> CoreResult<&'a TransactionCoordinator> {
        self.coordinators
            .iter()
            .find(|c| c.kind() == kind)
            .map(|c| &**c)
            .ok_or_else(|| CoreError::invalid_operation(format!("no {kind} coordinator")))
    }

    fn replay_log(&mut self, report: &mut RecoveryReport) -> CoreResult<()> {
        let log = self.log;
        info!(records = log.record_count(), "replaying transaction log");
        for item in log.iter()? {
            let (offset, record) = item?;
            let event = match record.event() {
                Ok(event) => event,
                Err(e) => {
                    let warning = CorruptionWarning::new(
                        format!("txnlog@{offset}"),
                        format!("undecodable {} record: {e}", record.record_type),
                    );
                    warn!(%warning, "skipping log record");
                    report.warnings.push(warning);
                    continue;
                }
            };
            debug!(sequence = %record.sequence, event = %event.summary(), "replaying");
            self.apply(event, report)?;
            report.records_replayed += 1;
        }
        Ok(())
    }

    fn apply(&mut self, event: LogEvent, report: &mut RecoveryReport) -> CoreResult<()> {
        match event {
            LogEvent::Prepare { txn } => self.coordinator(txn.kind())?.replay_prepare(txn),
            LogEvent::Complete {
                id,
                kind,
                state,
                txn,
            } => {
                let found = self.coordinator(kind)?.replay_completion(id, state, txn)?;
                if let Some(txn) = found.filter(|_| state == TransactionState::Committed) {
                    self.apply_committed(&txn, report)?;
                }
                Ok(())
            }
            LogEvent::MessageSent { message } => self.apply_send(&message, report),
            LogEvent::MessageAck { ack } => self.apply_ack(&ack, report),
            LogEvent::MessageRemoval {
                destination,
                message_id,
            } => self.apply_removal(&destination, message_id, report),
        }
    }

    fn apply_committed(
        &mut self,
        txn: &TransactionRecord,
        report: &mut RecoveryReport,
    ) -> CoreResult<()> {
        for message in &txn.workload.sent {
            self.apply_send(message, report)?;
        }
        for ack in txn.workload.acks.iter().chain(txn.remote_acks()) {
            self.apply_ack(ack, report)?;
        }
        report.transactions_reapplied += 1;
        Ok(())
    }

    /// Looks up or re-creates a destination and loads it, once per run.
    fn destination(
        &mut self,
        id: &DestinationId,
        report: &mut RecoveryReport,
    ) -> CoreResult<DestinationId> {
        if self.loaded.contains(id) {
            return Ok(id.clone());
        }
        let dest = self.destinations.get_or_create_destination(&id.name, id.kind)?;
        self.destinations.load_destination(&dest)?;
        self.loaded.insert(dest.clone());
        report.destinations_loaded += 1;
        Ok(dest)
    }

    fn apply_send(&mut self, message: &SentMessage, report: &mut RecoveryReport) -> CoreResult<()> {
        if message.is_expired(self.now_millis) {
            debug!(id = %message.message_id, "message expired, not restored");
            report.messages_expired += 1;
            return Ok(());
        }
        let dest = self.destination(&message.destination, report)?;
        let id = message.message_id;

        if !self.messages.contains_message(&dest, id)? {
            self.messages.store_message(&dest, message)?;
            report.messages_stored += 1;
            return Ok(());
        }

        let stored: BTreeSet<ConsumerId> =
            self.messages.interest_states(&dest, id)?.into_keys().collect();
        let logged: BTreeSet<ConsumerId> = message.interests.iter().copied().collect();
        if stored == logged {
            debug!(%id, "message already stored with the same interests");
            report.messages_unchanged += 1;
        } else {
            debug!(%id, "message already stored with different interests, re-routing");
            self.messages.remove_message(&dest, id)?;
            self.messages.store_message(&dest, message)?;
            report.messages_rerouted += 1;
        }
        Ok(())
    }

    fn apply_ack(&mut self, ack: &MessageAck, report: &mut RecoveryReport) -> CoreResult<()> {
        let dest = self.destination(&ack.destination, report)?;
        let consumer = if dest.is_queue() {
            ConsumerId::QUEUE
        } else {
            ack.consumer
        };
        if !self.messages.contains_message(&dest, ack.message_id)? {
            debug!(id = %ack.message_id, "acknowledged message no longer stored");
            return Ok(());
        }
        if !self
            .messages
            .interest_states(&dest, ack.message_id)?
            .contains_key(&consumer)
        {
            debug!(id = %ack.message_id, %consumer, "acknowledging interest not routed");
            return Ok(());
        }
        self.messages
            .update_interest_state(&dest, ack.message_id, consumer, InterestState::Acknowledged)?;
        report.acks_applied += 1;
        Ok(())
    }

    fn apply_removal(
        &mut self,
        destination: &DestinationId,
        message_id: MessageId,
        report: &mut RecoveryReport,
    ) -> CoreResult<()> {
        let dest = self.destination(destination, report)?;
        if self.messages.contains_message(&dest, message_id)? {
            self.messages.remove_message(&dest, message_id)?;
            report.removals_applied += 1;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RecoveryReplayer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryReplayer")
            .field("now_millis", &self.now_millis)
            .field("destinations_loaded", &self.loaded.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryMessageStore;
    use crate::config::Config;
    use crate::transaction::{DrainSignal, Workload};
    use crate::types::{BrokerAddress, DestinationType, TransactionId};
    use crate::wal::LogOptions;
    use brokerlog_storage::InMemoryBackend;
    use parking_lot::RwLock;
    use tempfile::{tempdir, TempDir};

    struct Broker {
        dir: TempDir,
        backend: InMemoryBackend,
        messages: Arc<InMemoryMessageStore>,
    }

    struct Opened {
        log: Arc<TransactionLog>,
        store: Arc<PreparedTransactionStore>,
        coordinators: Vec<Arc<TransactionCoordinator>>,
        checkpoint: CheckpointCoordinator,
        stats: Arc<LogStats>,
    }

    impl Broker {
        fn new() -> Self {
            Self {
                dir: tempdir().unwrap(),
                backend: InMemoryBackend::new(),
                messages: Arc::new(InMemoryMessageStore::new()),
            }
        }

        fn open(&self) -> Opened {
            let config = Config::default();
            let store = Arc::new(PreparedTransactionStore::open(self.dir.path(), &config).unwrap());
            let log = Arc::new(
                TransactionLog::open(Box::new(self.backend.clone()), LogOptions::from_config(&config))
                    .unwrap(),
            );
            let signal = Arc::new(DrainSignal::new());
            let coordinators: Vec<_> = TransactionKind::ALL
                .iter()
                .map(|&kind| {
                    Arc::new(TransactionCoordinator::new(
                        kind,
                        Arc::clone(&store),
                        Arc::clone(&signal),
                        &config,
                    ))
                })
                .collect();
            let stats = Arc::new(LogStats::new());
            let checkpoint = CheckpointCoordinator::new(
                Arc::new(RwLock::new(())),
                Arc::clone(&log),
                Arc::clone(&store),
                coordinators.clone(),
                Arc::clone(&self.messages) as Arc<dyn MessageStore>,
                signal,
                Arc::clone(&stats),
                &config,
            );
            Opened {
                log,
                store,
                coordinators,
                checkpoint,
                stats,
            }
        }
    }

    impl Opened {
        fn recover(&self, messages: &InMemoryMessageStore) -> RecoveryReport {
            RecoveryReplayer::new(
                &self.log,
                &self.store,
                &self.coordinators,
                messages,
                messages,
                &self.checkpoint,
                &self.stats,
            )
            .at_time(1_000)
            .run()
            .unwrap()
        }

        fn coordinator(&self, kind: TransactionKind) -> &TransactionCoordinator {
            &self.coordinators[kind.index()]
        }
    }

    fn queue_message(id: u64) -> SentMessage {
        SentMessage::new(
            DestinationId::queue("orders"),
            MessageId::new(id),
            vec![1, 2, 3],
            vec![ConsumerId::QUEUE],
        )
    }

    fn topic_message(id: u64, interests: &[u64]) -> SentMessage {
        SentMessage::new(
            DestinationId::topic("prices"),
            MessageId::new(id),
            vec![9],
            interests.iter().copied().map(ConsumerId::new).collect(),
        )
    }

    #[test]
    fn one_phase_commit_is_restored() {
        let broker = Broker::new();
        {
            let opened = broker.open();
            let txn = TransactionRecord::local(
                TransactionId::new(1),
                Workload::new().send(queue_message(1)),
            )
            .one_phase();
            opened
                .log
                .append_event(&LogEvent::Complete {
                    id: txn.id,
                    kind: TransactionKind::Local,
                    state: TransactionState::Committed,
                    txn: Some(txn),
                })
                .unwrap();
            // Crash before the commit reaches the message store.
        }

        let opened = broker.open();
        assert!(opened.log.playback_required());
        let report = opened.recover(&broker.messages);
        assert!(report.playback);
        assert_eq!(report.transactions_reapplied, 1);
        assert_eq!(report.messages_stored, 1);
        assert_eq!(
            broker.messages.message_ids(&DestinationId::queue("orders")),
            vec![MessageId::new(1)]
        );
        assert!(!opened.log.playback_required());
        assert_eq!(opened.log.record_count(), 0);
        assert!(opened.store.is_empty());
    }

    #[test]
    fn replaying_twice_is_a_no_op() {
        let broker = Broker::new();
        let message = topic_message(5, &[1, 2]);
        {
            let opened = broker.open();
            opened
                .log
                .append_event(&LogEvent::MessageSent {
                    message: message.clone(),
                })
                .unwrap();
        }
        let dest = broker
            .messages
            .get_or_create_destination("prices", DestinationType::Topic)
            .unwrap();
        broker.messages.store_message(&dest, &message).unwrap();

        let report = broker.open().recover(&broker.messages);
        assert_eq!(report.messages_unchanged, 1);
        assert_eq!(report.messages_rerouted, 0);
        assert_eq!(broker.messages.store_count(), 1);
    }

    #[test]
    fn changed_interests_are_rerouted_once() {
        let broker = Broker::new();
        {
            let opened = broker.open();
            opened
                .log
                .append_event(&LogEvent::MessageSent {
                    message: topic_message(5, &[1, 2, 3]),
                })
                .unwrap();
        }
        let dest = broker
            .messages
            .get_or_create_destination("prices", DestinationType::Topic)
            .unwrap();
        broker
            .messages
            .store_message(&dest, &topic_message(5, &[1]))
            .unwrap();

        let opened = broker.open();
        let report = opened.recover(&broker.messages);
        assert_eq!(report.messages_rerouted, 1);
        assert_eq!(opened.stats.snapshot().reroutes, 1);
        let states = broker.messages.interest_states(&dest, MessageId::new(5)).unwrap();
        assert_eq!(states.len(), 3);
    }

    #[test]
    fn expired_messages_are_skipped() {
        let broker = Broker::new();
        {
            let opened = broker.open();
            opened
                .log
                .append_event(&LogEvent::MessageSent {
                    message: queue_message(1).expiring_at(500),
                })
                .unwrap();
            opened
                .log
                .append_event(&LogEvent::MessageSent {
                    message: queue_message(2).expiring_at(5_000),
                })
                .unwrap();
        }
        let report = broker.open().recover(&broker.messages);
        assert_eq!(report.messages_expired, 1);
        assert_eq!(
            broker.messages.message_ids(&DestinationId::queue("orders")),
            vec![MessageId::new(2)]
        );
    }

    #[test]
    fn queue_acks_use_the_shared_interest() {
        let broker = Broker::new();
        {
            let opened = broker.open();
            opened
                .log
                .append_event(&LogEvent::MessageSent {
                    message: queue_message(1),
                })
                .unwrap();
            opened
                .log
                .append_event(&LogEvent::MessageAck {
                    ack: MessageAck::new(
                        DestinationId::queue("orders"),
                        MessageId::new(1),
                        ConsumerId::new(77),
                    ),
                })
                .unwrap();
        }
        let report = broker.open().recover(&broker.messages);
        assert_eq!(report.acks_applied, 1);
        let states = broker
            .messages
            .interest_states(&DestinationId::queue("orders"), MessageId::new(1))
            .unwrap();
        assert_eq!(states[&ConsumerId::QUEUE], InterestState::Acknowledged);
        assert_eq!(report.destinations_loaded, 1);
        assert_eq!(broker.messages.load_count(), 1);
    }

    #[test]
    fn prepared_transaction_survives_recovery() {
        let broker = Broker::new();
        {
            let opened = broker.open();
            let txn = TransactionRecord::cluster(
                TransactionId::new(9),
                Workload::new().send(queue_message(3)),
                [BrokerAddress::new("a:1"), BrokerAddress::new("b:1")],
            );
            opened
                .log
                .append_event(&LogEvent::Prepare { txn })
                .unwrap();
        }

        let opened = broker.open();
        let report = opened.recover(&broker.messages);
        assert_eq!(report.messages_stored, 0);
        assert!(opened.store.contains(TransactionId::new(9)));
        assert!(opened
            .coordinator(TransactionKind::Cluster)
            .is_incomplete(TransactionId::new(9)));
    }

    #[test]
    fn removal_after_send_leaves_nothing() {
        let broker = Broker::new();
        {
            let opened = broker.open();
            opened
                .log
                .append_event(&LogEvent::MessageSent {
                    message: queue_message(1),
                })
                .unwrap();
            opened
                .log
                .append_event(&LogEvent::MessageRemoval {
                    destination: DestinationId::queue("orders"),
                    message_id: MessageId::new(1),
                })
                .unwrap();
        }
        let report = broker.open().recover(&broker.messages);
        assert_eq!(report.removals_applied, 1);
        assert!(broker.messages.snapshot().is_empty());
    }

    #[test]
    fn clean_shutdown_skips_playback() {
        let broker = Broker::new();
        {
            let opened = broker.open();
            opened.checkpoint.checkpoint().unwrap();
            opened.log.close().unwrap();
        }
        let report = broker.open().recover(&broker.messages);
        assert!(!report.playback);
        assert_eq!(report.records_replayed, 0);
    }
}
