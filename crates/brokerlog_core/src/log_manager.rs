//! The transaction log manager: the broker's entry point.

use crate::broker::{DestinationDirectory, MessageStore};
use crate::checkpoint::{CheckpointCoordinator, CheckpointScheduler, CheckpointSummary};
use crate::config::Config;
use crate::dir::{ConversionDirection, StoreDir};
use crate::error::{CoreError, CoreResult};
use crate::logged::LoggedMessages;
use crate::prepared::PreparedTransactionStore;
use crate::replay::{RecoveryReplayer, RecoveryReport};
use crate::stats::{LogStats, StatsSnapshot};
use crate::transaction::{
    DrainSignal, MessageAck, SentMessage, TransactionCoordinator, TransactionKind,
    TransactionRecord, TransactionState,
};
use crate::types::{BrokerAddress, DestinationId, MessageId, SequenceNumber, TransactionId};
use crate::wal::{CheckpointReason, LogEvent, LogOptions, TransactionLog};
use brokerlog_storage::{FileBackend, StorageBackend};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Owns a broker's transaction log, prepared store and coordinators.
///
/// Opening a manager runs recovery; nothing can be logged until it has
/// finished. Every logging call holds the shared side of the section lock
/// for the duration of one append, so a checkpoint never truncates the log
/// under a writer.
///
/// ```rust,ignore
/// let manager = TxnLogManager::open(dir, Config::default(), store.clone(), store)?;
/// manager.log_transaction(TransactionRecord::local(id, workload).one_phase())?;
/// // ... apply the workload to the message store ...
/// manager.commit_applied(id);
/// manager.close()?;
/// ```
pub struct TxnLogManager {
    config: Config,
    dir: Option<StoreDir>,
    section: Arc<RwLock<()>>,
    log: Arc<TransactionLog>,
    store: Arc<PreparedTransactionStore>,
    coordinators: Vec<Arc<TransactionCoordinator>>,
    checkpoint: Arc<CheckpointCoordinator>,
    logged: Arc<LoggedMessages>,
    scheduler: CheckpointScheduler,
    stats: Arc<LogStats>,
    recovery: RecoveryReport,
    pending_conversion: Option<ConversionDirection>,
    is_open: RwLock<bool>,
}

impl TxnLogManager {
    /// Opens the broker directory at `path` and recovers it.
    ///
    /// An unfinished conversion found at startup has its partial output
    /// discarded; see [`pending_conversion`](Self::pending_conversion).
    ///
    /// # Errors
    ///
    /// - `StoreLocked` if another process owns the directory
    /// - `DualFormat` if legacy tables and a log coexist outside a
    ///   conversion
    /// - `InvalidFormat` for a log or store written by another record format
    /// - any I/O error
    pub fn open(
        path: &Path,
        config: Config,
        messages: Arc<dyn MessageStore>,
        destinations: Arc<dyn DestinationDirectory>,
    ) -> CoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;

        let pending_conversion = dir.pending_conversion()?;
        if let Some(direction) = pending_conversion {
            warn!(%direction, "previous conversion did not finish, redoing it");
            dir.discard_partial_conversion(direction)?;
        }
        dir.check_format_consistency()?;

        let backend = FileBackend::open_with_create_dirs(&dir.txn_log_path())?;
        let store_dir = dir.prepared_store_dir();
        let mut manager =
            Self::open_with_backend(config, Box::new(backend), &store_dir, messages, destinations)?;
        manager.dir = Some(dir);
        manager.pending_conversion = pending_conversion;
        Ok(manager)
    }

    /// Opens a manager over an explicit log backend and store directory.
    ///
    /// No directory lock is taken.
    pub fn open_with_backend(
        config: Config,
        log_backend: Box<dyn StorageBackend>,
        store_dir: &Path,
        messages: Arc<dyn MessageStore>,
        destinations: Arc<dyn DestinationDirectory>,
    ) -> CoreResult<Self> {
        let store = Arc::new(PreparedTransactionStore::open(store_dir, &config)?);
        let log = Arc::new(TransactionLog::open(
            log_backend,
            LogOptions::from_config(&config),
        )?);

        let signal = Arc::new(DrainSignal::new());
        let coordinators: Vec<Arc<TransactionCoordinator>> = TransactionKind::ALL
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
        let section = Arc::new(RwLock::new(()));
        let checkpoint = Arc::new(CheckpointCoordinator::new(
            Arc::clone(&section),
            Arc::clone(&log),
            Arc::clone(&store),
            coordinators.clone(),
            Arc::clone(&messages),
            signal,
            Arc::clone(&stats),
            &config,
        ));

        let recovery = RecoveryReplayer::new(
            &log,
            &store,
            &coordinators,
            messages.as_ref(),
            destinations.as_ref(),
            &checkpoint,
            &stats,
        )
        .run()?;

        let logged = Arc::clone(checkpoint.logged_messages());
        let scheduler =
            CheckpointScheduler::start(Arc::clone(&checkpoint), config.checkpoint_interval)?;
        log.set_listener(scheduler.listener());

        info!(
            store = %store_dir.display(),
            prepared = store.len(),
            "transaction log manager open"
        );
        Ok(Self {
            config,
            dir: None,
            section,
            log,
            store,
            coordinators,
            checkpoint,
            logged,
            scheduler,
            stats,
            recovery,
            pending_conversion: None,
            is_open: RwLock::new(true),
        })
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::Closed)
        }
    }

    /// The coordinator for `kind`.
    pub fn coordinator(&self, kind: TransactionKind) -> &TransactionCoordinator {
        &self.coordinators[kind.index()]
    }

    fn append(&self, event: &LogEvent) -> CoreResult<SequenceNumber> {
        let body = event.encode()?;
        let sequence = self.log.append(event.record_type(), &body)?;
        self.stats.record_append(body.len() as u64);
        Ok(sequence)
    }

    /// Logs a prepared transaction, or a one-phase local commit.
    ///
    /// A one-phase commit goes straight to the draining set; the caller
    /// confirms with [`commit_applied`](Self::commit_applied) once its
    /// workload is in the message store.
    ///
    /// # Errors
    ///
    /// `TransactionExists` if the id is already tracked, or being logged by
    /// another caller.
    pub fn log_transaction(&self, txn: TransactionRecord) -> CoreResult<SequenceNumber> {
        self.ensure_open()?;
        let _section = self.section.read();
        let coordinator = self.coordinator(txn.kind());
        coordinator.reserve(txn.id)?;

        let event = if txn.one_phase {
            LogEvent::Complete {
                id: txn.id,
                kind: txn.kind(),
                state: TransactionState::Committed,
                txn: Some(txn.clone()),
            }
        } else {
            LogEvent::Prepare { txn: txn.clone() }
        };
        let sequence = match self.append(&event) {
            Ok(sequence) => sequence,
            Err(e) => {
                coordinator.release(txn.id);
                return Err(e);
            }
        };
        self.track_sends(&txn);
        let id = txn.id;
        if let Err(e) = coordinator.on_prepare(txn) {
            coordinator.release(id);
            return Err(e);
        }
        Ok(sequence)
    }

    fn track_sends(&self, txn: &TransactionRecord) {
        for message in &txn.workload.sent {
            self.logged
                .message_logged(&message.destination, message.message_id);
        }
    }

    /// Logs the outcome of a prepared transaction.
    ///
    /// # Errors
    ///
    /// `TransactionNotFound` if the transaction is not awaiting an outcome.
    pub fn log_completion(
        &self,
        kind: TransactionKind,
        id: TransactionId,
        state: TransactionState,
    ) -> CoreResult<SequenceNumber> {
        self.ensure_open()?;
        let _section = self.section.read();
        let coordinator = self.coordinator(kind);
        let Some(txn) = coordinator.get(id).filter(|_| coordinator.is_incomplete(id)) else {
            return Err(CoreError::TransactionNotFound { id });
        };
        let sequence = self.append(&LogEvent::Complete {
            id,
            kind,
            state,
            txn: None,
        })?;
        // Replaying the commit re-applies the sends, possibly into a new
        // log generation from the one that holds the prepare.
        if state == TransactionState::Committed {
            self.track_sends(&txn);
        }
        coordinator.on_complete(id, state)?;
        Ok(sequence)
    }

    /// Logs a non-transacted send. Returns `None` when such sends are not
    /// logged.
    pub fn log_non_transacted_send(
        &self,
        message: &SentMessage,
    ) -> CoreResult<Option<SequenceNumber>> {
        self.ensure_open()?;
        if !self.config.log_non_transacted_sends {
            return Ok(None);
        }
        let _section = self.section.read();
        let sequence = self.append(&LogEvent::MessageSent {
            message: message.clone(),
        })?;
        self.logged
            .message_logged(&message.destination, message.message_id);
        Ok(Some(sequence))
    }

    /// Logs a non-transacted acknowledgement. Returns `None` when such acks
    /// are not logged.
    ///
    /// `last_ack` says the ack consumes the message. Once that is logged,
    /// removing the message needs no removal record.
    pub fn log_non_transacted_ack(
        &self,
        ack: &MessageAck,
        last_ack: bool,
    ) -> CoreResult<Option<SequenceNumber>> {
        self.ensure_open()?;
        if !self.config.log_non_transacted_acks {
            return Ok(None);
        }
        let _section = self.section.read();
        let sequence = self.append(&LogEvent::MessageAck { ack: ack.clone() })?;
        if last_ack {
            self.logged.last_ack_logged(&ack.destination, ack.message_id);
        }
        Ok(Some(sequence))
    }

    /// Logs the removal of a message from a destination.
    ///
    /// The removal stays pending, and holds back checkpoints, until
    /// [`message_removed`](Self::message_removed) confirms it.
    pub fn log_message_removal(
        &self,
        destination: &DestinationId,
        message_id: MessageId,
    ) -> CoreResult<SequenceNumber> {
        self.ensure_open()?;
        let _section = self.section.read();
        self.append_removal(destination, message_id)
    }

    /// Logs a removal record before a message leaves the message store, if
    /// replay would otherwise bring it back: its send is in the current log
    /// generation and its last ack is not.
    ///
    /// Returns `None` when nothing was logged; the message store must then
    /// make the removal durable itself. Otherwise confirm with
    /// [`message_removed`](Self::message_removed).
    pub fn prepare_message_removal(
        &self,
        destination: &DestinationId,
        message_id: MessageId,
    ) -> CoreResult<Option<SequenceNumber>> {
        self.ensure_open()?;
        let _section = self.section.read();
        if !self.logged.needs_removal_record(destination, message_id) {
            return Ok(None);
        }
        self.append_removal(destination, message_id).map(Some)
    }

    /// Confirms that a logged removal has been applied to the message
    /// store. Confirming twice is harmless.
    pub fn message_removed(&self, destination: &DestinationId, message_id: MessageId) {
        self.logged.removal_applied(destination, message_id);
    }

    fn append_removal(
        &self,
        destination: &DestinationId,
        message_id: MessageId,
    ) -> CoreResult<SequenceNumber> {
        let sequence = self.append(&LogEvent::MessageRemoval {
            destination: destination.clone(),
            message_id,
        })?;
        self.logged.removal_logged(destination, message_id);
        Ok(sequence)
    }

    /// Confirms that a committed transaction's workload is in the message
    /// store. Confirming twice, or confirming an unknown id, is harmless.
    pub fn commit_applied(&self, id: TransactionId) {
        for coordinator in &self.coordinators {
            coordinator.commit_applied(id);
        }
    }

    /// Records that a participant broker completed its share of a cluster
    /// transaction. Returns true once every participant has.
    pub fn update_broker_state(
        &self,
        id: TransactionId,
        expected: TransactionState,
        broker: &BrokerAddress,
    ) -> CoreResult<bool> {
        self.ensure_open()?;
        let _section = self.section.read();
        self.coordinator(TransactionKind::Cluster)
            .update_broker_state(id, expected, broker)
    }

    /// Runs a checkpoint on the calling thread.
    pub fn checkpoint(&self) -> CoreResult<CheckpointSummary> {
        self.ensure_open()?;
        self.checkpoint.checkpoint()
    }

    /// Asks the background thread for a checkpoint.
    pub fn request_checkpoint(&self) {
        self.scheduler.request(CheckpointReason::Requested);
    }

    /// State of every tracked transaction of `kind`.
    pub fn transaction_states(&self, kind: TransactionKind) -> Vec<(TransactionId, TransactionState)> {
        let mut states = self.coordinator(kind).transaction_states();
        states.sort_by_key(|(id, _)| *id);
        states
    }

    /// Transactions of `kind` still awaiting an outcome, in id order.
    pub fn incomplete_transactions(&self, kind: TransactionKind) -> Vec<TransactionRecord> {
        let mut txns = self.coordinator(kind).incomplete_transactions();
        txns.sort_by_key(|t| t.id);
        txns
    }

    /// Rolls back every transaction that is still awaiting an outcome.
    /// Returns how many were rolled back.
    pub fn rollback_all_incomplete(&self) -> CoreResult<usize> {
        let mut rolled_back = 0;
        for kind in TransactionKind::ALL {
            for txn in self.incomplete_transactions(kind) {
                self.log_completion(kind, txn.id, TransactionState::RolledBack)?;
                rolled_back += 1;
            }
        }
        if rolled_back > 0 {
            info!(rolled_back, "rolled back incomplete transactions");
        }
        Ok(rolled_back)
    }

    /// Stores a transaction carried over from another store, such as the
    /// legacy tables during a conversion.
    pub fn import_prepared(&self, txn: TransactionRecord) -> CoreResult<()> {
        self.ensure_open()?;
        let _section = self.section.read();
        self.coordinator(txn.kind()).import(txn)?;
        Ok(())
    }

    /// Conversion discarded and left for the caller to redo at open.
    pub fn pending_conversion(&self) -> Option<ConversionDirection> {
        self.pending_conversion
    }

    /// Marks a conversion as started.
    pub fn begin_conversion(&self, direction: ConversionDirection) -> CoreResult<()> {
        self.store_dir()?.begin_conversion(direction)
    }

    /// Marks a conversion as finished.
    pub fn finish_conversion(&self, direction: ConversionDirection) -> CoreResult<()> {
        self.store_dir()?.finish_conversion(direction)?;
        self.store.sync()
    }

    fn store_dir(&self) -> CoreResult<&StoreDir> {
        self.dir
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("manager has no broker directory"))
    }

    /// What recovery did when the manager was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The transaction log.
    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    /// The prepared transaction store.
    pub fn prepared_store(&self) -> &PreparedTransactionStore {
        &self.store
    }

    /// Checks if the manager is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Stops the scheduler, runs a final checkpoint and marks the log
    /// cleanly shut down.
    ///
    /// Close never waits for commits or removals the broker has not
    /// confirmed. With any outstanding the final checkpoint is skipped and
    /// the log is left for replay at the next start.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }
        *is_open = false;
        drop(is_open);

        self.checkpoint.shut_down();
        self.scheduler.stop()?;
        match self.checkpoint.checkpoint() {
            Ok(_) => {
                self.log.close()?;
                info!("transaction log manager closed");
            }
            Err(CoreError::Closed) => {
                self.log.sync()?;
                let draining: usize = self.coordinators.iter().map(|c| c.draining_count()).sum();
                warn!(
                    draining,
                    removals = self.logged.pending_removals(),
                    "closed with unconfirmed work, the log is replayed at next start"
                );
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Drops the manager without a clean shutdown, as a crash would.
    pub fn abandon(self) {
        *self.is_open.write() = false;
    }
}

impl std::fmt::Debug for TxnLogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnLogManager")
            .field("is_open", &self.is_open())
            .field("log_records", &self.log.record_count())
            .field("prepared", &self.store.len())
            .finish_non_exhaustive()
    }
}

impl Drop for TxnLogManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
