//! Checkpoints: moving transaction state out of the log so it can be
//! truncated.
//!
//! A checkpoint takes the exclusive side of the section lock, so no record
//! is appended while it runs. It then waits for committed transactions to
//! finish draining into the message store, and for logged message removals
//! to be applied. If either is outstanding it releases the lock, waits for
//! a drain notification and starts over. Once both are settled it forces
//! the message store, flushes unpersisted transactions to the prepared
//! store, syncs that store, resets the log, evicts completed transactions
//! and forgets the messages logged in the old log generation.
//!
//! A failure at any step before the reset leaves the log intact, so the
//! next startup replays it. After [`CheckpointCoordinator::shut_down`] a
//! checkpoint that finds anything outstanding gives up with
//! [`CoreError::Closed`] instead of waiting.

mod scheduler;

pub use scheduler::CheckpointScheduler;

use crate::broker::MessageStore;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::logged::LoggedMessages;
use crate::prepared::PreparedTransactionStore;
use crate::stats::LogStats;
use crate::transaction::{DrainOutcome, DrainSignal, TransactionCoordinator};
use crate::wal::TransactionLog;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Step a checkpoint is at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPhase {
    /// No checkpoint is running.
    Idle,
    /// Holding the exclusive section lock.
    Locked,
    /// Waiting for committed transactions to reach the message store.
    Draining,
    /// Writing unpersisted transactions to the prepared store.
    Flushing,
    /// The log has been reset.
    Truncated,
    /// Removing completed transactions from the prepared store.
    Evicting,
}

impl fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Locked => "locked",
            Self::Draining => "draining",
            Self::Flushing => "flushing",
            Self::Truncated => "truncated",
            Self::Evicting => "evicting",
        })
    }
}

/// What one checkpoint did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointSummary {
    /// Transactions written to the prepared store.
    pub flushed: usize,
    /// Completed transactions removed from the prepared store.
    pub evicted: usize,
    /// Times the lock was released to wait for draining commits.
    pub retries: u32,
    /// Log bytes discarded by the reset.
    pub log_bytes_released: u64,
}

/// Runs checkpoints, one at a time.
pub struct CheckpointCoordinator {
    section: Arc<RwLock<()>>,
    log: Arc<TransactionLog>,
    store: Arc<PreparedTransactionStore>,
    coordinators: Vec<Arc<TransactionCoordinator>>,
    messages: Arc<dyn MessageStore>,
    logged: Arc<LoggedMessages>,
    signal: Arc<DrainSignal>,
    stats: Arc<LogStats>,
    phase: Mutex<CheckpointPhase>,
    running: Mutex<()>,
    config: Config,
}

impl CheckpointCoordinator {
    /// Creates a checkpoint coordinator over the given components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        section: Arc<RwLock<()>>,
        log: Arc<TransactionLog>,
        store: Arc<PreparedTransactionStore>,
        coordinators: Vec<Arc<TransactionCoordinator>>,
        messages: Arc<dyn MessageStore>,
        signal: Arc<DrainSignal>,
        stats: Arc<LogStats>,
        config: &Config,
    ) -> Self {
        let logged = Arc::new(LoggedMessages::new(Arc::clone(&signal), config));
        Self {
            section,
            log,
            store,
            coordinators,
            messages,
            logged,
            signal,
            stats,
            phase: Mutex::new(CheckpointPhase::Idle),
            running: Mutex::new(()),
            config: config.clone(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> CheckpointPhase {
        *self.phase.lock()
    }

    /// Messages logged in the current log generation.
    pub fn logged_messages(&self) -> &Arc<LoggedMessages> {
        &self.logged
    }

    /// Stops every checkpoint from waiting on draining commits or pending
    /// removals. A running retry loop gives up with [`CoreError::Closed`].
    pub fn shut_down(&self) {
        self.signal.shut_down();
    }

    fn enter(&self, phase: CheckpointPhase) {
        debug!(%phase, "checkpoint phase");
        *self.phase.lock() = phase;
    }

    /// Runs a checkpoint to completion.
    ///
    /// Blocks while another checkpoint is running, then while committed
    /// transactions drain.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Closed`] if the coordinator was shut down while
    ///   something was still outstanding; the log is untouched
    /// - any error from the message store, the prepared store or the log;
    ///   it has already been logged and the log is left as it was unless
    ///   the failure happened during eviction
    pub fn checkpoint(&self) -> CoreResult<CheckpointSummary> {
        let _running = self.running.lock();
        let started = Instant::now();
        let mut retries: u32 = 0;
        let warn_every = self.config.drain_warn_every.max(1);

        loop {
            self.signal.reset();
            let section = self.section.write();
            self.enter(CheckpointPhase::Locked);

            self.enter(CheckpointPhase::Draining);
            if !self.drained() {
                drop(section);
                self.enter(CheckpointPhase::Idle);
                if self.signal.is_shut_down() {
                    info!(retries, "shut down with commits or removals outstanding, checkpoint skipped");
                    return Err(CoreError::Closed);
                }
                retries += 1;
                self.stats.record_checkpoint_retry();
                if retries % warn_every == 0 {
                    warn!(
                        retries,
                        waited = ?started.elapsed(),
                        "checkpoint still waiting for committed transactions to drain"
                    );
                }
                self.signal.wait_timeout(self.config.drain_wait);
                continue;
            }

            let result = self.run_locked();
            drop(section);
            self.enter(CheckpointPhase::Idle);

            return match result {
                Ok(mut summary) => {
                    summary.retries = retries;
                    self.stats.record_checkpoint();
                    info!(
                        flushed = summary.flushed,
                        evicted = summary.evicted,
                        retries,
                        released = summary.log_bytes_released,
                        elapsed = ?started.elapsed(),
                        "checkpoint complete"
                    );
                    Ok(summary)
                }
                Err(e) => {
                    self.stats.record_checkpoint_failure();
                    error!(error = %e, "checkpoint aborted");
                    Err(e)
                }
            };
        }
    }

    /// Waits on each coordinator's draining set and on pending removals,
    /// blocking only where configured to block under the lock.
    fn drained(&self) -> bool {
        let commits = self.coordinators.iter().all(|c| {
            let blocking = self.config.blocks_drain_under_lock(c.kind());
            c.wait_for_draining_complete(blocking) == DrainOutcome::Completed
        });
        commits && self.logged.wait_for_pending_removals(false) == DrainOutcome::Completed
    }

    fn run_locked(&self) -> CoreResult<CheckpointSummary> {
        let mut summary = CheckpointSummary::default();

        self.enter(CheckpointPhase::Flushing);
        self.messages.force_to_disk()?;
        for coordinator in &self.coordinators {
            summary.flushed += coordinator.flush_unpersisted_to_store()?;
        }
        self.store.sync()?;

        let before = self.log.size();
        self.log.reset()?;
        summary.log_bytes_released = before.saturating_sub(self.log.size());
        self.enter(CheckpointPhase::Truncated);
        self.logged.on_checkpoint();

        self.enter(CheckpointPhase::Evicting);
        for coordinator in &self.coordinators {
            summary.evicted += coordinator.evict_completed_after_checkpoint()?;
        }
        Ok(summary)
    }

    /// Bounded wait used by tests that need the lock released.
    #[cfg(test)]
    fn wait_for_idle(&self, timeout: std::time::Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.phase() == CheckpointPhase::Idle {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        false
    }
}

impl fmt::Debug for CheckpointCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointCoordinator")
            .field("phase", &self.phase())
            .field("coordinators", &self.coordinators.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryMessageStore;
    use crate::transaction::{TransactionKind, TransactionRecord, TransactionState, Workload};
    use crate::types::TransactionId;
    use crate::wal::{LogEvent, LogOptions};
    use brokerlog_storage::InMemoryBackend;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        section: Arc<RwLock<()>>,
        log: Arc<TransactionLog>,
        store: Arc<PreparedTransactionStore>,
        local: Arc<TransactionCoordinator>,
        cluster: Arc<TransactionCoordinator>,
        messages: Arc<InMemoryMessageStore>,
        checkpoint: Arc<CheckpointCoordinator>,
    }

    fn fixture(config: Config) -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(PreparedTransactionStore::open(dir.path(), &config).unwrap());
        let log = Arc::new(
            TransactionLog::open(
                Box::new(InMemoryBackend::new()),
                LogOptions::from_config(&config),
            )
            .unwrap(),
        );
        let signal = Arc::new(DrainSignal::new());
        let local = Arc::new(TransactionCoordinator::new(
            TransactionKind::Local,
            Arc::clone(&store),
            Arc::clone(&signal),
            &config,
        ));
        let cluster = Arc::new(TransactionCoordinator::new(
            TransactionKind::Cluster,
            Arc::clone(&store),
            Arc::clone(&signal),
            &config,
        ));
        let messages = Arc::new(InMemoryMessageStore::new());
        let section = Arc::new(RwLock::new(()));
        let checkpoint = Arc::new(CheckpointCoordinator::new(
            Arc::clone(&section),
            Arc::clone(&log),
            Arc::clone(&store),
            vec![Arc::clone(&local), Arc::clone(&cluster)],
            Arc::clone(&messages) as Arc<dyn MessageStore>,
            signal,
            Arc::new(LogStats::new()),
            &config,
        ));
        Fixture {
            _dir: dir,
            section,
            log,
            store,
            local,
            cluster,
            messages,
            checkpoint,
        }
    }

    fn prepare(f: &Fixture, id: u64) -> TransactionRecord {
        let txn = TransactionRecord::local(TransactionId::new(id), Workload::new());
        f.log
            .append_event(&LogEvent::Prepare { txn: txn.clone() })
            .unwrap();
        f.local.on_prepare(txn.clone()).unwrap();
        txn
    }

    #[test]
    fn checkpoint_flushes_and_resets() {
        let f = fixture(Config::default());
        prepare(&f, 1);
        assert!(f.log.record_count() > 0);

        let summary = f.checkpoint.checkpoint().unwrap();
        assert_eq!(summary.flushed, 1);
        assert_eq!(summary.retries, 0);
        assert!(summary.log_bytes_released > 0);
        assert_eq!(f.log.record_count(), 0);
        assert!(f.store.contains(TransactionId::new(1)));
        assert_eq!(f.messages.force_count(), 1);
        assert_eq!(f.checkpoint.phase(), CheckpointPhase::Idle);
    }

    #[test]
    fn completed_transactions_are_evicted_after_reset() {
        let f = fixture(Config::default());
        prepare(&f, 1);
        f.checkpoint.checkpoint().unwrap();

        f.local
            .on_complete(TransactionId::new(1), TransactionState::RolledBack)
            .unwrap();
        let summary = f.checkpoint.checkpoint().unwrap();
        assert_eq!(summary.evicted, 1);
        assert!(!f.store.contains(TransactionId::new(1)));
    }

    #[test]
    fn second_checkpoint_is_a_no_op() {
        let f = fixture(Config::default());
        prepare(&f, 1);
        f.checkpoint.checkpoint().unwrap();
        let summary = f.checkpoint.checkpoint().unwrap();
        assert_eq!(summary.flushed, 0);
        assert_eq!(summary.evicted, 0);
        assert_eq!(f.store.len(), 1);
    }

    #[test]
    fn checkpoint_waits_for_draining_commits() {
        let config = Config::default().drain_wait(Duration::from_millis(5));
        let f = fixture(config);
        let txn = TransactionRecord::local(TransactionId::new(7), Workload::new()).one_phase();
        f.log
            .append_event(&LogEvent::Prepare { txn: txn.clone() })
            .unwrap();
        f.local.on_prepare(txn).unwrap();
        assert_eq!(f.local.draining_count(), 1);

        let cp = Arc::clone(&f.checkpoint);
        let runner = thread::spawn(move || cp.checkpoint().unwrap());

        thread::sleep(Duration::from_millis(30));
        assert!(f.log.record_count() > 0, "log reset while a commit drains");
        assert!(f.checkpoint.wait_for_idle(Duration::from_secs(1)));

        f.local.commit_applied(TransactionId::new(7));
        let summary = runner.join().unwrap();
        assert!(summary.retries > 0);
        assert_eq!(f.log.record_count(), 0);
    }

    #[test]
    fn readers_block_the_checkpoint() {
        let f = fixture(Config::default());
        prepare(&f, 1);
        let shared = f.section.read();

        let cp = Arc::clone(&f.checkpoint);
        let runner = thread::spawn(move || cp.checkpoint().unwrap());
        thread::sleep(Duration::from_millis(20));
        assert!(f.log.record_count() > 0);

        drop(shared);
        runner.join().unwrap();
        assert_eq!(f.log.record_count(), 0);
    }

    #[test]
    fn incomplete_cluster_transactions_survive() {
        let f = fixture(Config::default());
        let txn = TransactionRecord::cluster(
            TransactionId::new(3),
            Workload::new(),
            [crate::types::BrokerAddress::new("b:1")],
        );
        f.cluster.on_prepare(txn).unwrap();
        f.cluster
            .on_complete(TransactionId::new(3), TransactionState::Committed)
            .unwrap();
        f.cluster.commit_applied(TransactionId::new(3));

        f.checkpoint.checkpoint().unwrap();
        assert!(f.store.contains(TransactionId::new(3)));
        assert!(f.cluster.is_incomplete(TransactionId::new(3)));
    }

    #[test]
    fn shut_down_ends_the_retry_loop() {
        let config = Config::default().drain_wait(Duration::from_millis(5));
        let f = fixture(config);
        let txn = TransactionRecord::local(TransactionId::new(8), Workload::new()).one_phase();
        f.log
            .append_event(&LogEvent::Prepare { txn: txn.clone() })
            .unwrap();
        f.local.on_prepare(txn).unwrap();

        let cp = Arc::clone(&f.checkpoint);
        let runner = thread::spawn(move || cp.checkpoint());
        thread::sleep(Duration::from_millis(30));
        f.checkpoint.shut_down();

        assert!(matches!(runner.join().unwrap(), Err(CoreError::Closed)));
        assert!(f.log.record_count() > 0);
        // Nothing outstanding: a checkpoint after shut down still runs.
        f.local.commit_applied(TransactionId::new(8));
        f.checkpoint.checkpoint().unwrap();
        assert_eq!(f.log.record_count(), 0);
    }

    #[test]
    fn checkpoint_waits_for_pending_removals() {
        let config = Config::default().drain_wait(Duration::from_millis(5));
        let f = fixture(config);
        let queue = crate::types::DestinationId::queue("q");
        let message = crate::types::MessageId::new(1);
        f.log
            .append_event(&LogEvent::MessageRemoval {
                destination: queue.clone(),
                message_id: message,
            })
            .unwrap();
        let logged = Arc::clone(f.checkpoint.logged_messages());
        logged.message_logged(&queue, message);
        logged.removal_logged(&queue, message);

        let cp = Arc::clone(&f.checkpoint);
        let runner = thread::spawn(move || cp.checkpoint().unwrap());
        thread::sleep(Duration::from_millis(30));
        assert!(f.log.record_count() > 0, "log reset under a pending removal");

        logged.removal_applied(&queue, message);
        let summary = runner.join().unwrap();
        assert!(summary.retries > 0);
        assert_eq!(f.log.record_count(), 0);
    }

    #[test]
    fn checkpoint_forgets_logged_messages() {
        let f = fixture(Config::default());
        let queue = crate::types::DestinationId::queue("q");
        f.checkpoint
            .logged_messages()
            .message_logged(&queue, crate::types::MessageId::new(2));
        f.checkpoint.checkpoint().unwrap();
        assert_eq!(f.checkpoint.logged_messages().logged_count(), 0);
    }
}
