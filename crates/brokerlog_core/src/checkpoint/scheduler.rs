//! Background checkpoint thread.

use crate::checkpoint::CheckpointCoordinator;
use crate::error::{CoreError, CoreResult};
use crate::wal::{CheckpointListener, CheckpointReason};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Requests {
    pending: Option<CheckpointReason>,
    stop: bool,
}

#[derive(Debug, Default)]
struct Shared {
    requests: Mutex<Requests>,
    cv: Condvar,
}

/// Hands checkpoint requests from the log to the scheduler thread.
#[derive(Debug)]
struct Requester(Arc<Shared>);

impl CheckpointListener for Requester {
    fn checkpoint_requested(&self, reason: CheckpointReason) {
        let mut requests = self.0.requests.lock();
        if requests.pending.is_none() {
            requests.pending = Some(reason);
        }
        self.0.cv.notify_one();
    }
}

/// Runs checkpoints on a dedicated thread.
///
/// Requests that arrive while one is pending are merged into it. With a
/// non-zero interval the thread also checkpoints when that much time passes
/// without a request.
pub struct CheckpointScheduler {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointScheduler {
    /// Starts the scheduler thread.
    pub fn start(checkpoint: Arc<CheckpointCoordinator>, interval: Duration) -> CoreResult<Self> {
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("brokerlog-checkpoint".into())
            .spawn(move || run(&thread_shared, &checkpoint, interval))?;
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// A listener to register with the log.
    pub fn listener(&self) -> Arc<dyn CheckpointListener> {
        Arc::new(Requester(Arc::clone(&self.shared)))
    }

    /// Asks for a checkpoint without waiting for it.
    pub fn request(&self, reason: CheckpointReason) {
        Requester(Arc::clone(&self.shared)).checkpoint_requested(reason);
    }

    /// Stops the thread after any checkpoint in progress. A pending request
    /// is dropped.
    pub fn stop(&self) -> CoreResult<()> {
        self.shared.requests.lock().stop = true;
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            handle
                .join()
                .map_err(|_| CoreError::invalid_operation("checkpoint thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for CheckpointScheduler {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for CheckpointScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointScheduler")
            .field("running", &self.handle.lock().is_some())
            .finish_non_exhaustive()
    }
}

fn run(shared: &Shared, checkpoint: &CheckpointCoordinator, interval: Duration) {
    debug!(?interval, "checkpoint scheduler started");
    loop {
        let reason = {
            let mut requests = shared.requests.lock();
            while requests.pending.is_none() && !requests.stop {
                if interval.is_zero() {
                    shared.cv.wait(&mut requests);
                } else if shared.cv.wait_for(&mut requests, interval).timed_out() {
                    break;
                }
            }
            if requests.stop {
                break;
            }
            requests.pending.take()
        };
        match reason {
            Some(reason) => debug!(?reason, "running requested checkpoint"),
            None => debug!("running timed checkpoint"),
        }
        // Failures are logged by the coordinator; the next request retries.
        let _ = checkpoint.checkpoint();
    }
    info!("checkpoint scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryMessageStore, MessageStore};
    use crate::config::Config;
    use crate::prepared::PreparedTransactionStore;
    use crate::stats::LogStats;
    use crate::transaction::{DrainSignal, TransactionCoordinator, TransactionKind};
    use crate::wal::{LogEvent, LogOptions, TransactionLog};
    use crate::types::{DestinationId, MessageId};
    use brokerlog_storage::InMemoryBackend;
    use parking_lot::RwLock;
    use std::time::Instant;
    use tempfile::tempdir;

    fn setup(config: &Config) -> (tempfile::TempDir, Arc<TransactionLog>, Arc<LogStats>, Arc<CheckpointCoordinator>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(PreparedTransactionStore::open(dir.path(), config).unwrap());
        let log = Arc::new(
            TransactionLog::open(Box::new(InMemoryBackend::new()), LogOptions::from_config(config))
                .unwrap(),
        );
        let signal = Arc::new(DrainSignal::new());
        let local = Arc::new(TransactionCoordinator::new(
            TransactionKind::Local,
            Arc::clone(&store),
            Arc::clone(&signal),
            config,
        ));
        let stats = Arc::new(LogStats::new());
        let messages: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let checkpoint = Arc::new(CheckpointCoordinator::new(
            Arc::new(RwLock::new(())),
            Arc::clone(&log),
            store,
            vec![local],
            messages,
            signal,
            Arc::clone(&stats),
            config,
        ));
        (dir, log, stats, checkpoint)
    }

    fn removal(id: u64) -> LogEvent {
        LogEvent::MessageRemoval {
            destination: DestinationId::queue("q"),
            message_id: MessageId::new(id),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn threshold_request_runs_a_checkpoint() {
        let config = Config::default().checkpoint_record_threshold(3);
        let (_dir, log, stats, checkpoint) = setup(&config);
        let scheduler = CheckpointScheduler::start(checkpoint, Duration::ZERO).unwrap();
        log.set_listener(scheduler.listener());

        for i in 0..3 {
            log.append_event(&removal(i)).unwrap();
        }
        assert!(wait_until(|| stats.checkpoints_completed() >= 1));
        assert!(wait_until(|| log.record_count() == 0));
        scheduler.stop().unwrap();
    }

    #[test]
    fn interval_runs_checkpoints_without_requests() {
        let config = Config::default();
        let (_dir, _log, stats, checkpoint) = setup(&config);
        let scheduler = CheckpointScheduler::start(checkpoint, Duration::from_millis(10)).unwrap();
        assert!(wait_until(|| stats.checkpoints_completed() >= 2));
        scheduler.stop().unwrap();
    }

    #[test]
    fn stop_is_idempotent() {
        let config = Config::default();
        let (_dir, _log, stats, checkpoint) = setup(&config);
        let scheduler = CheckpointScheduler::start(checkpoint, Duration::ZERO).unwrap();
        scheduler.stop().unwrap();
        scheduler.stop().unwrap();
        scheduler.request(CheckpointReason::Requested);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(stats.checkpoints_completed(), 0);
    }
}
