//! Transaction log statistics.
//!
//! ```rust,ignore
//! let stats = manager.stats();
//! println!("appended {} records", stats.records_appended);
//! println!("checkpoints: {}", stats.checkpoints_completed);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the transaction log and its checkpoints.
///
/// All counters are atomic and may be read while operations are running.
#[derive(Debug, Default)]
pub struct LogStats {
    records_appended: AtomicU64,
    bytes_appended: AtomicU64,
    checkpoints_completed: AtomicU64,
    checkpoints_failed: AtomicU64,
    checkpoint_retries: AtomicU64,
    records_replayed: AtomicU64,
    reroutes: AtomicU64,
    corruption_warnings: AtomicU64,
}

impl LogStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_append(&self, bytes: u64) {
        self.records_appended.fetch_add(1, Ordering::Relaxed);
        self.bytes_appended.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint_failure(&self) {
        self.checkpoints_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint_retry(&self) {
        self.checkpoint_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replayed(&self, records: u64) {
        self.records_replayed.fetch_add(records, Ordering::Relaxed);
    }

    pub(crate) fn record_reroutes(&self, count: u64) {
        self.reroutes.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_corruption(&self, warnings: u64) {
        self.corruption_warnings.fetch_add(warnings, Ordering::Relaxed);
    }

    /// Records appended since open.
    pub fn records_appended(&self) -> u64 {
        self.records_appended.load(Ordering::Relaxed)
    }

    /// Checkpoints that completed.
    pub fn checkpoints_completed(&self) -> u64 {
        self.checkpoints_completed.load(Ordering::Relaxed)
    }

    /// Checkpoints aborted by an error.
    pub fn checkpoints_failed(&self) -> u64 {
        self.checkpoints_failed.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_appended: self.records_appended(),
            bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
            checkpoints_completed: self.checkpoints_completed(),
            checkpoints_failed: self.checkpoints_failed(),
            checkpoint_retries: self.checkpoint_retries.load(Ordering::Relaxed),
            records_replayed: self.records_replayed.load(Ordering::Relaxed),
            reroutes: self.reroutes.load(Ordering::Relaxed),
            corruption_warnings: self.corruption_warnings.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`LogStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Records appended to the log.
    pub records_appended: u64,
    /// Body bytes appended to the log.
    pub bytes_appended: u64,
    /// Checkpoints that reset the log.
    pub checkpoints_completed: u64,
    /// Checkpoints aborted by an error.
    pub checkpoints_failed: u64,
    /// Times a checkpoint released its lock to wait for draining commits.
    pub checkpoint_retries: u64,
    /// Log records applied during recovery.
    pub records_replayed: u64,
    /// Messages re-routed during recovery because their interests changed.
    pub reroutes: u64,
    /// Corrupted records found and discarded.
    pub corruption_warnings: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        assert_eq!(LogStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn snapshot_reflects_updates() {
        let stats = LogStats::new();
        stats.record_append(40);
        stats.record_append(60);
        stats.record_checkpoint();
        stats.record_checkpoint_retry();
        stats.record_reroutes(2);

        let snap = stats.snapshot();
        assert_eq!(snap.records_appended, 2);
        assert_eq!(snap.bytes_appended, 100);
        assert_eq!(snap.checkpoints_completed, 1);
        assert_eq!(snap.checkpoint_retries, 1);
        assert_eq!(snap.reroutes, 2);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(LogStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_append(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.records_appended(), 800);
    }
}
