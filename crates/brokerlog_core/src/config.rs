//! Transaction log configuration.
//!
//! Broker-wide settings arrive here as plain values; nothing in this crate
//! reads property files.

use crate::transaction::TransactionKind;
use std::time::Duration;

/// Settings for the prepared-transaction record store.
#[derive(Debug, Clone)]
pub struct RecordStoreConfig {
    /// Keep records in the shared `vrfile` region. When false every record
    /// gets its own numbered file.
    pub use_region_file: bool,

    /// Records larger than this go to an individual overflow file.
    pub max_region_record_size: usize,

    /// Minimum number of bytes the region grows by when it runs out of
    /// free blocks.
    pub region_growth: u64,

    /// Upper bound on idle overflow files kept for reuse.
    pub file_pool_limit: usize,

    /// Percentage of the pool kept as truncated (zero-length) files rather
    /// than tagged-free files.
    pub file_pool_clean_ratio: u8,

    /// Sync every record write.
    pub sync_on_write: bool,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            use_region_file: true,
            max_region_record_size: 64 * 1024,
            region_growth: 256 * 1024,
            file_pool_limit: 64,
            file_pool_clean_ratio: 25,
            sync_on_write: false,
        }
    }
}

impl RecordStoreConfig {
    /// Sets whether the region file is used.
    #[must_use]
    pub const fn use_region_file(mut self, value: bool) -> Self {
        self.use_region_file = value;
        self
    }

    /// Sets the overflow threshold.
    #[must_use]
    pub const fn max_region_record_size(mut self, size: usize) -> Self {
        self.max_region_record_size = size;
        self
    }

    /// Sets the region growth step.
    #[must_use]
    pub const fn region_growth(mut self, bytes: u64) -> Self {
        self.region_growth = bytes;
        self
    }

    /// Sets the file pool limit and clean ratio.
    #[must_use]
    pub const fn file_pool(mut self, limit: usize, clean_ratio: u8) -> Self {
        self.file_pool_limit = limit;
        self.file_pool_clean_ratio = clean_ratio;
        self
    }

    /// Sets whether each record write is synced.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Number of idle files kept tagged FREE, ready for immediate reuse.
    #[must_use]
    pub fn free_tier_capacity(&self) -> usize {
        self.file_pool_limit - self.truncated_tier_capacity()
    }

    /// Number of idle files kept truncated to zero length.
    #[must_use]
    pub fn truncated_tier_capacity(&self) -> usize {
        let ratio = usize::from(self.file_pool_clean_ratio.min(100));
        self.file_pool_limit * ratio / 100
    }
}

/// Configuration for opening a broker's transaction log.
#[derive(Debug, Clone)]
pub struct Config {
    /// Create the broker directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync the log after every append.
    pub sync_on_write: bool,

    /// Log sends made outside a transaction.
    pub log_non_transacted_sends: bool,

    /// Log acknowledgements made outside a transaction.
    pub log_non_transacted_acks: bool,

    /// Nominal capacity of the log file.
    pub max_log_size: u64,

    /// The checkpoint callback fires once the log passes
    /// `max_log_size - checkpoint_margin` bytes.
    pub checkpoint_margin: u64,

    /// The checkpoint callback also fires after this many records
    /// (0 = disabled).
    pub checkpoint_record_threshold: u64,

    /// How often to checkpoint on a timer (zero = never).
    pub checkpoint_interval: Duration,

    /// Bounded wait used by draining monitors.
    pub drain_wait: Duration,

    /// Emit a warning every this many unsuccessful draining waits.
    pub drain_warn_every: u32,

    /// Kinds whose draining wait blocks while the checkpoint holds the
    /// exclusive lock. Every other kind times out instead.
    pub block_drain_under_lock: [bool; 3],

    /// Update state and completion flags in place.
    pub in_place_updates: bool,

    /// Record store settings.
    pub record_store: RecordStoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_write: true,
            log_non_transacted_sends: true,
            log_non_transacted_acks: true,
            max_log_size: 10 * 1024 * 1024,   // 10 MB
            checkpoint_margin: 500 * 1024,    // 500 KB
            checkpoint_record_threshold: 0,
            checkpoint_interval: Duration::ZERO,
            drain_wait: Duration::from_secs(1),
            drain_warn_every: 15,
            block_drain_under_lock: [false; 3],
            in_place_updates: true,
            record_store: RecordStoreConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the log on every append.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets whether non-transacted sends and acks are logged.
    #[must_use]
    pub const fn log_non_transacted(mut self, sends: bool, acks: bool) -> Self {
        self.log_non_transacted_sends = sends;
        self.log_non_transacted_acks = acks;
        self
    }

    /// Sets the log capacity and the margin before it at which a checkpoint
    /// is requested.
    #[must_use]
    pub const fn max_log_size(mut self, size: u64, margin: u64) -> Self {
        self.max_log_size = size;
        self.checkpoint_margin = margin;
        self
    }

    /// Requests a checkpoint after this many records.
    #[must_use]
    pub const fn checkpoint_record_threshold(mut self, records: u64) -> Self {
        self.checkpoint_record_threshold = records;
        self
    }

    /// Sets the timer-driven checkpoint interval.
    #[must_use]
    pub const fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets the bounded draining wait.
    #[must_use]
    pub const fn drain_wait(mut self, wait: Duration) -> Self {
        self.drain_wait = wait;
        self
    }

    /// Sets how often a stalled checkpoint warns.
    #[must_use]
    pub const fn drain_warn_every(mut self, waits: u32) -> Self {
        self.drain_warn_every = waits;
        self
    }

    /// Makes the draining wait for `kind` block under the exclusive lock.
    #[must_use]
    pub const fn block_drain_under_lock(mut self, kind: TransactionKind, value: bool) -> Self {
        self.block_drain_under_lock[kind.index()] = value;
        self
    }

    /// Sets whether in-place client-data updates are used.
    #[must_use]
    pub const fn in_place_updates(mut self, value: bool) -> Self {
        self.in_place_updates = value;
        self
    }

    /// Replaces the record store settings.
    #[must_use]
    pub fn record_store(mut self, record_store: RecordStoreConfig) -> Self {
        self.record_store = record_store;
        self
    }

    /// Returns the log size at which the checkpoint callback fires.
    #[must_use]
    pub const fn checkpoint_size(&self) -> u64 {
        self.max_log_size.saturating_sub(self.checkpoint_margin)
    }

    /// Whether the draining wait for `kind` blocks under the exclusive lock.
    #[must_use]
    pub const fn blocks_drain_under_lock(&self, kind: TransactionKind) -> bool {
        self.block_drain_under_lock[kind.index()]
    }
}
