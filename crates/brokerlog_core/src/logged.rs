//! Messages whose send is in the current log generation.
//!
//! Replaying a logged send re-creates the message, so a message sent since
//! the last checkpoint must not be removed from the message store without a
//! removal record behind it, unless its last acknowledgement is logged. A
//! logged removal is pending until the message store has applied it; the
//! checkpoint waits for pending removals the way it waits for draining
//! commits, so the reset never discards a removal the store does not hold.

use crate::config::Config;
use crate::transaction::{DrainOutcome, DrainSignal};
use crate::types::{DestinationId, MessageId};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type MessageKey = (DestinationId, MessageId);

#[derive(Debug, Default)]
struct Tracked {
    logged: HashSet<MessageKey>,
    removing: HashSet<MessageKey>,
}

/// Tracks logged messages until the next checkpoint, and logged removals
/// until the message store confirms them.
#[derive(Debug)]
pub struct LoggedMessages {
    tracked: Mutex<Tracked>,
    removed: Condvar,
    signal: Arc<DrainSignal>,
    drain_wait: Duration,
    drain_warn_every: u32,
}

impl LoggedMessages {
    /// Creates an empty tracker that fires `signal` when a removal lands.
    pub fn new(signal: Arc<DrainSignal>, config: &Config) -> Self {
        Self {
            tracked: Mutex::new(Tracked::default()),
            removed: Condvar::new(),
            signal,
            drain_wait: config.drain_wait,
            drain_warn_every: config.drain_warn_every.max(1),
        }
    }

    /// Notes that a send of the message has been appended to the log.
    pub fn message_logged(&self, destination: &DestinationId, message_id: MessageId) {
        self.tracked
            .lock()
            .logged
            .insert((destination.clone(), message_id));
    }

    /// Notes that the message's last acknowledgement has been logged. Its
    /// replay leaves the message consumed, so no removal record is needed.
    pub fn last_ack_logged(&self, destination: &DestinationId, message_id: MessageId) {
        self.tracked
            .lock()
            .logged
            .remove(&(destination.clone(), message_id));
    }

    /// Whether removing the message needs a removal record.
    pub fn needs_removal_record(&self, destination: &DestinationId, message_id: MessageId) -> bool {
        self.tracked
            .lock()
            .logged
            .contains(&(destination.clone(), message_id))
    }

    /// Marks a logged removal as not yet applied to the message store.
    pub fn removal_logged(&self, destination: &DestinationId, message_id: MessageId) {
        let key = (destination.clone(), message_id);
        let mut tracked = self.tracked.lock();
        tracked.logged.remove(&key);
        tracked.removing.insert(key);
    }

    /// Confirms that the message store has applied a removal. Confirming
    /// twice, or confirming a removal that was never logged, is harmless.
    pub fn removal_applied(&self, destination: &DestinationId, message_id: MessageId) {
        let mut tracked = self.tracked.lock();
        if tracked.removing.remove(&(destination.clone(), message_id)) {
            self.removed.notify_all();
        }
        drop(tracked);
        self.signal.notify();
    }

    /// Number of logged removals the message store has not applied yet.
    pub fn pending_removals(&self) -> usize {
        self.tracked.lock().removing.len()
    }

    /// Number of messages logged since the last checkpoint.
    pub fn logged_count(&self) -> usize {
        self.tracked.lock().logged.len()
    }

    /// Waits until no logged removal is pending.
    ///
    /// Non-blocking callers, and every caller once the signal is shut
    /// down, get [`DrainOutcome::TimedOut`] while removals are pending.
    pub fn wait_for_pending_removals(&self, blocking: bool) -> DrainOutcome {
        let mut tracked = self.tracked.lock();
        let mut waits: u32 = 0;
        while !tracked.removing.is_empty() {
            if !blocking || self.signal.is_shut_down() {
                return DrainOutcome::TimedOut;
            }
            self.removed.wait_for(&mut tracked, self.drain_wait);
            waits = waits.wrapping_add(1);
            if !tracked.removing.is_empty() && waits % self.drain_warn_every == 0 {
                warn!(
                    remaining = tracked.removing.len(),
                    waits,
                    "still waiting for logged message removals"
                );
            }
        }
        DrainOutcome::Completed
    }

    /// Forgets every logged message once the log has been reset.
    pub fn on_checkpoint(&self) -> usize {
        let mut tracked = self.tracked.lock();
        let cleared = tracked.logged.len();
        tracked.logged.clear();
        debug!(cleared, "logged message list reset");
        cleared
    }
}
