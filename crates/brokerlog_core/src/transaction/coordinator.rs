//! Per-kind transaction state machines.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::prepared::PreparedTransactionStore;
use crate::transaction::state::{TransactionKind, TransactionRecord, TransactionState};
use crate::types::{BrokerAddress, TransactionId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What distinguishes one transaction kind's lifecycle from another's.
pub trait KindPolicy {
    /// A committed transaction stays incomplete until every participant
    /// broker has confirmed.
    fn needs_all_participants(&self) -> bool;

    /// A completed transaction leaves the incomplete sets as soon as its
    /// outcome is known.
    fn remove_on_complete(&self) -> bool;
}

impl KindPolicy for TransactionKind {
    fn needs_all_participants(&self) -> bool {
        matches!(self, Self::Cluster)
    }

    fn remove_on_complete(&self) -> bool {
        matches!(self, Self::Local | Self::Remote)
    }
}

/// Result of waiting for the draining set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The draining set was empty.
    Completed,
    /// The set was non-empty and the caller asked not to block.
    TimedOut,
}

/// Notification that some committed transaction finished draining.
///
/// Shared by every coordinator and the checkpoint, which waits on it after
/// backing off from a non-empty draining set. Once shut down, blocking
/// draining waits give up instead of waiting for commits that will never
/// be confirmed.
#[derive(Debug, Default)]
pub struct DrainSignal {
    fired: Mutex<bool>,
    cv: Condvar,
    shut_down: AtomicBool,
}

impl DrainSignal {
    /// Creates an unfired signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal and wakes every waiter.
    pub fn notify(&self) {
        *self.fired.lock() = true;
        self.cv.notify_all();
    }

    /// Clears the signal.
    pub fn reset(&self) {
        *self.fired.lock() = false;
    }

    /// Releases every draining wait for good and wakes the waiters.
    pub fn shut_down(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.notify();
    }

    /// Returns true once [`shut_down`](Self::shut_down) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for the signal. Returns true if it fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut fired = self.fired.lock();
        if !*fired {
            self.cv.wait_for(&mut fired, timeout);
        }
        *fired
    }
}

#[derive(Debug, Default)]
struct TxnSets {
    unpersisted: HashMap<TransactionId, TransactionRecord>,
    persisted_incomplete: HashMap<TransactionId, TransactionRecord>,
    persisted_complete: HashMap<TransactionId, TransactionRecord>,
    reserved: HashSet<TransactionId>,
}

impl TxnSets {
    fn find(&self, id: TransactionId) -> Option<&TransactionRecord> {
        self.unpersisted
            .get(&id)
            .or_else(|| self.persisted_incomplete.get(&id))
            .or_else(|| self.persisted_complete.get(&id))
    }
}

/// Where a transaction sits in a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residence {
    /// Known only to the log and memory.
    Unpersisted,
    /// In the prepared store, outcome or participants outstanding.
    PersistedIncomplete,
    /// In the prepared store, to be evicted after the next checkpoint.
    PersistedComplete,
}

/// Tracks the transactions of one kind through prepare, completion and
/// checkpoint.
///
/// Every transaction is in at most one of three sets: not yet persisted,
/// persisted but incomplete, persisted and complete. Committed transactions
/// are additionally in the draining set until their effects have reached
/// the message store.
pub struct TransactionCoordinator {
    kind: TransactionKind,
    store: Arc<PreparedTransactionStore>,
    sets: Mutex<TxnSets>,
    draining: Mutex<HashSet<TransactionId>>,
    drained: Condvar,
    signal: Arc<DrainSignal>,
    drain_wait: Duration,
    drain_warn_every: u32,
}

impl TransactionCoordinator {
    /// Creates a coordinator for `kind`.
    pub fn new(
        kind: TransactionKind,
        store: Arc<PreparedTransactionStore>,
        signal: Arc<DrainSignal>,
        config: &Config,
    ) -> Self {
        Self {
            kind,
            store,
            sets: Mutex::new(TxnSets::default()),
            draining: Mutex::new(HashSet::new()),
            drained: Condvar::new(),
            signal,
            drain_wait: config.drain_wait,
            drain_warn_every: config.drain_warn_every.max(1),
        }
    }

    /// The kind this coordinator handles.
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    fn check_kind(&self, txn: &TransactionRecord) -> CoreResult<()> {
        if txn.kind() == self.kind {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "{} transaction {} routed to the {} coordinator",
                txn.kind(),
                txn.id,
                self.kind
            )))
        }
    }

    /// Whether a transaction in `state` needs nothing more before it may be
    /// evicted.
    fn fully_complete(&self, txn: &TransactionRecord) -> bool {
        if !txn.state.is_terminal() {
            return false;
        }
        if self.kind.remove_on_complete() {
            return true;
        }
        !self.kind.needs_all_participants()
            || txn.state == TransactionState::RolledBack
            || txn.all_participants_complete()
    }

    /// Claims `id` for a transaction about to be logged, so a concurrent
    /// caller with the same id is refused before it appends anything.
    /// [`on_prepare`](Self::on_prepare) consumes the claim.
    ///
    /// # Errors
    ///
    /// [`CoreError::TransactionExists`] if the id is tracked or claimed.
    pub fn reserve(&self, id: TransactionId) -> CoreResult<()> {
        let mut sets = self.sets.lock();
        if sets.find(id).is_some() || !sets.reserved.insert(id) {
            return Err(CoreError::TransactionExists { id });
        }
        Ok(())
    }

    /// Drops a claim whose transaction was never logged.
    pub fn release(&self, id: TransactionId) {
        self.sets.lock().reserved.remove(&id);
    }

    /// Registers a prepared transaction.
    ///
    /// A one-phase local commit skips the prepare bookkeeping and goes
    /// straight to the draining set.
    pub fn on_prepare(&self, txn: TransactionRecord) -> CoreResult<()> {
        self.check_kind(&txn)?;
        let mut sets = self.sets.lock();
        sets.reserved.remove(&txn.id);
        if txn.one_phase && self.kind == TransactionKind::Local {
            drop(sets);
            self.draining.lock().insert(txn.id);
            return Ok(());
        }
        if sets.find(txn.id).is_some() {
            return Err(CoreError::TransactionExists { id: txn.id });
        }
        debug!(id = %txn.id, kind = %self.kind, "transaction prepared");
        sets.unpersisted.insert(txn.id, txn);
        Ok(())
    }

    /// Returns true if the transaction is known and not yet fully complete.
    pub fn is_incomplete(&self, id: TransactionId) -> bool {
        let sets = self.sets.lock();
        sets.unpersisted.contains_key(&id) || sets.persisted_incomplete.contains_key(&id)
    }

    /// Returns where the transaction currently sits.
    pub fn residence(&self, id: TransactionId) -> Option<Residence> {
        let sets = self.sets.lock();
        if sets.unpersisted.contains_key(&id) {
            Some(Residence::Unpersisted)
        } else if sets.persisted_incomplete.contains_key(&id) {
            Some(Residence::PersistedIncomplete)
        } else if sets.persisted_complete.contains_key(&id) {
            Some(Residence::PersistedComplete)
        } else {
            None
        }
    }

    /// Records the outcome of a transaction.
    ///
    /// # Errors
    ///
    /// [`CoreError::TransactionNotFound`] if the transaction is in neither
    /// incomplete set.
    pub fn on_complete(&self, id: TransactionId, state: TransactionState) -> CoreResult<()> {
        let mut sets = self.sets.lock();

        if let Some(mut txn) = sets.unpersisted.remove(&id) {
            txn.state = state;
            self.start_draining(id, state);
            if self.fully_complete(&txn) {
                debug!(%id, %state, "unpersisted transaction finished");
            } else {
                sets.unpersisted.insert(id, txn);
            }
            return Ok(());
        }

        let Some(mut txn) = sets.persisted_incomplete.remove(&id) else {
            return Err(CoreError::TransactionNotFound { id });
        };
        txn.state = state;
        let done = self.fully_complete(&txn);
        let persisted = self.store.update_state(id, state).and_then(|()| {
            if done {
                txn.complete = true;
                self.store.update_completion(id, true)
            } else {
                Ok(())
            }
        });
        if let Err(e) = persisted {
            sets.persisted_incomplete.insert(id, txn);
            return Err(e);
        }
        self.start_draining(id, state);
        if done {
            debug!(%id, %state, "stored transaction complete, evicted at next checkpoint");
            sets.persisted_complete.insert(id, txn);
        } else {
            sets.persisted_incomplete.insert(id, txn);
        }
        Ok(())
    }

    fn start_draining(&self, id: TransactionId, state: TransactionState) {
        if state == TransactionState::Committed {
            self.draining.lock().insert(id);
        }
    }

    /// Marks `broker` complete for a cluster transaction. Returns true once
    /// every participant has confirmed.
    ///
    /// # Errors
    ///
    /// [`CoreError::StateConflict`] if the transaction is no longer in
    /// `expected` state; [`CoreError::ParticipantNotFound`] for a broker
    /// outside the transaction.
    pub fn update_broker_state(
        &self,
        id: TransactionId,
        expected: TransactionState,
        broker: &BrokerAddress,
    ) -> CoreResult<bool> {
        let mut sets = self.sets.lock();

        let residence = if sets.unpersisted.contains_key(&id) {
            Residence::Unpersisted
        } else if sets.persisted_incomplete.contains_key(&id) {
            Residence::PersistedIncomplete
        } else if sets.persisted_complete.contains_key(&id) {
            Residence::PersistedComplete
        } else {
            return Err(CoreError::TransactionNotFound { id });
        };
        let set = match residence {
            Residence::Unpersisted => &mut sets.unpersisted,
            Residence::PersistedIncomplete => &mut sets.persisted_incomplete,
            Residence::PersistedComplete => &mut sets.persisted_complete,
        };
        let Some(mut txn) = set.remove(&id) else {
            return Err(CoreError::TransactionNotFound { id });
        };

        if txn.state != expected {
            let actual = txn.state;
            set.insert(id, txn);
            return Err(CoreError::StateConflict {
                id,
                expected,
                actual,
            });
        }
        let Some(all_complete) = txn.complete_participant(broker) else {
            set.insert(id, txn);
            return Err(CoreError::ParticipantNotFound {
                id,
                broker: broker.clone(),
            });
        };
        debug!(%id, %broker, all_complete, "participant confirmed");

        let done = self.fully_complete(&txn);
        match residence {
            Residence::Unpersisted => {
                if !done {
                    sets.unpersisted.insert(id, txn);
                }
            }
            Residence::PersistedIncomplete => {
                txn.complete = done;
                if let Err(e) = self.store.replace(&txn) {
                    txn.complete = false;
                    sets.persisted_incomplete.insert(id, txn);
                    return Err(e);
                }
                if done {
                    sets.persisted_complete.insert(id, txn);
                } else {
                    sets.persisted_incomplete.insert(id, txn);
                }
            }
            Residence::PersistedComplete => {
                sets.persisted_complete.insert(id, txn);
            }
        }
        Ok(all_complete)
    }

    /// Confirms that a committed transaction's effects reached the message
    /// store. Removing an id twice is harmless.
    pub fn commit_applied(&self, id: TransactionId) {
        let mut draining = self.draining.lock();
        if draining.remove(&id) {
            self.drained.notify_all();
        }
        drop(draining);
        self.signal.notify();
    }

    /// Number of transactions still draining.
    pub fn draining_count(&self) -> usize {
        self.draining.lock().len()
    }

    /// Waits until the draining set is empty.
    ///
    /// Non-blocking callers get [`DrainOutcome::TimedOut`] straight away
    /// when it is not. Blocking callers get it too once the drain signal
    /// has been shut down.
    pub fn wait_for_draining_complete(&self, blocking: bool) -> DrainOutcome {
        let mut draining = self.draining.lock();
        let mut waits: u32 = 0;
        while !draining.is_empty() {
            if !blocking || self.signal.is_shut_down() {
                return DrainOutcome::TimedOut;
            }
            self.drained.wait_for(&mut draining, self.drain_wait);
            waits = waits.wrapping_add(1);
            if !draining.is_empty() && waits % self.drain_warn_every == 0 {
                warn!(
                    kind = %self.kind,
                    remaining = draining.len(),
                    waits,
                    "still waiting for committed transactions to drain"
                );
            }
        }
        DrainOutcome::Completed
    }

    /// Moves every unpersisted transaction into the prepared store.
    ///
    /// Ids already stored are left alone; they come from an earlier
    /// checkpoint that failed after flushing.
    pub fn flush_unpersisted_to_store(&self) -> CoreResult<usize> {
        let mut sets = self.sets.lock();
        let ids: Vec<TransactionId> = sets.unpersisted.keys().copied().collect();
        let mut flushed = 0;
        for id in ids {
            if self.store.contains(id) {
                info!(%id, "transaction already in prepared store, skipping flush");
                if let Some(txn) = sets.unpersisted.remove(&id) {
                    sets.persisted_incomplete.insert(id, txn);
                }
                continue;
            }
            let Some(txn) = sets.unpersisted.get(&id) else {
                continue;
            };
            self.store.store(txn)?;
            if let Some(txn) = sets.unpersisted.remove(&id) {
                sets.persisted_incomplete.insert(id, txn);
            }
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Removes completed transactions from the prepared store. Only called
    /// once the log has been reset.
    pub fn evict_completed_after_checkpoint(&self) -> CoreResult<usize> {
        let mut sets = self.sets.lock();
        let ids: Vec<TransactionId> = sets.persisted_complete.keys().copied().collect();
        for &id in &ids {
            if self.store.contains(id) {
                self.store.remove(id)?;
            }
            sets.persisted_complete.remove(&id);
        }
        Ok(ids.len())
    }

    /// Routes a transaction read from the prepared store at startup.
    pub fn load_stored(&self, mut txn: TransactionRecord) -> CoreResult<Residence> {
        self.check_kind(&txn)?;
        let mut sets = self.sets.lock();
        if txn.complete || self.fully_complete(&txn) {
            txn.complete = true;
            sets.persisted_complete.insert(txn.id, txn);
            Ok(Residence::PersistedComplete)
        } else {
            sets.persisted_incomplete.insert(txn.id, txn);
            Ok(Residence::PersistedIncomplete)
        }
    }

    /// Stores a transaction handed over from another store and routes it.
    pub fn import(&self, txn: TransactionRecord) -> CoreResult<Residence> {
        self.check_kind(&txn)?;
        self.store.store(&txn)?;
        self.load_stored(txn)
    }

    /// Replays a prepare record. Already stored transactions win over the
    /// log.
    pub fn replay_prepare(&self, txn: TransactionRecord) -> CoreResult<()> {
        self.check_kind(&txn)?;
        let mut sets = self.sets.lock();
        if sets.persisted_incomplete.contains_key(&txn.id)
            || sets.persisted_complete.contains_key(&txn.id)
        {
            debug!(id = %txn.id, "prepare already persisted, skipping");
            return Ok(());
        }
        sets.unpersisted.insert(txn.id, txn);
        Ok(())
    }

    /// Replays a completion record and returns the transaction whose
    /// workload should be re-applied, if it can be found.
    ///
    /// `logged` is the transaction carried by the record itself, present
    /// for one-phase commits that never had a prepare record.
    pub fn replay_completion(
        &self,
        id: TransactionId,
        state: TransactionState,
        logged: Option<TransactionRecord>,
    ) -> CoreResult<Option<TransactionRecord>> {
        let mut sets = self.sets.lock();

        if let Some(mut txn) = sets.unpersisted.remove(&id) {
            txn.state = state;
            let out = txn.clone();
            if !self.fully_complete(&txn) {
                sets.unpersisted.insert(id, txn);
            }
            return Ok(Some(out));
        }

        if let Some(mut txn) = sets.persisted_incomplete.remove(&id) {
            txn.state = state;
            let done = self.fully_complete(&txn);
            self.store.update_state(id, state)?;
            if done {
                self.store.update_completion(id, true)?;
                txn.complete = true;
            }
            let out = txn.clone();
            if done {
                sets.persisted_complete.insert(id, txn);
            } else {
                sets.persisted_incomplete.insert(id, txn);
            }
            return Ok(Some(out));
        }

        if let Some(txn) = sets.persisted_complete.get(&id) {
            let mut out = txn.clone();
            out.state = state;
            return Ok(Some(out));
        }

        match logged {
            Some(mut txn) => {
                txn.state = state;
                Ok(Some(txn))
            }
            None => {
                warn!(%id, %state, kind = %self.kind, "completion for unknown transaction, not re-applied");
                Ok(None)
            }
        }
    }

    /// Drops committed transactions left in the prepared store after the
    /// recovery checkpoint, except those still waiting on participants.
    pub fn remove_committed_on_startup(&self) -> CoreResult<usize> {
        if self.kind.needs_all_participants() {
            return Ok(0);
        }
        let mut sets = self.sets.lock();
        let ids: Vec<TransactionId> = sets
            .persisted_incomplete
            .iter()
            .filter(|(_, t)| t.state == TransactionState::Committed)
            .map(|(&id, _)| id)
            .collect();
        for &id in &ids {
            if self.store.contains(id) {
                self.store.remove(id)?;
            }
            sets.persisted_incomplete.remove(&id);
        }
        if !ids.is_empty() {
            info!(kind = %self.kind, removed = ids.len(), "removed committed transactions at startup");
        }
        Ok(ids.len())
    }

    /// State of every tracked transaction.
    pub fn transaction_states(&self) -> Vec<(TransactionId, TransactionState)> {
        let sets = self.sets.lock();
        sets.unpersisted
            .values()
            .chain(sets.persisted_incomplete.values())
            .chain(sets.persisted_complete.values())
            .map(|t| (t.id, t.state))
            .collect()
    }

    /// Transactions whose outcome is not decided yet.
    pub fn incomplete_transactions(&self) -> Vec<TransactionRecord> {
        let sets = self.sets.lock();
        sets.unpersisted
            .values()
            .chain(sets.persisted_incomplete.values())
            .filter(|t| !t.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Returns a copy of a tracked transaction.
    pub fn get(&self, id: TransactionId) -> Option<TransactionRecord> {
        self.sets.lock().find(id).cloned()
    }

    /// Sizes of the (unpersisted, persisted-incomplete, persisted-complete)
    /// sets.
    pub fn set_sizes(&self) -> (usize, usize, usize) {
        let sets = self.sets.lock();
        (
            sets.unpersisted.len(),
            sets.persisted_incomplete.len(),
            sets.persisted_complete.len(),
        )
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("kind", &self.kind)
            .field("sets", &self.set_sizes())
            .field("draining", &self.draining_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Workload;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    fn setup(
        kind: TransactionKind,
    ) -> (TempDir, Arc<PreparedTransactionStore>, TransactionCoordinator) {
        let dir = tempdir().unwrap();
        let config = Config::default().drain_wait(Duration::from_millis(10));
        let store = Arc::new(PreparedTransactionStore::open(dir.path(), &config).unwrap());
        let signal = Arc::new(DrainSignal::new());
        let coordinator = TransactionCoordinator::new(kind, Arc::clone(&store), signal, &config);
        (dir, store, coordinator)
    }

    fn id(n: u64) -> TransactionId {
        TransactionId::new(n)
    }

    fn brokers() -> [BrokerAddress; 2] {
        [BrokerAddress::new("a"), BrokerAddress::new("b")]
    }

    #[test]
    fn one_phase_local_goes_straight_to_draining() {
        let (_dir, _store, c) = setup(TransactionKind::Local);
        c.on_prepare(TransactionRecord::local(id(1), Workload::new()).one_phase())
            .unwrap();
        assert_eq!(c.set_sizes(), (0, 0, 0));
        assert_eq!(c.draining_count(), 1);
        assert_eq!(c.wait_for_draining_complete(false), DrainOutcome::TimedOut);

        c.commit_applied(id(1));
        c.commit_applied(id(1));
        assert_eq!(c.wait_for_draining_complete(false), DrainOutcome::Completed);
    }

    #[test]
    fn complete_unknown_is_not_found() {
        let (_dir, _store, c) = setup(TransactionKind::Local);
        assert!(matches!(
            c.on_complete(id(3), TransactionState::Committed),
            Err(CoreError::TransactionNotFound { .. })
        ));
    }

    #[test]
    fn wrong_kind_is_refused() {
        let (_dir, _store, c) = setup(TransactionKind::Remote);
        let err = c
            .on_prepare(TransactionRecord::local(id(1), Workload::new()))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn unpersisted_local_leaves_on_completion() {
        let (_dir, store, c) = setup(TransactionKind::Local);
        c.on_prepare(TransactionRecord::local(id(1), Workload::new())).unwrap();
        c.on_complete(id(1), TransactionState::Committed).unwrap();
        assert_eq!(c.set_sizes(), (0, 0, 0));
        assert_eq!(c.draining_count(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn stored_local_is_evicted_after_checkpoint() {
        let (_dir, store, c) = setup(TransactionKind::Local);
        c.on_prepare(TransactionRecord::local(id(1), Workload::new())).unwrap();
        assert_eq!(c.flush_unpersisted_to_store().unwrap(), 1);
        assert_eq!(c.residence(id(1)), Some(Residence::PersistedIncomplete));

        c.on_complete(id(1), TransactionState::RolledBack).unwrap();
        assert_eq!(c.residence(id(1)), Some(Residence::PersistedComplete));
        assert_eq!(store.get(id(1)).unwrap().state, TransactionState::RolledBack);
        assert_eq!(c.draining_count(), 0);

        assert_eq!(c.evict_completed_after_checkpoint().unwrap(), 1);
        assert!(!store.contains(id(1)));
        assert_eq!(c.residence(id(1)), None);
    }

    #[test]
    fn flush_skips_already_stored() {
        let (_dir, store, c) = setup(TransactionKind::Local);
        let txn = TransactionRecord::local(id(7), Workload::new());
        store.store(&txn).unwrap();
        c.on_prepare(txn).unwrap();
        assert_eq!(c.flush_unpersisted_to_store().unwrap(), 0);
        assert_eq!(c.residence(id(7)), Some(Residence::PersistedIncomplete));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn cluster_waits_for_every_participant() {
        let (_dir, store, c) = setup(TransactionKind::Cluster);
        let [a, b] = brokers();
        c.on_prepare(TransactionRecord::cluster(id(2), Workload::new(), brokers()))
            .unwrap();
        c.flush_unpersisted_to_store().unwrap();
        c.on_complete(id(2), TransactionState::Committed).unwrap();
        assert_eq!(c.residence(id(2)), Some(Residence::PersistedIncomplete));

        assert!(!c
            .update_broker_state(id(2), TransactionState::Committed, &b)
            .unwrap());
        assert_eq!(c.evict_completed_after_checkpoint().unwrap(), 0);
        assert!(store.contains(id(2)));

        assert!(c
            .update_broker_state(id(2), TransactionState::Committed, &a)
            .unwrap());
        assert_eq!(c.residence(id(2)), Some(Residence::PersistedComplete));
        assert!(store.get(id(2)).unwrap().complete);

        c.evict_completed_after_checkpoint().unwrap();
        assert!(!store.contains(id(2)));
    }

    #[test]
    fn cluster_rollback_needs_no_participants() {
        let (_dir, _store, c) = setup(TransactionKind::Cluster);
        c.on_prepare(TransactionRecord::cluster(id(4), Workload::new(), brokers()))
            .unwrap();
        c.flush_unpersisted_to_store().unwrap();
        c.on_complete(id(4), TransactionState::RolledBack).unwrap();
        assert_eq!(c.residence(id(4)), Some(Residence::PersistedComplete));
    }

    #[test]
    fn broker_update_checks_state_and_membership() {
        let (_dir, _store, c) = setup(TransactionKind::Cluster);
        let [a, _] = brokers();
        c.on_prepare(TransactionRecord::cluster(id(9), Workload::new(), brokers()))
            .unwrap();
        c.flush_unpersisted_to_store().unwrap();
        c.on_complete(id(9), TransactionState::RolledBack).unwrap();

        let err = c
            .update_broker_state(id(9), TransactionState::Prepared, &a)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "state conflict on txn:9: expected PREPARED, found ROLLEDBACK"
        );

        c.on_prepare(TransactionRecord::cluster(id(10), Workload::new(), brokers()))
            .unwrap();
        let err = c
            .update_broker_state(id(10), TransactionState::Prepared, &BrokerAddress::new("zz"))
            .unwrap_err();
        assert!(matches!(err, CoreError::ParticipantNotFound { .. }));
        assert!(!c
            .update_broker_state(id(10), TransactionState::Prepared, &a)
            .unwrap());
    }

    #[test]
    fn blocking_wait_returns_after_commit_applied() {
        let (_dir, _store, c) = setup(TransactionKind::Local);
        let c = Arc::new(c);
        c.on_prepare(TransactionRecord::local(id(1), Workload::new()).one_phase())
            .unwrap();

        let applier = {
            let c = Arc::clone(&c);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                c.commit_applied(id(1));
            })
        };
        assert_eq!(c.wait_for_draining_complete(true), DrainOutcome::Completed);
        assert_eq!(c.draining_count(), 0);
        applier.join().unwrap();
    }

    #[test]
    fn replay_prefers_stored_copy() {
        let (_dir, store, c) = setup(TransactionKind::Local);
        let txn = TransactionRecord::local(id(5), Workload::new());
        store.store(&txn).unwrap();
        c.load_stored(txn.clone()).unwrap();
        c.replay_prepare(txn).unwrap();
        assert_eq!(c.set_sizes(), (0, 1, 0));

        let applied = c
            .replay_completion(id(5), TransactionState::Committed, None)
            .unwrap();
        assert_eq!(applied.map(|t| t.state), Some(TransactionState::Committed));
        assert_eq!(c.set_sizes(), (0, 0, 1));
        assert_eq!(c.draining_count(), 0);
        let stored = store.get(id(5)).unwrap();
        assert_eq!(stored.state, TransactionState::Committed);
        assert!(stored.complete);
    }

    #[test]
    fn replay_of_unknown_completion_uses_logged_copy() {
        let (_dir, _store, c) = setup(TransactionKind::Local);
        assert!(c
            .replay_completion(id(6), TransactionState::Committed, None)
            .unwrap()
            .is_none());
        let logged = TransactionRecord::local(id(6), Workload::new()).one_phase();
        assert!(c
            .replay_completion(id(6), TransactionState::Committed, Some(logged))
            .unwrap()
            .is_some());
    }

    #[test]
    fn startup_cleanup_spares_waiting_cluster_transactions() {
        let (_dir, store, local) = setup(TransactionKind::Local);
        let mut committed = TransactionRecord::local(id(1), Workload::new());
        committed.state = TransactionState::Committed;
        store.store(&committed).unwrap();
        // Stored without the completion flag, as after an interrupted update.
        local
            .sets
            .lock()
            .persisted_incomplete
            .insert(id(1), committed);
        assert_eq!(local.remove_committed_on_startup().unwrap(), 1);
        assert!(!store.contains(id(1)));

        let cluster = TransactionCoordinator::new(
            TransactionKind::Cluster,
            Arc::clone(&store),
            Arc::new(DrainSignal::new()),
            &Config::default(),
        );
        let mut waiting = TransactionRecord::cluster(id(2), Workload::new(), brokers());
        waiting.state = TransactionState::Committed;
        cluster.import(waiting).unwrap();
        assert_eq!(cluster.remove_committed_on_startup().unwrap(), 0);
        assert!(store.contains(id(2)));
    }

    #[test]
    fn reserved_id_refuses_a_second_claim() {
        let (_dir, _store, c) = setup(TransactionKind::Local);
        c.reserve(id(1)).unwrap();
        assert!(matches!(
            c.reserve(id(1)),
            Err(CoreError::TransactionExists { .. })
        ));

        c.release(id(1));
        c.reserve(id(1)).unwrap();
        c.on_prepare(TransactionRecord::local(id(1), Workload::new())).unwrap();
        assert!(matches!(
            c.reserve(id(1)),
            Err(CoreError::TransactionExists { .. })
        ));
        assert!(c.sets.lock().reserved.is_empty());

        c.reserve(id(2)).unwrap();
        c.on_prepare(TransactionRecord::local(id(2), Workload::new()).one_phase())
            .unwrap();
        assert!(c.sets.lock().reserved.is_empty());
        assert_eq!(c.draining_count(), 1);
    }

    #[test]
    fn shut_down_releases_a_blocking_drain_wait() {
        let dir = tempdir().unwrap();
        let config = Config::default().drain_wait(Duration::from_millis(5));
        let store = Arc::new(PreparedTransactionStore::open(dir.path(), &config).unwrap());
        let signal = Arc::new(DrainSignal::new());
        let c = Arc::new(TransactionCoordinator::new(
            TransactionKind::Local,
            store,
            Arc::clone(&signal),
            &config,
        ));
        c.on_prepare(TransactionRecord::local(id(1), Workload::new()).one_phase())
            .unwrap();

        let waiter = {
            let c = Arc::clone(&c);
            thread::spawn(move || c.wait_for_draining_complete(true))
        };
        thread::sleep(Duration::from_millis(20));
        signal.shut_down();
        assert_eq!(waiter.join().unwrap(), DrainOutcome::TimedOut);
        assert_eq!(c.draining_count(), 1);
    }

    #[test]
    fn drain_signal_wakes_waiter() {
        let signal = Arc::new(DrainSignal::new());
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        let notifier = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.notify())
        };
        notifier.join().unwrap();
        assert!(signal.wait_timeout(Duration::from_millis(5)));
        signal.reset();
        assert!(!signal.wait_timeout(Duration::from_millis(1)));
    }
}
