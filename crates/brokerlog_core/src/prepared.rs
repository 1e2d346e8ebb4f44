//! Keyed store of transactions that must outlive a log truncation.
//!
//! Each transaction is a CBOR-encoded [`TransactionRecord`] in the record
//! store. The record's client data mirrors the state and completion flag so
//! that the common updates can be made with one small in-place write:
//!
//! ```text
//! client data: | 0xC1 | state | complete | generation (u32 LE) | reserved |
//! ```
//!
//! When client data is valid it wins over the serialized fields on load.
//! The generation goes up with every update, so when an interrupted
//! rewrite leaves two copies of a transaction the later one is kept.

use crate::codec::{decode, encode, RECORD_FORMAT_VERSION};
use crate::config::Config;
use crate::error::{CoreError, CoreResult, CorruptionWarning};
use crate::record::{ClientData, RecordHandle, RecordStore};
use crate::transaction::{TransactionKind, TransactionRecord, TransactionState};
use crate::types::TransactionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

const CLIENT_MARKER: u8 = 0xC1;

fn client_data(state: TransactionState, complete: bool, generation: u32) -> ClientData {
    let mut client = ClientData::default();
    let bytes = client.as_mut_bytes();
    bytes[0] = CLIENT_MARKER;
    bytes[1] = state.as_byte();
    bytes[2] = u8::from(complete);
    bytes[3..7].copy_from_slice(&generation.to_le_bytes());
    client
}

fn parse_client_data(client: &ClientData) -> Option<(TransactionState, bool, u32)> {
    let bytes = client.as_bytes();
    if bytes[0] != CLIENT_MARKER {
        return None;
    }
    let state = TransactionState::from_byte(bytes[1])?;
    let generation = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
    Some((state, bytes[2] != 0, generation))
}

/// Applies a state/completion change to a stored transaction.
///
/// Implementations return the handle the record lives at afterwards.
pub trait RecordUpdater: Send + Sync {
    /// Persists `state`, `complete` and the record's new `generation` for
    /// the record at `handle`.
    fn update(
        &self,
        records: &mut RecordStore,
        handle: RecordHandle,
        state: TransactionState,
        complete: bool,
        generation: u32,
    ) -> CoreResult<RecordHandle>;
}

/// Rewrites only the client data of the record.
#[derive(Debug, Default, Clone, Copy)]
pub struct InPlaceUpdate;

impl RecordUpdater for InPlaceUpdate {
    fn update(
        &self,
        records: &mut RecordStore,
        handle: RecordHandle,
        state: TransactionState,
        complete: bool,
        generation: u32,
    ) -> CoreResult<RecordHandle> {
        records.update_client_data(handle, client_data(state, complete, generation))?;
        Ok(handle)
    }
}

/// Writes a fresh copy of the whole record, then frees the old one.
#[derive(Debug, Default, Clone, Copy)]
pub struct RewriteUpdate;

impl RecordUpdater for RewriteUpdate {
    fn update(
        &self,
        records: &mut RecordStore,
        handle: RecordHandle,
        state: TransactionState,
        complete: bool,
        generation: u32,
    ) -> CoreResult<RecordHandle> {
        let stored = records.read(handle)?;
        let mut txn: TransactionRecord = decode(&stored.data)?;
        txn.state = state;
        txn.complete = complete;
        rewrite(records, handle, &txn, generation)
    }
}

fn rewrite(
    records: &mut RecordStore,
    old: RecordHandle,
    txn: &TransactionRecord,
    generation: u32,
) -> CoreResult<RecordHandle> {
    let data = encode(txn)?;
    let handle = records.insert(&data, client_data(txn.state, txn.complete, generation))?;
    records.free(old)?;
    Ok(handle)
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    handle: RecordHandle,
    state: TransactionState,
    complete: bool,
    generation: u32,
    kind: TransactionKind,
}

impl Entry {
    fn from_stored(handle: RecordHandle, client: &ClientData, txn: &TransactionRecord) -> Self {
        let (state, complete, generation) =
            parse_client_data(client).unwrap_or((txn.state, txn.complete, 0));
        Self {
            handle,
            state,
            complete,
            generation,
            kind: txn.kind(),
        }
    }

    /// Orders two copies of one transaction. Records written before
    /// generations were kept all read as zero and fall back to progress.
    fn recency(&self) -> (u32, u8, bool) {
        (self.generation, self.state.as_byte(), self.complete)
    }
}

struct Inner {
    records: RecordStore,
    index: HashMap<TransactionId, Entry>,
    warnings: Vec<CorruptionWarning>,
}

/// Result of loading the store at startup.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Every stored transaction, state and completion applied.
    pub transactions: Vec<TransactionRecord>,
    /// Records that were damaged and have been freed.
    pub warnings: Vec<CorruptionWarning>,
}

/// Persistent map from transaction id to transaction record.
pub struct PreparedTransactionStore {
    inner: Mutex<Inner>,
    updater: Box<dyn RecordUpdater>,
}

impl PreparedTransactionStore {
    /// Opens the store in `dir` and indexes every record.
    ///
    /// Damaged records are freed; their warnings are returned by the first
    /// [`load`](Self::load).
    pub fn open(dir: &Path, config: &Config) -> CoreResult<Self> {
        let updater: Box<dyn RecordUpdater> = if config.in_place_updates {
            Box::new(InPlaceUpdate)
        } else {
            Box::new(RewriteUpdate)
        };
        Self::open_with_updater(dir, config, updater)
    }

    /// Opens the store with an explicit update strategy.
    pub fn open_with_updater(
        dir: &Path,
        config: &Config,
        updater: Box<dyn RecordUpdater>,
    ) -> CoreResult<Self> {
        let (mut records, mut warnings) =
            RecordStore::open(dir, &config.record_store, RECORD_FORMAT_VERSION)?;

        let mut index: HashMap<TransactionId, Entry> = HashMap::new();
        for stored in records.iterate()? {
            let txn = match decode::<TransactionRecord>(&stored.data) {
                Ok(txn) => txn,
                Err(e) => {
                    let warning = CorruptionWarning::new(
                        format!("prepared store {}", stored.handle),
                        format!("undecodable transaction record: {e}"),
                    );
                    warn!(%warning, "freed corrupt prepared-store record, its data is lost");
                    records.free(stored.handle)?;
                    warnings.push(warning);
                    continue;
                }
            };
            let entry = Entry::from_stored(stored.handle, &stored.client, &txn);

            // Two copies of one id mean a rewrite was interrupted between
            // writing the new copy and freeing the old one.
            match index.get(&txn.id).copied() {
                Some(existing) if existing.recency() >= entry.recency() => {
                    info!(id = %txn.id, handle = %stored.handle, "dropping stale duplicate record");
                    records.free(stored.handle)?;
                }
                Some(existing) => {
                    info!(id = %txn.id, handle = %existing.handle, "dropping stale duplicate record");
                    records.free(existing.handle)?;
                    index.insert(txn.id, entry);
                }
                None => {
                    index.insert(txn.id, entry);
                }
            }
        }

        debug!(dir = %dir.display(), transactions = index.len(), "prepared store opened");
        Ok(Self {
            inner: Mutex::new(Inner {
                records,
                index,
                warnings,
            }),
            updater,
        })
    }

    /// Stores a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionExists`] if the id is already stored.
    pub fn store(&self, txn: &TransactionRecord) -> CoreResult<TransactionId> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&txn.id) {
            return Err(CoreError::TransactionExists { id: txn.id });
        }
        let data = encode(txn)?;
        let handle = inner
            .records
            .insert(&data, client_data(txn.state, txn.complete, 0))?;
        inner.index.insert(
            txn.id,
            Entry {
                handle,
                state: txn.state,
                complete: txn.complete,
                generation: 0,
                kind: txn.kind(),
            },
        );
        Ok(txn.id)
    }

    /// Removes a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotFound`] if the id is not stored.
    pub fn remove(&self, id: TransactionId) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .index
            .remove(&id)
            .ok_or(CoreError::TransactionNotFound { id })?;
        inner.records.free(entry.handle)
    }

    /// Returns true if the id is stored.
    pub fn contains(&self, id: TransactionId) -> bool {
        self.inner.lock().index.contains_key(&id)
    }

    /// Reads a stored transaction.
    pub fn get(&self, id: TransactionId) -> CoreResult<TransactionRecord> {
        let inner = self.inner.lock();
        let entry = *inner
            .index
            .get(&id)
            .ok_or(CoreError::TransactionNotFound { id })?;
        read_entry(&inner.records, &entry)
    }

    /// Returns the kind of a stored transaction.
    pub fn kind_of(&self, id: TransactionId) -> Option<TransactionKind> {
        self.inner.lock().index.get(&id).map(|e| e.kind)
    }

    /// Persists a new state.
    pub fn update_state(&self, id: TransactionId, state: TransactionState) -> CoreResult<()> {
        self.update(id, |entry| entry.state = state)
    }

    /// Persists the completion flag.
    pub fn update_completion(&self, id: TransactionId, complete: bool) -> CoreResult<()> {
        self.update(id, |entry| entry.complete = complete)
    }

    fn update(&self, id: TransactionId, change: impl FnOnce(&mut Entry)) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let mut entry = *inner
            .index
            .get(&id)
            .ok_or(CoreError::TransactionNotFound { id })?;
        change(&mut entry);
        entry.generation = entry.generation.wrapping_add(1);
        entry.handle = self.updater.update(
            &mut inner.records,
            entry.handle,
            entry.state,
            entry.complete,
            entry.generation,
        )?;
        inner.index.insert(id, entry);
        Ok(())
    }

    /// Rewrites a stored transaction in full.
    ///
    /// Used for changes the client data cannot carry, such as participant
    /// completion flags.
    pub fn replace(&self, txn: &TransactionRecord) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let entry = *inner
            .index
            .get(&txn.id)
            .ok_or(CoreError::TransactionNotFound { id: txn.id })?;
        let generation = entry.generation.wrapping_add(1);
        let handle = rewrite(&mut inner.records, entry.handle, txn, generation)?;
        inner.index.insert(
            txn.id,
            Entry {
                handle,
                state: txn.state,
                complete: txn.complete,
                generation,
                kind: txn.kind(),
            },
        );
        Ok(())
    }

    /// Reads every stored transaction, ordered by id.
    ///
    /// Also hands over the corruption warnings found when the store was
    /// opened.
    pub fn load(&self) -> CoreResult<LoadReport> {
        let mut inner = self.inner.lock();
        let mut transactions = inner
            .index
            .values()
            .map(|e| read_entry(&inner.records, e))
            .collect::<CoreResult<Vec<_>>>()?;
        transactions.sort_by_key(|t| t.id);
        Ok(LoadReport {
            transactions,
            warnings: std::mem::take(&mut inner.warnings),
        })
    }

    /// Ids currently stored.
    pub fn ids(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self.inner.lock().index.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Syncs the store to disk.
    pub fn sync(&self) -> CoreResult<()> {
        self.inner.lock().records.sync()
    }

    /// Compacts the region file and rebuilds the index. Returns the bytes
    /// reclaimed.
    pub fn compact(&self) -> CoreResult<u64> {
        let mut inner = self.inner.lock();
        let reclaimed = inner.records.compact()?;
        let mut index = HashMap::with_capacity(inner.index.len());
        for stored in inner.records.iterate()? {
            let txn: TransactionRecord = decode(&stored.data)?;
            index.insert(
                txn.id,
                Entry::from_stored(stored.handle, &stored.client, &txn),
            );
        }
        inner.index = index;
        Ok(reclaimed)
    }

    /// Number of stored transactions.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes the store occupies on disk.
    pub fn byte_count(&self) -> CoreResult<u64> {
        self.inner.lock().records.byte_count()
    }

    /// Removes every transaction.
    pub fn clear(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.records.clear()?;
        inner.index.clear();
        Ok(())
    }
}

fn read_entry(records: &RecordStore, entry: &Entry) -> CoreResult<TransactionRecord> {
    let stored = records.read(entry.handle)?;
    let mut txn: TransactionRecord = decode(&stored.data)?;
    txn.state = entry.state;
    txn.complete = entry.complete;
    Ok(txn)
}

impl std::fmt::Debug for PreparedTransactionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedTransactionStore")
            .field("transactions", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordStoreConfig;
    use crate::transaction::Workload;
    use crate::types::BrokerAddress;
    use tempfile::tempdir;

    fn local(id: u64) -> TransactionRecord {
        TransactionRecord::local(TransactionId::new(id), Workload::new())
    }

    fn configs() -> [Config; 2] {
        [Config::default(), Config::default().in_place_updates(false)]
    }

    #[test]
    fn store_rejects_duplicates() {
        let dir = tempdir().unwrap();
        let store = PreparedTransactionStore::open(dir.path(), &Config::default()).unwrap();
        store.store(&local(1)).unwrap();
        assert!(matches!(
            store.store(&local(1)),
            Err(CoreError::TransactionExists { .. })
        ));
    }

    #[test]
    fn remove_unknown_is_not_found() {
        let dir = tempdir().unwrap();
        let store = PreparedTransactionStore::open(dir.path(), &Config::default()).unwrap();
        assert!(matches!(
            store.remove(TransactionId::new(4)),
            Err(CoreError::TransactionNotFound { .. })
        ));
    }

    #[test]
    fn updates_survive_reopen_with_either_updater() {
        for config in configs() {
            let dir = tempdir().unwrap();
            {
                let store = PreparedTransactionStore::open(dir.path(), &config).unwrap();
                store.store(&local(1)).unwrap();
                store.store(&local(2)).unwrap();
                store
                    .update_state(TransactionId::new(1), TransactionState::Committed)
                    .unwrap();
                store.update_completion(TransactionId::new(1), true).unwrap();
                store.remove(TransactionId::new(2)).unwrap();
            }
            let store = PreparedTransactionStore::open(dir.path(), &config).unwrap();
            let report = store.load().unwrap();
            assert!(report.warnings.is_empty());
            assert_eq!(report.transactions.len(), 1);
            assert_eq!(report.transactions[0].state, TransactionState::Committed);
            assert!(report.transactions[0].complete);
        }
    }

    #[test]
    fn replace_persists_participants() {
        let dir = tempdir().unwrap();
        let a = BrokerAddress::new("a");
        let mut txn = TransactionRecord::cluster(
            TransactionId::new(5),
            Workload::new(),
            [a.clone(), BrokerAddress::new("b")],
        );
        {
            let store = PreparedTransactionStore::open(dir.path(), &Config::default()).unwrap();
            store.store(&txn).unwrap();
            txn.complete_participant(&a);
            store.replace(&txn).unwrap();
        }
        let store = PreparedTransactionStore::open(dir.path(), &Config::default()).unwrap();
        let back = store.get(TransactionId::new(5)).unwrap();
        assert!(back.participants()[0].completed);
        assert!(!back.participants()[1].completed);
    }

    #[test]
    fn undecodable_record_is_freed_and_reported() {
        let dir = tempdir().unwrap();
        {
            let store = PreparedTransactionStore::open(dir.path(), &Config::default()).unwrap();
            store.store(&local(1)).unwrap();
            let mut inner = store.inner.lock();
            inner
                .records
                .insert(&[0xff, 0xfe, 0xfd], ClientData::default())
                .unwrap();
        }
        let store = PreparedTransactionStore::open(dir.path(), &Config::default()).unwrap();
        let report = store.load().unwrap();
        assert_eq!(report.transactions.len(), 1);
        assert_eq!(report.warnings.len(), 1);
        // Warnings are handed over once.
        assert!(store.load().unwrap().warnings.is_empty());
    }

    #[test]
    fn interrupted_rewrite_keeps_the_newer_copy() {
        let dir = tempdir().unwrap();
        {
            let store = PreparedTransactionStore::open(dir.path(), &Config::default()).unwrap();
            store.store(&local(3)).unwrap();
            let mut committed = local(3);
            committed.state = TransactionState::Committed;
            let mut inner = store.inner.lock();
            let data = encode(&committed).unwrap();
            inner
                .records
                .insert(&data, client_data(committed.state, false, 1))
                .unwrap();
        }
        let store = PreparedTransactionStore::open(dir.path(), &Config::default()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(TransactionId::new(3)).unwrap().state,
            TransactionState::Committed
        );
    }

    #[test]
    fn interrupted_participant_rewrite_keeps_the_newer_copy() {
        let dir = tempdir().unwrap();
        let a = BrokerAddress::new("a");
        let mut txn = TransactionRecord::cluster(
            TransactionId::new(5),
            Workload::new(),
            [a.clone(), BrokerAddress::new("b")],
        );
        txn.state = TransactionState::Committed;
        {
            let store = PreparedTransactionStore::open(dir.path(), &Config::default()).unwrap();
            store.store(&txn).unwrap();
            // Same state and completion flag, only a participant differs:
            // the new copy is written, the old one never freed.
            txn.complete_participant(&a);
            let mut inner = store.inner.lock();
            let data = encode(&txn).unwrap();
            inner
                .records
                .insert(&data, client_data(txn.state, false, 1))
                .unwrap();
        }
        let store = PreparedTransactionStore::open(dir.path(), &Config::default()).unwrap();
        assert_eq!(store.len(), 1);
        let back = store.get(TransactionId::new(5)).unwrap();
        assert!(back.participants()[0].completed);
        assert!(!back.participants()[1].completed);

        // A later update still outranks the surviving copy.
        store.replace(&back).unwrap();
        drop(store);
        let store = PreparedTransactionStore::open(dir.path(), &Config::default()).unwrap();
        assert!(store.get(TransactionId::new(5)).unwrap().participants()[0].completed);
    }

    #[test]
    fn compact_keeps_every_transaction() {
        let dir = tempdir().unwrap();
        let config = Config::default().record_store(RecordStoreConfig::default().region_growth(1024));
        let store = PreparedTransactionStore::open(dir.path(), &config).unwrap();
        for id in 1..=10 {
            store.store(&local(id)).unwrap();
        }
        for id in (1..=10).step_by(2) {
            store.remove(TransactionId::new(id)).unwrap();
        }
        store.compact().unwrap();
        assert_eq!(
            store.ids(),
            [2, 4, 6, 8, 10].map(TransactionId::new).to_vec()
        );
        store
            .update_state(TransactionId::new(4), TransactionState::RolledBack)
            .unwrap();
        assert_eq!(
            store.get(TransactionId::new(4)).unwrap().state,
            TransactionState::RolledBack
        );
    }

    #[test]
    fn clear_empties_the_store() {
        let dir = tempdir().unwrap();
        let store = PreparedTransactionStore::open(dir.path(), &Config::default()).unwrap();
        store.store(&local(1)).unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());
        assert!(store.byte_count().unwrap() > 0);
    }
}
