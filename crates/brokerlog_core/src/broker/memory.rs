//! An in-memory message store and destination directory.
//!
//! Used by tests and by offline tools that replay a log without a live
//! broker. Counters record every mutation so tests can assert how often
//! a message was stored or re-routed. `force_to_disk` keeps a copy of the
//! contents, which [`InMemoryMessageStore::durable_copy`] hands back as the
//! store a restarted broker would find.

use crate::broker::{DestinationDirectory, InterestState, MessageStore};
use crate::error::{CoreError, CoreResult};
use crate::transaction::SentMessage;
use crate::types::{ConsumerId, DestinationId, DestinationType, MessageId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Contents of an [`InMemoryMessageStore`] keyed by destination then message.
pub type MessageStoreSnapshot =
    BTreeMap<String, BTreeMap<MessageId, Vec<(ConsumerId, InterestState)>>>;

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    interests: BTreeMap<ConsumerId, InterestState>,
}

#[derive(Debug, Default, Clone)]
struct Contents {
    destinations: HashSet<DestinationId>,
    messages: HashMap<DestinationId, BTreeMap<MessageId, StoredMessage>>,
}

/// A message store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    contents: RwLock<Contents>,
    forced: RwLock<Contents>,
    stores: AtomicU64,
    removals: AtomicU64,
    forces: AtomicU64,
    loads: AtomicU64,
}

impl InMemoryMessageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `store_message` calls that succeeded.
    pub fn store_count(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }

    /// Number of `remove_message` calls that succeeded.
    pub fn removal_count(&self) -> u64 {
        self.removals.load(Ordering::Relaxed)
    }

    /// Number of `force_to_disk` calls.
    pub fn force_count(&self) -> u64 {
        self.forces.load(Ordering::Relaxed)
    }

    /// Number of `load_destination` calls.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Returns true if the destination exists.
    pub fn has_destination(&self, destination: &DestinationId) -> bool {
        self.contents.read().destinations.contains(destination)
    }

    /// Returns the stored payload of a message.
    pub fn payload(&self, destination: &DestinationId, message_id: MessageId) -> Option<Vec<u8>> {
        self.contents
            .read()
            .messages
            .get(destination)
            .and_then(|m| m.get(&message_id))
            .map(|m| m.payload.clone())
    }

    /// Returns the ids of every message in a destination, in id order.
    pub fn message_ids(&self, destination: &DestinationId) -> Vec<MessageId> {
        self.contents
            .read()
            .messages
            .get(destination)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// A new store holding only what the last `force_to_disk` saw.
    pub fn durable_copy(&self) -> Self {
        let forced = self.forced.read().clone();
        Self {
            contents: RwLock::new(forced.clone()),
            forced: RwLock::new(forced),
            ..Self::default()
        }
    }

    /// Copies the store's contents for comparison.
    pub fn snapshot(&self) -> MessageStoreSnapshot {
        let contents = self.contents.read();
        let mut out = MessageStoreSnapshot::new();
        for (dest, messages) in &contents.messages {
            if messages.is_empty() {
                continue;
            }
            let entry = out.entry(dest.to_string()).or_default();
            for (id, msg) in messages {
                entry.insert(*id, msg.interests.iter().map(|(c, s)| (*c, *s)).collect());
            }
        }
        out
    }

    fn missing(destination: &DestinationId, message_id: MessageId) -> CoreError {
        CoreError::invalid_operation(format!("{message_id} is not stored in {destination}"))
    }
}

impl MessageStore for InMemoryMessageStore {
    fn store_message(&self, destination: &DestinationId, message: &SentMessage) -> CoreResult<()> {
        let mut contents = self.contents.write();
        if !contents.destinations.contains(destination) {
            return Err(CoreError::invalid_operation(format!(
                "destination {destination} does not exist"
            )));
        }
        let messages = contents.messages.entry(destination.clone()).or_default();
        if messages.contains_key(&message.message_id) {
            return Err(CoreError::invalid_operation(format!(
                "{} is already stored in {destination}",
                message.message_id
            )));
        }
        let interests = message
            .interests
            .iter()
            .map(|c| (*c, InterestState::Routed))
            .collect();
        messages.insert(
            message.message_id,
            StoredMessage {
                payload: message.payload.clone(),
                interests,
            },
        );
        self.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remove_message(&self, destination: &DestinationId, message_id: MessageId) -> CoreResult<()> {
        let mut contents = self.contents.write();
        contents
            .messages
            .get_mut(destination)
            .and_then(|m| m.remove(&message_id))
            .ok_or_else(|| Self::missing(destination, message_id))?;
        self.removals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn contains_message(
        &self,
        destination: &DestinationId,
        message_id: MessageId,
    ) -> CoreResult<bool> {
        Ok(self
            .contents
            .read()
            .messages
            .get(destination)
            .is_some_and(|m| m.contains_key(&message_id)))
    }

    fn update_interest_state(
        &self,
        destination: &DestinationId,
        message_id: MessageId,
        consumer: ConsumerId,
        state: InterestState,
    ) -> CoreResult<()> {
        let mut contents = self.contents.write();
        let msg = contents
            .messages
            .get_mut(destination)
            .and_then(|m| m.get_mut(&message_id))
            .ok_or_else(|| Self::missing(destination, message_id))?;
        let slot = msg.interests.get_mut(&consumer).ok_or_else(|| {
            CoreError::invalid_operation(format!("{message_id} is not routed to {consumer}"))
        })?;
        *slot = state;
        Ok(())
    }

    fn interest_states(
        &self,
        destination: &DestinationId,
        message_id: MessageId,
    ) -> CoreResult<HashMap<ConsumerId, InterestState>> {
        let contents = self.contents.read();
        let msg = contents
            .messages
            .get(destination)
            .and_then(|m| m.get(&message_id))
            .ok_or_else(|| Self::missing(destination, message_id))?;
        Ok(msg.interests.iter().map(|(c, s)| (*c, *s)).collect())
    }

    fn force_to_disk(&self) -> CoreResult<()> {
        let image = self.contents.read().clone();
        *self.forced.write() = image;
        self.forces.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl DestinationDirectory for InMemoryMessageStore {
    fn get_or_create_destination(
        &self,
        name: &str,
        kind: DestinationType,
    ) -> CoreResult<DestinationId> {
        let id = DestinationId {
            name: name.to_string(),
            kind,
        };
        self.contents.write().destinations.insert(id.clone());
        Ok(id)
    }

    fn load_destination(&self, destination: &DestinationId) -> CoreResult<()> {
        if !self.has_destination(destination) {
            return Err(CoreError::invalid_operation(format!(
                "destination {destination} does not exist"
            )));
        }
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
