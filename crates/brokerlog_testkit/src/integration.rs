//! Drives generated workloads against a manager and a model.
//!
//! [`OpDriver`] runs [`BrokerOp`]s the way a broker does: log first, then
//! apply to the message store. Every step that logged successfully is
//! also applied to a model store, so after a crash and recovery the real
//! store must equal the model.

use crate::fixtures::{apply_ack, apply_send, apply_workload};
use crate::generators::{BrokerOp, Target};
use brokerlog_core::broker::MessageStoreSnapshot;
use brokerlog_core::{
    ConsumerId, CoreResult, DestinationId, InMemoryMessageStore, MessageAck, MessageId,
    MessageStore, SentMessage, TransactionId, TransactionKind, TransactionRecord,
    TransactionState, TxnLogManager, Workload,
};

/// Runs broker workloads and tracks what recovery must restore.
#[derive(Debug, Default)]
pub struct OpDriver {
    model: InMemoryMessageStore,
    pending: Vec<(TransactionId, Workload)>,
    stored: Vec<MessageAck>,
    next_message: u64,
    next_txn: u64,
}

impl OpDriver {
    /// Creates a driver with an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `ops` until one fails. Returns how many completed.
    pub fn run(
        &mut self,
        manager: &TxnLogManager,
        messages: &InMemoryMessageStore,
        ops: &[BrokerOp],
    ) -> usize {
        ops.iter()
            .take_while(|op| self.step(manager, messages, op).is_ok())
            .count()
    }

    /// Runs one step. Nothing is applied if logging fails.
    pub fn step(
        &mut self,
        manager: &TxnLogManager,
        messages: &InMemoryMessageStore,
        op: &BrokerOp,
    ) -> CoreResult<()> {
        match op {
            BrokerOp::OnePhaseSend(target) => {
                let message = self.new_message(target);
                let id = self.new_txn();
                let workload = Workload::new().send(message);
                let txn = TransactionRecord::local(id, workload.clone()).one_phase();
                manager.log_transaction(txn)?;
                self.commit(messages, &workload)?;
                manager.commit_applied(id);
            }
            BrokerOp::Prepare { target, ack } => {
                let mut workload = Workload::new().send(self.new_message(target));
                if let Some(ack) = ack.and_then(|pick| self.pick_stored(pick)) {
                    workload = workload.ack(ack);
                }
                let id = self.new_txn();
                manager.log_transaction(TransactionRecord::local(id, workload.clone()))?;
                self.pending.push((id, workload));
            }
            BrokerOp::Resolve { pick, commit } => {
                if self.pending.is_empty() {
                    return Ok(());
                }
                let index = pick % self.pending.len();
                let id = self.pending[index].0;
                let state = if *commit {
                    TransactionState::Committed
                } else {
                    TransactionState::RolledBack
                };
                manager.log_completion(TransactionKind::Local, id, state)?;
                let (_, workload) = self.pending.remove(index);
                if *commit {
                    self.commit(messages, &workload)?;
                    manager.commit_applied(id);
                }
            }
            BrokerOp::NonTransactedSend(target) => {
                let message = self.new_message(target);
                manager.log_non_transacted_send(&message)?;
                self.send(messages, &message)?;
            }
            BrokerOp::Ack { pick } => {
                let Some(ack) = self.pick_stored(*pick) else {
                    return Ok(());
                };
                manager.log_non_transacted_ack(&ack, false)?;
                apply_ack(messages, &ack)?;
                apply_ack(&self.model, &ack)?;
            }
            BrokerOp::Remove { pick } => {
                if self.stored.is_empty() {
                    return Ok(());
                }
                let index = pick % self.stored.len();
                let MessageAck {
                    destination,
                    message_id,
                    ..
                } = self.stored[index].clone();
                let logged = manager.prepare_message_removal(&destination, message_id)?;
                self.stored.remove(index);
                for store in [messages, &self.model] {
                    if store.contains_message(&destination, message_id)? {
                        store.remove_message(&destination, message_id)?;
                    }
                }
                if logged.is_some() {
                    manager.message_removed(&destination, message_id);
                } else {
                    // Nothing in the log covers this removal.
                    messages.force_to_disk()?;
                }
            }
            BrokerOp::Checkpoint => {
                manager.checkpoint()?;
            }
        }
        Ok(())
    }

    /// What the message store must hold.
    pub fn expected(&self) -> MessageStoreSnapshot {
        self.model.snapshot()
    }

    /// Prepared transactions still awaiting an outcome, in id order.
    pub fn pending_ids(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self.pending.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids
    }

    /// Asserts that `messages` and `manager` match the model.
    pub fn assert_recovered(&self, manager: &TxnLogManager, messages: &InMemoryMessageStore) {
        assert_eq!(messages.snapshot(), self.expected(), "message store diverged");
        let incomplete: Vec<_> = manager
            .incomplete_transactions(TransactionKind::Local)
            .into_iter()
            .map(|txn| txn.id)
            .collect();
        assert_eq!(incomplete, self.pending_ids(), "prepared transactions diverged");
    }

    fn new_message(&mut self, target: &Target) -> SentMessage {
        self.next_message += 1;
        target.message(self.next_message)
    }

    fn new_txn(&mut self) -> TransactionId {
        self.next_txn += 1;
        TransactionId::new(self.next_txn)
    }

    fn pick_stored(&self, pick: usize) -> Option<MessageAck> {
        if self.stored.is_empty() {
            return None;
        }
        Some(self.stored[pick % self.stored.len()].clone())
    }

    fn commit(&mut self, messages: &InMemoryMessageStore, workload: &Workload) -> CoreResult<()> {
        apply_workload(messages, workload)?;
        apply_workload(&self.model, workload)?;
        self.track(workload.sent.iter());
        Ok(())
    }

    fn send(&mut self, messages: &InMemoryMessageStore, message: &SentMessage) -> CoreResult<()> {
        apply_send(messages, message)?;
        apply_send(&self.model, message)?;
        self.track(std::iter::once(message));
        Ok(())
    }

    fn track<'m>(&mut self, sent: impl Iterator<Item = &'m SentMessage>) {
        for message in sent {
            let consumer = message.interests.first().copied().unwrap_or(ConsumerId::QUEUE);
            self.stored.push(MessageAck::new(
                message.destination.clone(),
                message.message_id,
                consumer,
            ));
        }
    }
}

/// Destinations and message ids a workload stored, for quick assertions.
pub fn stored_ids(snapshot: &MessageStoreSnapshot, destination: &DestinationId) -> Vec<MessageId> {
    snapshot
        .get(&destination.to_string())
        .map(|messages| messages.keys().copied().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestBroker;

    #[test]
    fn driver_mirrors_a_clean_run() {
        let broker = TestBroker::new();
        let manager = broker.open().unwrap();
        let mut driver = OpDriver::new();
        let ops = vec![
            BrokerOp::OnePhaseSend(Target::Queue(0)),
            BrokerOp::Prepare {
                target: Target::Topic(1, vec![1, 2]),
                ack: Some(0),
            },
            BrokerOp::NonTransactedSend(Target::Queue(1)),
            BrokerOp::Resolve {
                pick: 0,
                commit: true,
            },
            BrokerOp::Remove { pick: 1 },
            BrokerOp::Checkpoint,
        ];
        assert_eq!(driver.run(&manager, &broker.messages, &ops), ops.len());
        driver.assert_recovered(&manager, &broker.messages);
        assert_eq!(
            stored_ids(&driver.expected(), &DestinationId::queue("queue-0")),
            vec![MessageId::new(1)]
        );
    }

    #[test]
    fn rolled_back_transaction_leaves_nothing() {
        let broker = TestBroker::new();
        let manager = broker.open().unwrap();
        let mut driver = OpDriver::new();
        let ops = [
            BrokerOp::Prepare {
                target: Target::Queue(2),
                ack: None,
            },
            BrokerOp::Resolve {
                pick: 7,
                commit: false,
            },
        ];
        driver.run(&manager, &broker.messages, &ops);
        assert!(driver.expected().is_empty());
        assert!(driver.pending_ids().is_empty());
        driver.assert_recovered(&manager, &broker.messages);
    }
}
