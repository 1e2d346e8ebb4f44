//! Property tests: crash recovery converges, cluster transactions wait for
//! every participant.

use brokerlog_core::{
    BrokerAddress, Residence, TransactionId, TransactionKind, TransactionRecord, TransactionState,
    Workload,
};
use brokerlog_testkit::prelude::*;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn recovery_converges_after_crash_at_any_byte(
        ops in broker_ops_strategy(24),
        budget in 0u64..3000,
    ) {
        let mut broker = TestBroker::new();
        let manager = broker.open().unwrap();
        broker.log.crash_after(budget);

        let mut driver = OpDriver::new();
        driver.run(&manager, &broker.messages, &ops);

        let manager = broker.restart(manager).unwrap();
        driver.assert_recovered(&manager, &broker.messages);

        let manager = broker.restart(manager).unwrap();
        prop_assert!(manager.recovery_report().warnings.is_empty());
        driver.assert_recovered(&manager, &broker.messages);
    }

    #[test]
    fn uninterrupted_run_matches_model(ops in broker_ops_strategy(32)) {
        let mut broker = TestBroker::new();
        let manager = broker.open().unwrap();
        let mut driver = OpDriver::new();
        prop_assert_eq!(driver.run(&manager, &broker.messages, &ops), ops.len());
        driver.assert_recovered(&manager, &broker.messages);

        let manager = broker.restart(manager).unwrap();
        driver.assert_recovered(&manager, &broker.messages);
    }

    #[test]
    fn cluster_waits_for_every_participant(
        order in (2usize..6).prop_flat_map(arrival_order_strategy),
        restart_after in 0usize..6,
    ) {
        let mut broker = TestBroker::new();
        let mut manager = broker.open().unwrap();
        let id = TransactionId::new(1);
        let participants: Vec<BrokerAddress> = (0..order.len())
            .map(|i| BrokerAddress::new(format!("broker-{i}")))
            .collect();
        let workload = Workload::new().send(topic_message("t", 1, &[1]));

        manager
            .log_transaction(TransactionRecord::cluster(id, workload.clone(), participants.clone()))
            .unwrap();
        manager
            .log_completion(TransactionKind::Cluster, id, TransactionState::Committed)
            .unwrap();
        apply_workload(&broker.messages, &workload).unwrap();
        manager.commit_applied(id);
        manager.checkpoint().unwrap();

        for (k, &p) in order.iter().enumerate() {
            let last = k + 1 == order.len();
            let done = manager
                .update_broker_state(id, TransactionState::Committed, &participants[p])
                .unwrap();
            prop_assert_eq!(done, last);
            if last {
                break;
            }
            if k == restart_after {
                manager = broker.restart(manager).unwrap();
            } else {
                manager.checkpoint().unwrap();
            }
            prop_assert!(manager.prepared_store().contains(id));
            prop_assert_eq!(
                manager.coordinator(TransactionKind::Cluster).residence(id),
                Some(Residence::PersistedIncomplete)
            );
        }

        prop_assert_eq!(
            manager.coordinator(TransactionKind::Cluster).residence(id),
            Some(Residence::PersistedComplete)
        );
        prop_assert!(manager.prepared_store().contains(id));
        manager.checkpoint().unwrap();
        prop_assert!(!manager.prepared_store().contains(id));
    }
}
