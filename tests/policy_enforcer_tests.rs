mod test_harness;

use std::sync::Arc;

use quarry::bus::{Envelope, MessageBus, MessageKind, SchedulerMessage};
use quarry::catalog::InMemoryCatalog;
use quarry::config::SchedulerConfig;
use quarry::error::SchedulerError;
use quarry::scheduler::{PolicyEnforcer, ShiftbossDirectory};
use test_harness::{chain_query, coordinator_conn, RECV_TIMEOUT};

fn policy_fixture(bus: &MessageBus, config: &SchedulerConfig) -> PolicyEnforcer {
    let conn = coordinator_conn(bus);
    PolicyEnforcer::new(
        conn.client_id(),
        bus.clone(),
        Arc::new(InMemoryCatalog::new()),
        config,
    )
}

#[test]
fn admission_is_bounded_and_fifo() {
    let bus = MessageBus::new();
    let config = SchedulerConfig::default();
    let mut policy = policy_fixture(&bus, &config);
    let directory = ShiftbossDirectory::new();

    let all_admitted = policy
        .admit_queries(
            vec![chain_query(1, &[2]), chain_query(2, &[2]), chain_query(3, &[2])],
            &directory,
        )
        .unwrap();

    // Batch admission stops at the first query that cannot run now: query 2
    // is queued and query 3 is dropped, left for the client to resubmit.
    assert!(!all_admitted);
    assert_eq!(policy.num_admitted(), 1);
    assert_eq!(policy.num_waiting(), 1);
    assert!(policy.is_admitted(1));
    assert!(!policy.is_admitted(2));

    // Individually admitted queries do queue behind the bound in FIFO order.
    assert!(!policy.admit_query(chain_query(4, &[2]), &directory).unwrap());
    assert!(!policy.admit_query(chain_query(5, &[2]), &directory).unwrap());
    assert_eq!(policy.num_waiting(), 3);
}

#[test]
fn batch_admission_is_not_rolled_back() {
    let bus = MessageBus::new();
    let config = SchedulerConfig {
        max_concurrent_queries: 2,
        ..SchedulerConfig::default()
    };
    let mut policy = policy_fixture(&bus, &config);
    let directory = ShiftbossDirectory::new();

    let all_admitted = policy
        .admit_queries(
            vec![chain_query(1, &[1]), chain_query(2, &[1]), chain_query(3, &[1])],
            &directory,
        )
        .unwrap();

    assert!(!all_admitted);
    assert!(policy.is_admitted(1));
    assert!(policy.is_admitted(2));
    assert_eq!(policy.num_waiting(), 1);
}

#[tokio::test]
async fn completed_query_promotes_the_waiting_head() {
    let bus = MessageBus::new();
    let config = SchedulerConfig::default();
    let conn = coordinator_conn(&bus);
    let mut policy = PolicyEnforcer::new(
        conn.client_id(),
        bus.clone(),
        Arc::new(InMemoryCatalog::new()),
        &config,
    );

    let mut directory = ShiftbossDirectory::new();
    let mut worker = bus.connect();
    worker.register_receiver(MessageKind::QueryInitiate);
    let worker_index = directory.add_shiftboss(worker.client_id(), 4);

    policy
        .admit_queries(vec![chain_query(1, &[1]), chain_query(2, &[1])], &directory)
        .unwrap();
    assert!(policy.is_admitted(1));
    assert_eq!(policy.num_waiting(), 1);

    // Only the admitted query has been initiated on the worker.
    let envelope = worker.receive_timeout(RECV_TIMEOUT).await.expect("initiation");
    assert!(matches!(
        envelope.message,
        SchedulerMessage::QueryInitiate { query_id: 1 }
    ));

    let mut out = Vec::new();
    policy.collect_work_orders(&directory, &mut out).unwrap();
    assert_eq!(out.len(), 1);
    let order = &out[0];
    assert_eq!(order.query_id, 1);
    directory.increment_queued(worker_index).unwrap();

    // The final completion retires query 1 and admits query 2 in the same
    // call stack.
    policy
        .process_message(
            Envelope {
                sender: worker.client_id(),
                message: SchedulerMessage::WorkOrderComplete(test_harness::completion_for(
                    order,
                    worker_index,
                )),
            },
            &mut directory,
        )
        .unwrap();

    assert!(!policy.is_admitted(1));
    assert!(policy.is_admitted(2));
    assert_eq!(policy.num_waiting(), 0);
    assert_eq!(directory.num_queued(worker_index).unwrap(), 0);

    let envelope = worker.receive_timeout(RECV_TIMEOUT).await.expect("promotion initiation");
    assert!(matches!(
        envelope.message,
        SchedulerMessage::QueryInitiate { query_id: 2 }
    ));
}

#[test]
fn completion_for_unknown_query_is_an_error() {
    let bus = MessageBus::new();
    let config = SchedulerConfig::default();
    let mut policy = policy_fixture(&bus, &config);
    let mut directory = ShiftbossDirectory::new();
    let worker_index = directory.add_shiftboss(11, 4);
    directory.increment_queued(worker_index).unwrap();

    let order = quarry::scheduler::WorkOrder::new(42, 0, Vec::new());
    let result = policy.process_message(
        Envelope {
            sender: 11,
            message: SchedulerMessage::WorkOrderComplete(test_harness::completion_for(
                &order,
                worker_index,
            )),
        },
        &mut directory,
    );
    assert!(matches!(result, Err(SchedulerError::UnknownQuery(42))));
}

#[test]
fn profiling_entries_survive_query_removal() {
    let bus = MessageBus::new();
    let config = SchedulerConfig {
        profile_work_orders: true,
        ..SchedulerConfig::default()
    };
    let conn = coordinator_conn(&bus);
    let mut policy = PolicyEnforcer::new(
        conn.client_id(),
        bus.clone(),
        Arc::new(InMemoryCatalog::new()),
        &config,
    );
    let mut directory = ShiftbossDirectory::new();
    let worker = bus.connect();
    worker.register_receiver(MessageKind::QueryInitiate);
    let worker_index = directory.add_shiftboss(worker.client_id(), 4);

    policy.admit_query(chain_query(1, &[1]), &directory).unwrap();
    let mut out = Vec::new();
    policy.collect_work_orders(&directory, &mut out).unwrap();
    directory.increment_queued(worker_index).unwrap();

    policy
        .process_message(
            Envelope {
                sender: worker.client_id(),
                message: SchedulerMessage::WorkOrderComplete(test_harness::completion_for(
                    &out[0],
                    worker_index,
                )),
            },
            &mut directory,
        )
        .unwrap();

    assert!(!policy.is_admitted(1));
    let entries = policy.profiling_results(1);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].shiftboss_index, worker_index);
    assert_eq!(entries[0].operator_index, 0);
}
