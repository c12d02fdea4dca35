//! Test harness for scheduler integration tests.
//!
//! Provides bus endpoints that stand in for the coordinator, workers, and
//! clients, plus query builders for common DAG shapes.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use quarry::bus::{
    BusConnection, ClientId, MessageBus, MessageKind, SchedulerMessage, SendStatus,
    WorkOrderCompletion,
};
use quarry::catalog::{InMemoryCatalog, RelationId};
use quarry::config::SchedulerConfig;
use quarry::error::Result;
use quarry::scheduler::{
    BatchOperator, Foreman, QueryDag, QueryHandle, QueryId, WorkOrder,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);
pub const QUIET_TIMEOUT: Duration = Duration::from_millis(100);

/// A bus endpoint registered with the coordinator's sender/receiver kinds,
/// for tests that drive the PolicyEnforcer or QueryManager directly.
pub fn coordinator_conn(bus: &MessageBus) -> BusConnection {
    let conn = bus.connect();
    for kind in [
        MessageKind::RegisterShiftbossResponse,
        MessageKind::QueryInitiate,
        MessageKind::WorkOrderDispatch,
        MessageKind::InitiateRebuild,
        MessageKind::SaveQueryResult,
        MessageKind::QueryExecutionSuccess,
        MessageKind::Poison,
    ] {
        conn.register_sender(kind);
    }
    for kind in [
        MessageKind::RegisterShiftboss,
        MessageKind::AdmitRequest,
        MessageKind::QueryInitiateResponse,
        MessageKind::RelationNewBlock,
        MessageKind::DataPipeline,
        MessageKind::InitiateRebuildResponse,
        MessageKind::WorkOrderComplete,
        MessageKind::RebuildWorkOrderComplete,
        MessageKind::WorkOrderFeedback,
        MessageKind::WorkOrdersAvailable,
        MessageKind::SaveQueryResultResponse,
        MessageKind::Poison,
    ] {
        conn.register_receiver(kind);
    }
    conn
}

/// A bus endpoint registered like a client that submits queries.
pub fn client_conn(bus: &MessageBus) -> BusConnection {
    let conn = bus.connect();
    conn.register_sender(MessageKind::AdmitRequest);
    conn.register_sender(MessageKind::Poison);
    conn.register_receiver(MessageKind::QueryExecutionSuccess);
    conn
}

/// A scripted worker endpoint. Unlike a real Shiftboss it executes nothing on
/// its own; tests decide exactly when each completion is reported, which
/// makes capacity and phasing observable.
pub struct StubWorker {
    pub conn: BusConnection,
    pub foreman_id: ClientId,
    pub shiftboss_index: usize,
}

/// Completion report as a worker at `shiftboss_index` would send it.
pub fn completion_for(order: &WorkOrder, shiftboss_index: usize) -> WorkOrderCompletion {
    let now = Utc::now();
    WorkOrderCompletion {
        work_order_id: order.id,
        query_id: order.query_id,
        operator_index: order.operator_index,
        shiftboss_index,
        started_at: now,
        finished_at: now,
    }
}

impl StubWorker {
    pub async fn register(bus: &MessageBus, foreman_id: ClientId, capacity: usize) -> Self {
        let mut conn = bus.connect();
        for kind in [
            MessageKind::RegisterShiftboss,
            MessageKind::QueryInitiateResponse,
            MessageKind::WorkOrderComplete,
            MessageKind::RebuildWorkOrderComplete,
            MessageKind::RelationNewBlock,
            MessageKind::DataPipeline,
            MessageKind::WorkOrderFeedback,
            MessageKind::InitiateRebuildResponse,
            MessageKind::SaveQueryResultResponse,
        ] {
            conn.register_sender(kind);
        }
        for kind in [
            MessageKind::RegisterShiftbossResponse,
            MessageKind::QueryInitiate,
            MessageKind::WorkOrderDispatch,
            MessageKind::InitiateRebuild,
            MessageKind::SaveQueryResult,
            MessageKind::Poison,
        ] {
            conn.register_receiver(kind);
        }

        let status = conn.send(foreman_id, SchedulerMessage::RegisterShiftboss { capacity });
        assert_eq!(status, SendStatus::Ok);
        let envelope = conn
            .receive_timeout(RECV_TIMEOUT)
            .await
            .expect("registration ack");
        let SchedulerMessage::RegisterShiftbossResponse { shiftboss_index } = envelope.message
        else {
            panic!("expected RegisterShiftbossResponse, got {:?}", envelope.message);
        };

        Self {
            conn,
            foreman_id,
            shiftboss_index,
        }
    }

    /// Next message of any kind, failing the test if none arrives in time.
    pub async fn next_message(&mut self) -> SchedulerMessage {
        self.conn
            .receive_timeout(RECV_TIMEOUT)
            .await
            .expect("worker expected a message")
            .message
    }

    /// Next dispatched work order, acknowledging any QueryInitiate
    /// handshakes that precede it.
    pub async fn expect_dispatch(&mut self) -> WorkOrder {
        loop {
            match self.next_message().await {
                SchedulerMessage::WorkOrderDispatch(order) => return order,
                SchedulerMessage::QueryInitiate { query_id } => self.ack_initiate(query_id),
                other => panic!("expected WorkOrderDispatch, got {:?}", other),
            }
        }
    }

    /// Assert that nothing arrives for a short while.
    pub async fn expect_quiet(&mut self) {
        if let Some(envelope) = self.conn.receive_timeout(QUIET_TIMEOUT).await {
            panic!("expected no message, got {:?}", envelope.message);
        }
    }

    pub fn ack_initiate(&self, query_id: QueryId) {
        let status = self
            .conn
            .send(self.foreman_id, SchedulerMessage::QueryInitiateResponse { query_id });
        assert_eq!(status, SendStatus::Ok);
    }

    /// Report a normal work-order completion for `order`.
    pub fn complete(&self, order: &WorkOrder) {
        let status = self.conn.send(
            self.foreman_id,
            SchedulerMessage::WorkOrderComplete(completion_for(order, self.shiftboss_index)),
        );
        assert_eq!(status, SendStatus::Ok);
    }
}

/// A Foreman running on its own task, returned to the test when poisoned.
pub struct TestForeman {
    pub foreman_id: ClientId,
    pub catalog: Arc<InMemoryCatalog>,
    pub handle: JoinHandle<(Foreman, Result<()>)>,
}

pub fn spawn_foreman(bus: &MessageBus, config: SchedulerConfig) -> TestForeman {
    let catalog = Arc::new(InMemoryCatalog::new());
    let mut foreman = Foreman::new(bus, catalog.clone(), config);
    let foreman_id = foreman.client_id();
    let handle = tokio::spawn(async move {
        let result = foreman.run().await;
        (foreman, result)
    });
    TestForeman {
        foreman_id,
        catalog,
        handle,
    }
}

/// A chain of batch operators joined by blocking edges, one per entry in
/// `work_order_counts`.
pub fn chain_query(query_id: QueryId, work_order_counts: &[usize]) -> QueryHandle {
    let mut dag = QueryDag::new();
    let mut previous = None;
    for (position, &count) in work_order_counts.iter().enumerate() {
        let index = dag.add_operator(Box::new(BatchOperator::with_work_orders(
            format!("op_{position}"),
            count,
        )));
        if let Some(producer) = previous {
            dag.add_dependency(producer, index, true);
        }
        previous = Some(index);
    }
    QueryHandle::new(query_id, dag)
}

/// A single-operator query whose result is saved into `relation_id`.
pub fn result_query(query_id: QueryId, work_orders: usize, relation_id: RelationId) -> QueryHandle {
    let mut dag = QueryDag::new();
    dag.add_operator(Box::new(
        BatchOperator::with_work_orders("sink", work_orders).output_relation(relation_id),
    ));
    QueryHandle::new(query_id, dag).with_result_relation(relation_id)
}
