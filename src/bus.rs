//! In-process message bus connecting the Foreman, the Shiftbosses, and
//! clients.
//!
//! Delivery is typed rather than byte-oriented: wire-level serialization of
//! payloads is an external concern, so the bus moves [`SchedulerMessage`]
//! values over per-client mpsc channels. Clients connect to obtain an id and
//! a receive endpoint, then register the message kinds they intend to send
//! and receive; a send is only delivered when both sides registered the kind,
//! and every send reports an explicit [`SendStatus`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::catalog::{BlockId, PartitionId, RelationId, RelationMetadata};
use crate::scheduler::{OperatorIndex, QueryHandle, QueryId, WorkOrder};

pub type ClientId = u64;

/// Tag identifying each message variant, used for sender/receiver
/// registration checks and for dispatch-gating decisions in the Foreman.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RegisterShiftboss,
    RegisterShiftbossResponse,
    AdmitRequest,
    QueryInitiate,
    QueryInitiateResponse,
    WorkOrderDispatch,
    WorkOrderComplete,
    RebuildWorkOrderComplete,
    RelationNewBlock,
    DataPipeline,
    WorkOrderFeedback,
    WorkOrdersAvailable,
    InitiateRebuild,
    InitiateRebuildResponse,
    SaveQueryResult,
    SaveQueryResultResponse,
    QueryExecutionSuccess,
    Poison,
}

/// Completion report for one executed work order, normal or rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrderCompletion {
    pub work_order_id: Uuid,
    pub query_id: QueryId,
    pub operator_index: OperatorIndex,
    pub shiftboss_index: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The full message vocabulary of the scheduler protocol.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// Worker -> Foreman, first contact. Carries the worker's capacity.
    RegisterShiftboss { capacity: usize },
    /// Foreman -> worker, acknowledges registration with the assigned index.
    RegisterShiftbossResponse { shiftboss_index: usize },
    /// Client -> Foreman. Local-only: carries live query handles, never
    /// serialized.
    AdmitRequest { handles: Vec<QueryHandle> },
    /// Foreman -> worker, on admission: set up execution state for a query.
    QueryInitiate { query_id: QueryId },
    QueryInitiateResponse { query_id: QueryId },
    /// Foreman -> worker: one unit of executable work. The payload is opaque
    /// to the scheduler.
    WorkOrderDispatch(WorkOrder),
    WorkOrderComplete(WorkOrderCompletion),
    RebuildWorkOrderComplete(WorkOrderCompletion),
    /// Worker -> Foreman: a block was committed to storage; record it in the
    /// catalog.
    RelationNewBlock {
        relation_id: RelationId,
        block_id: BlockId,
        partition_id: Option<PartitionId>,
    },
    /// Worker -> Foreman: a fully-filled block is ready for pipelined
    /// consumers of the producing operator.
    DataPipeline {
        query_id: QueryId,
        operator_index: OperatorIndex,
        block_id: BlockId,
        relation_id: RelationId,
        partition_id: Option<PartitionId>,
    },
    /// Operator-defined side channel, e.g. build-side to probe-side hints.
    WorkOrderFeedback {
        query_id: QueryId,
        operator_index: OperatorIndex,
        payload: Vec<u8>,
    },
    /// Worker -> Foreman: an operator may have new work to generate.
    WorkOrdersAvailable {
        query_id: QueryId,
        operator_index: OperatorIndex,
    },
    /// Foreman -> worker: start the rebuild phase for an operator's output.
    InitiateRebuild {
        query_id: QueryId,
        operator_index: OperatorIndex,
        relation_id: RelationId,
    },
    InitiateRebuildResponse {
        query_id: QueryId,
        operator_index: OperatorIndex,
        shiftboss_index: usize,
        num_rebuild_work_orders: usize,
    },
    /// Foreman -> worker: persist the worker's shard of a query result. The
    /// originating client rides along so the acknowledgment can echo it.
    SaveQueryResult {
        query_id: QueryId,
        relation_id: RelationId,
        client_id: Option<ClientId>,
    },
    SaveQueryResultResponse {
        query_id: QueryId,
        shiftboss_index: usize,
        client_id: Option<ClientId>,
        relation_id: RelationId,
    },
    /// Foreman -> client: the query finished; metadata of the result
    /// relation, if the query produced one.
    QueryExecutionSuccess { result: Option<RelationMetadata> },
    /// Unconditional cluster-wide shutdown.
    Poison,
}

impl SchedulerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            SchedulerMessage::RegisterShiftboss { .. } => MessageKind::RegisterShiftboss,
            SchedulerMessage::RegisterShiftbossResponse { .. } => MessageKind::RegisterShiftbossResponse,
            SchedulerMessage::AdmitRequest { .. } => MessageKind::AdmitRequest,
            SchedulerMessage::QueryInitiate { .. } => MessageKind::QueryInitiate,
            SchedulerMessage::QueryInitiateResponse { .. } => MessageKind::QueryInitiateResponse,
            SchedulerMessage::WorkOrderDispatch(_) => MessageKind::WorkOrderDispatch,
            SchedulerMessage::WorkOrderComplete(_) => MessageKind::WorkOrderComplete,
            SchedulerMessage::RebuildWorkOrderComplete(_) => MessageKind::RebuildWorkOrderComplete,
            SchedulerMessage::RelationNewBlock { .. } => MessageKind::RelationNewBlock,
            SchedulerMessage::DataPipeline { .. } => MessageKind::DataPipeline,
            SchedulerMessage::WorkOrderFeedback { .. } => MessageKind::WorkOrderFeedback,
            SchedulerMessage::WorkOrdersAvailable { .. } => MessageKind::WorkOrdersAvailable,
            SchedulerMessage::InitiateRebuild { .. } => MessageKind::InitiateRebuild,
            SchedulerMessage::InitiateRebuildResponse { .. } => MessageKind::InitiateRebuildResponse,
            SchedulerMessage::SaveQueryResult { .. } => MessageKind::SaveQueryResult,
            SchedulerMessage::SaveQueryResultResponse { .. } => MessageKind::SaveQueryResultResponse,
            SchedulerMessage::QueryExecutionSuccess { .. } => MessageKind::QueryExecutionSuccess,
            SchedulerMessage::Poison => MessageKind::Poison,
        }
    }
}

/// A delivered message together with the sending client's id.
#[derive(Debug)]
pub struct Envelope {
    pub sender: ClientId,
    pub message: SchedulerMessage,
}

/// Outcome of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    SenderNotRegistered,
    ReceiverNotRegistered,
    /// The recipient's receive endpoint has been dropped.
    Disconnected,
}

struct ClientState {
    tx: mpsc::UnboundedSender<Envelope>,
    sends: HashSet<MessageKind>,
    receives: HashSet<MessageKind>,
}

#[derive(Default)]
struct BusInner {
    next_client_id: ClientId,
    clients: HashMap<ClientId, ClientState>,
}

/// Clonable bus handle. All state lives behind a shared mutex; sends are
/// synchronous and never block.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<Mutex<BusInner>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new client, assigning the next client id.
    pub fn connect(&self) -> BusConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let client_id = inner.next_client_id;
        inner.next_client_id += 1;
        inner.clients.insert(
            client_id,
            ClientState {
                tx,
                sends: HashSet::new(),
                receives: HashSet::new(),
            },
        );
        BusConnection {
            client_id,
            bus: self.clone(),
            rx,
        }
    }

    pub fn register_sender(&self, client_id: ClientId, kind: MessageKind) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(client) = inner.clients.get_mut(&client_id) {
            client.sends.insert(kind);
        }
    }

    pub fn register_receiver(&self, client_id: ClientId, kind: MessageKind) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(client) = inner.clients.get_mut(&client_id) {
            client.receives.insert(kind);
        }
    }

    /// Deliver `message` from `from` to `to`. Both sides must have registered
    /// the message kind.
    pub fn send(&self, from: ClientId, to: ClientId, message: SchedulerMessage) -> SendStatus {
        let kind = message.kind();
        let inner = self.inner.lock().unwrap();
        match inner.clients.get(&from) {
            Some(sender) if sender.sends.contains(&kind) => {}
            _ => return SendStatus::SenderNotRegistered,
        }
        let Some(recipient) = inner.clients.get(&to) else {
            return SendStatus::ReceiverNotRegistered;
        };
        if !recipient.receives.contains(&kind) {
            return SendStatus::ReceiverNotRegistered;
        }
        match recipient.tx.send(Envelope { sender: from, message }) {
            Ok(()) => SendStatus::Ok,
            Err(_) => SendStatus::Disconnected,
        }
    }

}

/// One client's attachment to the bus: its id plus the owned receive side.
pub struct BusConnection {
    client_id: ClientId,
    bus: MessageBus,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl BusConnection {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn register_sender(&self, kind: MessageKind) {
        self.bus.register_sender(self.client_id, kind);
    }

    pub fn register_receiver(&self, kind: MessageKind) {
        self.bus.register_receiver(self.client_id, kind);
    }

    pub fn send(&self, to: ClientId, message: SchedulerMessage) -> SendStatus {
        self.bus.send(self.client_id, to, message)
    }

    /// Wait for the next message. `None` means every sender handle to this
    /// client is gone, which only happens when the bus itself is dropped.
    pub async fn receive(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Wait for the next message, giving up after `timeout`.
    pub async fn receive_timeout(&mut self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_requires_both_registrations() {
        let bus = MessageBus::new();
        let sender = bus.connect();
        let mut receiver = bus.connect();

        assert_eq!(
            sender.send(receiver.client_id(), SchedulerMessage::Poison),
            SendStatus::SenderNotRegistered
        );

        sender.register_sender(MessageKind::Poison);
        assert_eq!(
            sender.send(receiver.client_id(), SchedulerMessage::Poison),
            SendStatus::ReceiverNotRegistered
        );

        receiver.register_receiver(MessageKind::Poison);
        assert_eq!(
            sender.send(receiver.client_id(), SchedulerMessage::Poison),
            SendStatus::Ok
        );

        let envelope = receiver.receive().await.unwrap();
        assert_eq!(envelope.sender, sender.client_id());
        assert_eq!(envelope.message.kind(), MessageKind::Poison);
    }

    #[tokio::test]
    async fn receive_timeout_elapses_when_idle() {
        let bus = MessageBus::new();
        let mut conn = bus.connect();
        let received = conn.receive_timeout(Duration::from_millis(10)).await;
        assert!(received.is_none());
    }
}
