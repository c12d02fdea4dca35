//! Worker-side runtime.
//!
//! A Shiftboss registers with the Foreman, then executes whatever work orders
//! are sent to it through a [`WorkOrderExecutor`], the seam behind which the
//! actual storage/execution engine lives. Everything the engine produces
//! (blocks, feedback) is reported back to the coordinator as messages.

use chrono::Utc;
use tracing::{debug, info};

use crate::bus::{
    BusConnection, ClientId, MessageBus, MessageKind, SchedulerMessage, SendStatus,
    WorkOrderCompletion,
};
use crate::catalog::{BlockId, PartitionId, RelationId};
use crate::config::ShiftbossConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{OperatorIndex, QueryId, WorkOrder};

/// A block committed to storage while executing a work order.
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub relation_id: RelationId,
    pub block_id: BlockId,
    pub partition_id: Option<PartitionId>,
}

/// Everything a single work-order execution produced that the coordinator
/// needs to hear about.
#[derive(Debug, Default)]
pub struct WorkOrderArtifacts {
    pub new_blocks: Vec<NewBlock>,
    pub feedback: Option<Vec<u8>>,
}

/// The storage/execution engine seam. The scheduler never looks inside a
/// work-order payload; the executor owns its interpretation.
pub trait WorkOrderExecutor: Send {
    /// Set up per-query execution state ahead of the first work order.
    fn setup_query(&mut self, _query_id: QueryId) {}

    fn execute(&mut self, order: &WorkOrder) -> WorkOrderArtifacts;

    /// Rebuild work orders finalizing this worker's shard of the operator's
    /// mutated storage. Empty when there is nothing to rebuild here.
    fn rebuild_work_orders(
        &mut self,
        _query_id: QueryId,
        _operator_index: OperatorIndex,
        _relation_id: RelationId,
    ) -> Vec<WorkOrder> {
        Vec::new()
    }

    /// Persist this worker's shard of the query result.
    fn save_result(&mut self, _query_id: QueryId, _relation_id: RelationId) {}
}

/// Executor that does nothing. Useful for scheduling-only tests.
#[derive(Debug, Default)]
pub struct NullExecutor;

impl WorkOrderExecutor for NullExecutor {
    fn execute(&mut self, _order: &WorkOrder) -> WorkOrderArtifacts {
        WorkOrderArtifacts::default()
    }
}

const SENDER_KINDS: &[MessageKind] = &[
    MessageKind::RegisterShiftboss,
    MessageKind::QueryInitiateResponse,
    MessageKind::WorkOrderComplete,
    MessageKind::RebuildWorkOrderComplete,
    MessageKind::RelationNewBlock,
    MessageKind::DataPipeline,
    MessageKind::WorkOrderFeedback,
    MessageKind::InitiateRebuildResponse,
    MessageKind::SaveQueryResultResponse,
];

const RECEIVER_KINDS: &[MessageKind] = &[
    MessageKind::RegisterShiftbossResponse,
    MessageKind::QueryInitiate,
    MessageKind::WorkOrderDispatch,
    MessageKind::InitiateRebuild,
    MessageKind::SaveQueryResult,
    MessageKind::Poison,
];

pub struct Shiftboss<E: WorkOrderExecutor> {
    conn: BusConnection,
    foreman_client_id: ClientId,
    executor: E,
    config: ShiftbossConfig,
    shiftboss_index: Option<usize>,
}

impl<E: WorkOrderExecutor> Shiftboss<E> {
    pub fn new(bus: &MessageBus, foreman_client_id: ClientId, executor: E, config: ShiftbossConfig) -> Self {
        let conn = bus.connect();
        for &kind in SENDER_KINDS {
            conn.register_sender(kind);
        }
        for &kind in RECEIVER_KINDS {
            conn.register_receiver(kind);
        }
        Self {
            conn,
            foreman_client_id,
            executor,
            config,
            shiftboss_index: None,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.conn.client_id()
    }

    /// Register with the Foreman, then execute work until Poison arrives.
    pub async fn run(mut self) -> Result<()> {
        self.send(SchedulerMessage::RegisterShiftboss {
            capacity: self.config.work_order_capacity,
        })?;

        loop {
            let Some(envelope) = self.conn.receive().await else {
                return Err(SchedulerError::BusClosed);
            };
            match envelope.message {
                SchedulerMessage::RegisterShiftbossResponse { shiftboss_index } => {
                    info!(shiftboss_index, client_id = self.conn.client_id(), "shiftboss registered");
                    self.shiftboss_index = Some(shiftboss_index);
                }
                SchedulerMessage::QueryInitiate { query_id } => {
                    self.executor.setup_query(query_id);
                    self.send(SchedulerMessage::QueryInitiateResponse { query_id })?;
                }
                SchedulerMessage::WorkOrderDispatch(order) => {
                    self.execute_order(&order, false)?;
                }
                SchedulerMessage::InitiateRebuild {
                    query_id,
                    operator_index,
                    relation_id,
                } => {
                    self.handle_initiate_rebuild(query_id, operator_index, relation_id)?;
                }
                SchedulerMessage::SaveQueryResult {
                    query_id,
                    relation_id,
                    client_id,
                } => {
                    self.executor.save_result(query_id, relation_id);
                    let shiftboss_index = self.shiftboss_index()?;
                    self.send(SchedulerMessage::SaveQueryResultResponse {
                        query_id,
                        shiftboss_index,
                        client_id,
                        relation_id,
                    })?;
                }
                SchedulerMessage::Poison => {
                    info!(shiftboss_index = ?self.shiftboss_index, "shiftboss draining");
                    return Ok(());
                }
                other => {
                    return Err(SchedulerError::UnexpectedMessage {
                        kind: other.kind(),
                        sender: envelope.sender,
                    });
                }
            }
        }
    }

    fn handle_initiate_rebuild(
        &mut self,
        query_id: QueryId,
        operator_index: OperatorIndex,
        relation_id: RelationId,
    ) -> Result<()> {
        let orders = self
            .executor
            .rebuild_work_orders(query_id, operator_index, relation_id);
        debug!(
            query_id,
            operator_index,
            relation_id,
            num_rebuild_work_orders = orders.len(),
            "rebuild initiated"
        );
        // The count must be announced before any completion can arrive.
        self.send(SchedulerMessage::InitiateRebuildResponse {
            query_id,
            operator_index,
            shiftboss_index: self.shiftboss_index()?,
            num_rebuild_work_orders: orders.len(),
        })?;
        for order in orders {
            self.execute_order(&order, true)?;
        }
        Ok(())
    }

    fn execute_order(&mut self, order: &WorkOrder, rebuild: bool) -> Result<()> {
        let shiftboss_index = self.shiftboss_index()?;
        let started_at = Utc::now();
        let artifacts = self.executor.execute(order);
        let finished_at = Utc::now();

        for block in artifacts.new_blocks {
            self.send(SchedulerMessage::RelationNewBlock {
                relation_id: block.relation_id,
                block_id: block.block_id,
                partition_id: block.partition_id,
            })?;
            self.send(SchedulerMessage::DataPipeline {
                query_id: order.query_id,
                operator_index: order.operator_index,
                block_id: block.block_id,
                relation_id: block.relation_id,
                partition_id: block.partition_id,
            })?;
        }
        if let Some(payload) = artifacts.feedback {
            self.send(SchedulerMessage::WorkOrderFeedback {
                query_id: order.query_id,
                operator_index: order.operator_index,
                payload,
            })?;
        }

        let completion = WorkOrderCompletion {
            work_order_id: order.id,
            query_id: order.query_id,
            operator_index: order.operator_index,
            shiftboss_index,
            started_at,
            finished_at,
        };
        self.send(if rebuild {
            SchedulerMessage::RebuildWorkOrderComplete(completion)
        } else {
            SchedulerMessage::WorkOrderComplete(completion)
        })
    }

    fn shiftboss_index(&self) -> Result<usize> {
        self.shiftboss_index.ok_or(SchedulerError::NotYetRegistered)
    }

    fn send(&self, message: SchedulerMessage) -> Result<()> {
        let kind = message.kind();
        let status = self.conn.send(self.foreman_client_id, message);
        if status != SendStatus::Ok {
            return Err(SchedulerError::SendFailed {
                kind,
                from: self.conn.client_id(),
                to: self.foreman_client_id,
                status,
            });
        }
        Ok(())
    }
}
