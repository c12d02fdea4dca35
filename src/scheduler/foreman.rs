//! The single driver loop of the scheduler.
//!
//! The Foreman owns the bus endpoint, the worker directory, and the
//! PolicyEnforcer. Every coordinator structure is mutated on this one task;
//! remote workers run concurrently but their messages are consumed strictly
//! serially, in bus-delivery order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::bus::{BusConnection, ClientId, Envelope, MessageBus, MessageKind, SchedulerMessage, SendStatus};
use crate::catalog::{Catalog, RelationId};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::directory::ShiftbossDirectory;
use crate::scheduler::operator::WorkOrder;
use crate::scheduler::policy::{PolicyEnforcer, WorkOrderTimeEntry};
use crate::scheduler::{QueryHandle, QueryId};

const SENDER_KINDS: &[MessageKind] = &[
    MessageKind::RegisterShiftbossResponse,
    MessageKind::QueryInitiate,
    MessageKind::WorkOrderDispatch,
    MessageKind::InitiateRebuild,
    MessageKind::SaveQueryResult,
    MessageKind::QueryExecutionSuccess,
    MessageKind::Poison,
];

const RECEIVER_KINDS: &[MessageKind] = &[
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
];

/// Fan-in state for one query's save-result acknowledgments.
struct SaveResultBarrier {
    client_id: Option<ClientId>,
    relation_id: RelationId,
    acked: HashSet<usize>,
}

pub struct Foreman {
    conn: BusConnection,
    catalog: Arc<dyn Catalog>,
    directory: ShiftbossDirectory,
    policy: PolicyEnforcer,
    /// Work orders pulled from the queries but not yet placeable on a worker
    /// below capacity. Retried after every dispatching message.
    pending_dispatch: VecDeque<WorkOrder>,
    save_result_acks: HashMap<QueryId, SaveResultBarrier>,
}

impl Foreman {
    pub fn new(bus: &MessageBus, catalog: Arc<dyn Catalog>, config: SchedulerConfig) -> Self {
        let conn = bus.connect();
        for &kind in SENDER_KINDS {
            conn.register_sender(kind);
        }
        for &kind in RECEIVER_KINDS {
            conn.register_receiver(kind);
        }
        let policy = PolicyEnforcer::new(conn.client_id(), bus.clone(), catalog.clone(), &config);
        Self {
            conn,
            catalog,
            directory: ShiftbossDirectory::new(),
            policy,
            pending_dispatch: VecDeque::new(),
            save_result_acks: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.conn.client_id()
    }

    pub fn directory(&self) -> &ShiftbossDirectory {
        &self.directory
    }

    pub fn policy_enforcer(&self) -> &PolicyEnforcer {
        &self.policy
    }

    /// Run until a Poison message arrives or a protocol violation is hit.
    ///
    /// Blocks until at least one Shiftboss has registered, then enters the
    /// steady-state event loop.
    pub async fn run(&mut self) -> Result<()> {
        if self.directory.is_empty() {
            debug!("waiting for the first shiftboss to register");
            let envelope = self.conn.receive().await.ok_or(SchedulerError::BusClosed)?;
            match envelope.message {
                SchedulerMessage::RegisterShiftboss { capacity } => {
                    self.register_shiftboss(envelope.sender, capacity)?;
                }
                other => {
                    return Err(SchedulerError::UnexpectedMessage {
                        kind: other.kind(),
                        sender: envelope.sender,
                    });
                }
            }
        }

        loop {
            let envelope = self.conn.receive().await.ok_or(SchedulerError::BusClosed)?;
            let kind = envelope.message.kind();
            trace!(?kind, sender = envelope.sender, "foreman received message");

            match envelope.message {
                SchedulerMessage::RegisterShiftboss { capacity } => {
                    self.register_shiftboss(envelope.sender, capacity)?;
                }
                SchedulerMessage::AdmitRequest { handles } => {
                    self.handle_admit_request(envelope.sender, handles)?;
                }
                SchedulerMessage::QueryInitiateResponse { query_id } => {
                    debug!(query_id, sender = envelope.sender, "query initiated on worker");
                }
                message @ (SchedulerMessage::WorkOrderComplete(_)
                | SchedulerMessage::RebuildWorkOrderComplete(_)
                | SchedulerMessage::RelationNewBlock { .. }
                | SchedulerMessage::DataPipeline { .. }
                | SchedulerMessage::WorkOrderFeedback { .. }
                | SchedulerMessage::WorkOrdersAvailable { .. }) => {
                    self.policy.process_message(
                        Envelope {
                            sender: envelope.sender,
                            message,
                        },
                        &mut self.directory,
                    )?;
                }
                SchedulerMessage::InitiateRebuildResponse {
                    query_id,
                    operator_index,
                    shiftboss_index,
                    num_rebuild_work_orders,
                } => {
                    self.policy.process_initiate_rebuild_response(
                        query_id,
                        operator_index,
                        shiftboss_index,
                        num_rebuild_work_orders,
                        &mut self.directory,
                    )?;
                }
                SchedulerMessage::SaveQueryResultResponse {
                    query_id,
                    shiftboss_index,
                    client_id,
                    relation_id,
                } => {
                    self.handle_save_result_ack(query_id, shiftboss_index, client_id, relation_id)?;
                }
                SchedulerMessage::Poison => {
                    if self.policy.has_queries() {
                        warn!("foreman exiting while queries are executing or waiting for admission");
                    }
                    let recipients = self.directory.client_ids();
                    for to in &recipients {
                        self.send(*to, SchedulerMessage::Poison)?;
                    }
                    info!(num_shiftbosses = recipients.len(), "poison broadcast; foreman draining");
                    return Ok(());
                }
                other => {
                    return Err(SchedulerError::UnexpectedMessage {
                        kind: other.kind(),
                        sender: envelope.sender,
                    });
                }
            }

            if Self::dispatch_allowed_after(kind) {
                self.dispatch_work_orders()?;
            }
        }
    }

    /// Catalog-only and operator-side-channel messages never make new work
    /// dispatchable.
    fn dispatch_allowed_after(kind: MessageKind) -> bool {
        !matches!(kind, MessageKind::RelationNewBlock | MessageKind::WorkOrderFeedback)
    }

    fn register_shiftboss(&mut self, sender: ClientId, capacity: usize) -> Result<()> {
        let shiftboss_index = self.directory.add_shiftboss(sender, capacity);
        info!(client_id = sender, capacity, shiftboss_index, "shiftboss registered");
        self.send(sender, SchedulerMessage::RegisterShiftbossResponse { shiftboss_index })
    }

    fn handle_admit_request(&mut self, sender: ClientId, mut handles: Vec<QueryHandle>) -> Result<()> {
        for handle in &mut handles {
            handle.set_client_id(sender);
        }
        let all_admitted = if handles.len() == 1 {
            let handle = handles.remove(0);
            self.policy.admit_query(handle, &self.directory)?
        } else {
            self.policy.admit_queries(handles, &self.directory)?
        };
        if !all_admitted {
            // Resubmission is the client's concern, not ours.
            warn!(sender, "the scheduler could not admit all requested queries");
        }
        Ok(())
    }

    /// One worker acknowledged persisting its shard of a query result. Once
    /// every registered worker has, tell the originating client about the
    /// finalized relation and drop the barrier.
    fn handle_save_result_ack(
        &mut self,
        query_id: QueryId,
        shiftboss_index: usize,
        client_id: Option<ClientId>,
        relation_id: RelationId,
    ) -> Result<()> {
        let barrier = self
            .save_result_acks
            .entry(query_id)
            .or_insert_with(|| SaveResultBarrier {
                client_id,
                relation_id,
                acked: HashSet::new(),
            });
        barrier.acked.insert(shiftboss_index);
        let complete = barrier.acked.len() >= self.directory.len();
        debug!(
            query_id,
            shiftboss_index,
            acked = barrier.acked.len(),
            registered = self.directory.len(),
            "save-result acknowledgment"
        );
        if complete {
            if let Some(barrier) = self.save_result_acks.remove(&query_id) {
                let result = self.catalog.relation(barrier.relation_id);
                if let Some(client) = barrier.client_id {
                    self.send(client, SchedulerMessage::QueryExecutionSuccess { result })?;
                }
                info!(query_id, relation_id = barrier.relation_id, "query result saved on all workers");
            }
        }
        Ok(())
    }

    /// Drain the holding buffer, then pull freshly generated work, placing
    /// every order on the least-loaded worker still below capacity. Orders
    /// that cannot be placed wait for a later completion to free room.
    fn dispatch_work_orders(&mut self) -> Result<()> {
        if !self.directory.has_available_capacity() {
            return Ok(());
        }
        if self.pending_dispatch.is_empty() {
            let mut fresh = Vec::new();
            self.policy.collect_work_orders(&self.directory, &mut fresh)?;
            self.pending_dispatch.extend(fresh);
        }
        while let Some(shiftboss_index) = self.directory.least_loaded_below_capacity() {
            let Some(order) = self.pending_dispatch.pop_front() else {
                break;
            };
            let to = self.directory.client_id(shiftboss_index)?;
            trace!(
                work_order_id = %order.id,
                query_id = order.query_id,
                operator_index = order.operator_index,
                shiftboss_index,
                "dispatching work order"
            );
            self.send(to, SchedulerMessage::WorkOrderDispatch(order))?;
            self.directory.increment_queued(shiftboss_index)?;
        }
        Ok(())
    }

    pub fn profiling_results(&self, query_id: QueryId) -> &[WorkOrderTimeEntry] {
        self.policy.profiling_results(query_id)
    }

    /// Write recorded work-order timings for one query as CSV.
    pub fn write_profiling_results(&self, query_id: QueryId, out: &mut impl io::Write) -> io::Result<()> {
        writeln!(out, "query_id,shiftboss_index,operator_index,time_micros")?;
        for entry in self.policy.profiling_results(query_id) {
            writeln!(
                out,
                "{},{},{},{}",
                query_id,
                entry.shiftboss_index,
                entry.operator_index,
                entry.elapsed_micros()
            )?;
        }
        Ok(())
    }

    fn send(&self, to: ClientId, message: SchedulerMessage) -> Result<()> {
        let kind = message.kind();
        let status = self.conn.send(to, message);
        if status != SendStatus::Ok {
            return Err(SchedulerError::SendFailed {
                kind,
                from: self.conn.client_id(),
                to,
                status,
            });
        }
        Ok(())
    }
}
