//! Admission control and message routing across all tracked queries.
//!
//! The PolicyEnforcer owns the map of admitted queries and a FIFO wait queue.
//! Admission is bounded; completions cascade synchronously into removal of
//! the finished query and promotion of the next waiting one, inside the same
//! message-handling call stack.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{ClientId, Envelope, MessageBus, SchedulerMessage, SendStatus, WorkOrderCompletion};
use crate::catalog::Catalog;
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::dag::QueryHandle;
use crate::scheduler::directory::ShiftbossDirectory;
use crate::scheduler::operator::WorkOrder;
use crate::scheduler::query_manager::QueryManager;
use crate::scheduler::{DispatchCtx, OperatorIndex, QueryId};

/// Recorded execution time for one work order. Retained after the owning
/// query is removed, so profiles stay retrievable.
#[derive(Debug, Clone, Serialize)]
pub struct WorkOrderTimeEntry {
    pub work_order_id: Uuid,
    pub shiftboss_index: usize,
    pub operator_index: OperatorIndex,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkOrderTimeEntry {
    pub fn elapsed_micros(&self) -> i64 {
        (self.finished_at - self.started_at).num_microseconds().unwrap_or(i64::MAX)
    }
}

pub struct PolicyEnforcer {
    foreman_client_id: ClientId,
    bus: MessageBus,
    catalog: Arc<dyn Catalog>,
    max_concurrent_queries: usize,
    max_messages_per_dispatch_round: usize,
    profile_work_orders: bool,
    admitted: HashMap<QueryId, QueryManager>,
    waiting: VecDeque<QueryHandle>,
    profiles: HashMap<QueryId, Vec<WorkOrderTimeEntry>>,
}

impl PolicyEnforcer {
    pub fn new(
        foreman_client_id: ClientId,
        bus: MessageBus,
        catalog: Arc<dyn Catalog>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            foreman_client_id,
            bus,
            catalog,
            max_concurrent_queries: config.max_concurrent_queries,
            max_messages_per_dispatch_round: config.max_messages_per_dispatch_round,
            profile_work_orders: config.profile_work_orders,
            admitted: HashMap::new(),
            waiting: VecDeque::new(),
            profiles: HashMap::new(),
        }
    }

    /// Admit one query, or queue it if the concurrency bound is reached.
    /// Returns whether the query was admitted now.
    pub fn admit_query(&mut self, handle: QueryHandle, directory: &ShiftbossDirectory) -> Result<bool> {
        if self.admitted.len() >= self.max_concurrent_queries {
            debug!(
                query_id = handle.query_id(),
                waiting = self.waiting.len() + 1,
                "concurrency bound reached; query queued"
            );
            self.waiting.push_back(handle);
            return Ok(false);
        }

        let query_id = handle.query_id();
        if self.admitted.contains_key(&query_id) {
            error!(query_id, "query with the same id is already admitted");
            return Ok(false);
        }

        // Workers set up the query's execution state before any work order or
        // rebuild initiation can reach them.
        for to in directory.client_ids() {
            self.send(to, SchedulerMessage::QueryInitiate { query_id })?;
        }

        let bus = self.bus.clone();
        let ctx = DispatchCtx {
            bus: &bus,
            foreman_client_id: self.foreman_client_id,
            directory,
        };
        let manager = QueryManager::new(handle, &ctx)?;
        info!(query_id, num_operators = manager.num_operators(), "query admitted");
        self.admitted.insert(query_id, manager);
        Ok(true)
    }

    /// Admit a batch sequentially. Stops at the first query that cannot be
    /// admitted now and returns false; earlier admissions are not rolled
    /// back.
    pub fn admit_queries(
        &mut self,
        handles: Vec<QueryHandle>,
        directory: &ShiftbossDirectory,
    ) -> Result<bool> {
        for handle in handles {
            if !self.admit_query(handle, directory)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Route an inbound protocol message to the owning QueryManager and run
    /// the completion/promotion tail if the query became terminal.
    pub fn process_message(&mut self, envelope: Envelope, directory: &mut ShiftbossDirectory) -> Result<()> {
        let Envelope { sender, message } = envelope;
        let bus = self.bus.clone();

        let query_id = match message {
            SchedulerMessage::WorkOrderComplete(completion) => {
                directory.decrement_queued(completion.shiftboss_index)?;
                if self.profile_work_orders {
                    self.record_time(&completion);
                }
                let ctx = DispatchCtx {
                    bus: &bus,
                    foreman_client_id: self.foreman_client_id,
                    directory,
                };
                self.manager_mut(completion.query_id)?
                    .on_work_order_complete(completion.operator_index, &ctx)?;
                completion.query_id
            }
            SchedulerMessage::RebuildWorkOrderComplete(completion) => {
                directory.decrement_queued(completion.shiftboss_index)?;
                let ctx = DispatchCtx {
                    bus: &bus,
                    foreman_client_id: self.foreman_client_id,
                    directory,
                };
                self.manager_mut(completion.query_id)?
                    .on_rebuild_work_order_complete(completion.operator_index, &ctx)?;
                completion.query_id
            }
            SchedulerMessage::RelationNewBlock {
                relation_id,
                block_id,
                partition_id,
            } => {
                self.catalog.add_block(relation_id, block_id, partition_id);
                return Ok(());
            }
            SchedulerMessage::DataPipeline {
                query_id,
                operator_index,
                block_id,
                relation_id,
                partition_id,
            } => {
                self.manager_mut(query_id)?
                    .on_data_pipeline(operator_index, block_id, relation_id, partition_id)?;
                query_id
            }
            SchedulerMessage::WorkOrderFeedback {
                query_id,
                operator_index,
                payload,
            } => {
                self.manager_mut(query_id)?.on_feedback(operator_index, &payload)?;
                query_id
            }
            SchedulerMessage::WorkOrdersAvailable {
                query_id,
                operator_index,
            } => {
                self.manager_mut(query_id)?.on_work_orders_available(operator_index)?;
                query_id
            }
            other => {
                return Err(SchedulerError::UnexpectedMessage {
                    kind: other.kind(),
                    sender,
                });
            }
        };

        if self.admitted.get(&query_id).map(QueryManager::is_finished).unwrap_or(false) {
            self.finish_query(query_id, directory)?;
        }
        Ok(())
    }

    /// Distributed-only: a worker announced its rebuild work-order count for
    /// an operator. The announced orders count against the worker's capacity.
    pub fn process_initiate_rebuild_response(
        &mut self,
        query_id: QueryId,
        operator_index: OperatorIndex,
        shiftboss_index: usize,
        num_rebuild_work_orders: usize,
        directory: &mut ShiftbossDirectory,
    ) -> Result<()> {
        directory.add_queued(shiftboss_index, num_rebuild_work_orders)?;
        let bus = self.bus.clone();
        {
            let ctx = DispatchCtx {
                bus: &bus,
                foreman_client_id: self.foreman_client_id,
                directory,
            };
            self.manager_mut(query_id)?.on_initiate_rebuild_response(
                operator_index,
                num_rebuild_work_orders,
                &ctx,
            )?;
        }
        if self.admitted.get(&query_id).map(QueryManager::is_finished).unwrap_or(false) {
            self.finish_query(query_id, directory)?;
        }
        Ok(())
    }

    /// Pull freshly dispatchable work orders, splitting the round budget
    /// evenly across admitted queries. Queries discovered terminal here (zero
    /// further work) run the same completion/promotion tail.
    pub fn collect_work_orders(
        &mut self,
        directory: &ShiftbossDirectory,
        out: &mut Vec<WorkOrder>,
    ) -> Result<()> {
        if self.admitted.is_empty() {
            return Ok(());
        }
        let per_query_share =
            (self.max_messages_per_dispatch_round / self.admitted.len()).max(1);

        let mut finished_query_ids = Vec::new();
        for (&query_id, manager) in self.admitted.iter_mut() {
            let mut collected = 0;
            while collected < per_query_share {
                match manager.next_work_order() {
                    Some(order) => {
                        out.push(order);
                        collected += 1;
                    }
                    None => {
                        // Some queries produce zero further work orders and
                        // finish without a final completion message.
                        if manager.is_finished() {
                            finished_query_ids.push(query_id);
                        }
                        break;
                    }
                }
            }
        }
        for query_id in finished_query_ids {
            self.finish_query(query_id, directory)?;
        }
        Ok(())
    }

    /// Remove a terminal query and admit the head of the wait queue, all
    /// within the caller's stack frame.
    fn finish_query(&mut self, query_id: QueryId, directory: &ShiftbossDirectory) -> Result<()> {
        let manager = self
            .admitted
            .remove(&query_id)
            .ok_or(SchedulerError::UnknownQuery(query_id))?;
        if !manager.is_finished() {
            warn!(query_id, "removing a query that has not finished executing");
        }
        self.on_query_completion(&manager, directory)?;
        info!(query_id, "query completed");

        if let Some(next) = self.waiting.pop_front() {
            let next_id = next.query_id();
            if !self.admit_query(next, directory)? {
                warn!(query_id = next_id, "waiting query could not be admitted");
            }
        }
        Ok(())
    }

    /// Completion hook: persist the result relation across all workers, or
    /// notify the client directly when the query produced no result.
    fn on_query_completion(&self, manager: &QueryManager, directory: &ShiftbossDirectory) -> Result<()> {
        match manager.result_relation() {
            Some(relation_id) => {
                for to in directory.client_ids() {
                    self.send(
                        to,
                        SchedulerMessage::SaveQueryResult {
                            query_id: manager.query_id(),
                            relation_id,
                            client_id: manager.client_id(),
                        },
                    )?;
                }
            }
            None => {
                if let Some(client_id) = manager.client_id() {
                    self.send(client_id, SchedulerMessage::QueryExecutionSuccess { result: None })?;
                } else {
                    debug!(query_id = manager.query_id(), "query finished with no client to notify");
                }
            }
        }
        Ok(())
    }

    pub fn has_queries(&self) -> bool {
        !self.admitted.is_empty() || !self.waiting.is_empty()
    }

    pub fn num_admitted(&self) -> usize {
        self.admitted.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_admitted(&self, query_id: QueryId) -> bool {
        self.admitted.contains_key(&query_id)
    }

    pub fn query_manager(&self, query_id: QueryId) -> Option<&QueryManager> {
        self.admitted.get(&query_id)
    }

    /// Recorded per-work-order timings, if profiling is enabled. Available
    /// even after the query has been removed.
    pub fn profiling_results(&self, query_id: QueryId) -> &[WorkOrderTimeEntry] {
        self.profiles.get(&query_id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn record_time(&mut self, completion: &WorkOrderCompletion) {
        self.profiles
            .entry(completion.query_id)
            .or_default()
            .push(WorkOrderTimeEntry {
                work_order_id: completion.work_order_id,
                shiftboss_index: completion.shiftboss_index,
                operator_index: completion.operator_index,
                started_at: completion.started_at,
                finished_at: completion.finished_at,
            });
    }

    fn manager_mut(&mut self, query_id: QueryId) -> Result<&mut QueryManager> {
        self.admitted
            .get_mut(&query_id)
            .ok_or(SchedulerError::UnknownQuery(query_id))
    }

    fn send(&self, to: ClientId, message: SchedulerMessage) -> Result<()> {
        let kind = message.kind();
        let status = self.bus.send(self.foreman_client_id, to, message);
        if status != SendStatus::Ok {
            return Err(SchedulerError::SendFailed {
                kind,
                from: self.foreman_client_id,
                to,
                status,
            });
        }
        Ok(())
    }
}
