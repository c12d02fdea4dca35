//! Per-query state machine over the operator DAG.
//!
//! Tracks which operators are unblocked, how many of their work orders are in
//! flight, and when the whole query is done. Work is generated lazily: an
//! operator is asked for work orders only once every blocking predecessor is
//! terminal, and again whenever completions or streamed blocks may have made
//! new work available.

use tracing::debug;

use crate::bus::{ClientId, SchedulerMessage, SendStatus};
use crate::catalog::{BlockId, PartitionId, RelationId};
use crate::error::{Result, SchedulerError};
use crate::scheduler::container::WorkOrdersContainer;
use crate::scheduler::dag::{QueryDag, QueryHandle};
use crate::scheduler::operator::WorkOrder;
use crate::scheduler::state::QueryExecutionState;
use crate::scheduler::{DispatchCtx, OperatorIndex, QueryId};

/// Derived status of one operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorStatus {
    NotStarted,
    InProgress,
    WaitingForRebuild,
    Executed,
}

pub struct QueryManager {
    query_id: QueryId,
    client_id: Option<ClientId>,
    result_relation: Option<RelationId>,
    dag: QueryDag,
    state: QueryExecutionState,
    container: WorkOrdersContainer,
    /// Streaming consumers per producer: dependents reachable over
    /// non-pipeline-breaker edges, eligible for block-at-a-time input.
    output_consumers: Vec<Vec<OperatorIndex>>,
    /// Blocking producers per consumer (pipeline-breaker edges only).
    blocking_dependencies: Vec<Vec<OperatorIndex>>,
    /// Every producer per consumer, blocking or streaming.
    all_dependencies: Vec<Vec<OperatorIndex>>,
}

impl QueryManager {
    /// Consumes the handle and collects initial work from every operator
    /// whose blocking dependencies are already met. May send rebuild
    /// initiations for degenerate zero-work operators, hence the ctx.
    pub fn new(handle: QueryHandle, ctx: &DispatchCtx<'_>) -> Result<Self> {
        let (query_id, dag, result_relation, client_id) = handle.into_parts();
        let num_operators = dag.len();

        let mut output_consumers = vec![Vec::new(); num_operators];
        let mut blocking_dependencies = vec![Vec::new(); num_operators];
        let mut all_dependencies = vec![Vec::new(); num_operators];
        for producer in 0..num_operators {
            for &(consumer, pipeline_breaker) in dag.dependents(producer) {
                all_dependencies[consumer].push(producer);
                if pipeline_breaker {
                    blocking_dependencies[consumer].push(producer);
                } else {
                    output_consumers[producer].push(consumer);
                }
            }
        }

        let mut state = QueryExecutionState::new(num_operators);
        for index in 0..num_operators {
            if dag.operator(index).rebuild_relation().is_some() {
                state.set_rebuild_required(index);
            }
        }

        let mut manager = Self {
            query_id,
            client_id,
            result_relation,
            dag,
            state,
            container: WorkOrdersContainer::new(query_id, num_operators),
            output_consumers,
            blocking_dependencies,
            all_dependencies,
        };

        for index in 0..num_operators {
            if manager.all_blocking_dependencies_met(index) {
                manager.dag.operator_mut(index).all_dependencies_met();
                manager.process_operator(index, false, ctx)?;
            }
        }
        Ok(manager)
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn result_relation(&self) -> Option<RelationId> {
        self.result_relation
    }

    pub fn num_operators(&self) -> usize {
        self.state.num_operators()
    }

    /// The whole query is Executed iff every operator is.
    pub fn is_finished(&self) -> bool {
        self.state.is_query_finished()
    }

    pub fn operator_status(&self, index: OperatorIndex) -> OperatorStatus {
        if self.state.is_finished(index) {
            OperatorStatus::Executed
        } else if self.state.rebuild_initiated(index) {
            OperatorStatus::WaitingForRebuild
        } else if self.state.has_done_generating(index)
            || self.state.num_queued(index) > 0
            || self.container.has_pending(index)
        {
            OperatorStatus::InProgress
        } else {
            OperatorStatus::NotStarted
        }
    }

    /// Next dispatchable work order, lowest operator index first. Each order
    /// is returned exactly once; with no intervening completion or streamed
    /// input, a drained manager keeps returning `None`.
    pub fn next_work_order(&mut self) -> Option<WorkOrder> {
        for index in 0..self.state.num_operators() {
            if self.state.is_finished(index) {
                continue;
            }
            if let Some(order) = self.container.pop(index) {
                self.state.increment_queued(index);
                return Some(order);
            }
        }
        None
    }

    /// A dispatched work order of `index` completed on some worker.
    pub fn on_work_order_complete(&mut self, index: OperatorIndex, ctx: &DispatchCtx<'_>) -> Result<()> {
        self.check_operator_index(index)?;
        if !self.state.decrement_queued(index) {
            return Err(SchedulerError::SpuriousCompletion {
                query_id: self.query_id,
                operator_index: index,
            });
        }

        // The completion may have freed input the operator was waiting on.
        self.fetch_normal_work_orders(index);

        if self.state.is_rebuild_required(index) {
            if self.normal_execution_over(index) {
                if !self.state.rebuild_initiated(index) {
                    if self.initiate_rebuild(index, ctx)? {
                        self.mark_operator_finished(index);
                    }
                } else if self.state.is_rebuild_over(index) {
                    self.mark_operator_finished(index);
                }
            }
        } else if self.normal_execution_over(index) {
            self.mark_operator_finished(index);
        }

        self.process_unblocked_dependents(index, ctx)
    }

    /// A rebuild work order of `index` completed on some worker.
    pub fn on_rebuild_work_order_complete(
        &mut self,
        index: OperatorIndex,
        ctx: &DispatchCtx<'_>,
    ) -> Result<()> {
        self.check_operator_index(index)?;
        if !self.state.decrement_rebuild_outstanding(index) {
            return Err(SchedulerError::SpuriousCompletion {
                query_id: self.query_id,
                operator_index: index,
            });
        }
        if self.state.is_rebuild_over(index) {
            self.mark_operator_finished(index);
            return self.process_unblocked_dependents(index, ctx);
        }
        Ok(())
    }

    /// A worker announced how many rebuild work orders it will run for
    /// `index`.
    pub fn on_initiate_rebuild_response(
        &mut self,
        index: OperatorIndex,
        num_rebuild_work_orders: usize,
        ctx: &DispatchCtx<'_>,
    ) -> Result<()> {
        self.check_operator_index(index)?;
        if !self.state.record_rebuild_response(index, num_rebuild_work_orders) {
            return Err(SchedulerError::SpuriousCompletion {
                query_id: self.query_id,
                operator_index: index,
            });
        }
        if self.state.is_rebuild_over(index) {
            self.mark_operator_finished(index);
            return self.process_unblocked_dependents(index, ctx);
        }
        Ok(())
    }

    /// A block produced by `index` is ready for its pipelined consumers,
    /// without waiting for the producer to finish.
    pub fn on_data_pipeline(
        &mut self,
        index: OperatorIndex,
        block_id: BlockId,
        relation_id: RelationId,
        partition_id: Option<PartitionId>,
    ) -> Result<()> {
        self.check_operator_index(index)?;
        let consumers = self.output_consumers[index].clone();
        for consumer in consumers {
            self.dag
                .operator_mut(consumer)
                .feed_input_block(block_id, relation_id, partition_id);
            // The streamed block may enable new work right away.
            self.fetch_normal_work_orders(consumer);
        }
        Ok(())
    }

    /// Operator-defined feedback from an executed work order.
    pub fn on_feedback(&mut self, index: OperatorIndex, payload: &[u8]) -> Result<()> {
        self.check_operator_index(index)?;
        self.dag.operator_mut(index).receive_feedback(payload);
        Ok(())
    }

    /// A worker hinted that `index` may have new work to generate.
    pub fn on_work_orders_available(&mut self, index: OperatorIndex) -> Result<()> {
        self.check_operator_index(index)?;
        self.fetch_normal_work_orders(index);
        Ok(())
    }

    fn check_operator_index(&self, index: OperatorIndex) -> Result<()> {
        if index >= self.state.num_operators() {
            return Err(SchedulerError::OperatorIndexOutOfRange {
                query_id: self.query_id,
                operator_index: index,
            });
        }
        Ok(())
    }

    fn all_blocking_dependencies_met(&self, index: OperatorIndex) -> bool {
        self.blocking_dependencies[index]
            .iter()
            .all(|&producer| self.state.is_finished(producer))
    }

    fn all_dependencies_met(&self, index: OperatorIndex) -> bool {
        self.all_dependencies[index]
            .iter()
            .all(|&producer| self.state.is_finished(producer))
    }

    /// Normal (non-rebuild) execution is over once every producer finished,
    /// generation is done, and no work order is pending or in flight.
    fn normal_execution_over(&self, index: OperatorIndex) -> bool {
        self.all_dependencies_met(index)
            && self.state.has_done_generating(index)
            && !self.container.has_pending(index)
            && self.state.num_queued(index) == 0
    }

    /// Ask the operator for new work. Returns true if new orders appeared.
    fn fetch_normal_work_orders(&mut self, index: OperatorIndex) -> bool {
        if self.state.has_done_generating(index) {
            return false;
        }
        if !self.all_blocking_dependencies_met(index) {
            return false;
        }
        let before = self.container.num_pending(index);
        let done = self
            .dag
            .operator_mut(index)
            .generate_work_orders(&mut self.container, index);
        if done {
            self.state.set_done_generating(index);
        }
        self.container.num_pending(index) > before
    }

    /// Drive one operator forward: fetch work; if nothing is left, run the
    /// finish/rebuild checks and, if requested, cascade into dependents whose
    /// blocking producers all became terminal.
    fn process_operator(
        &mut self,
        index: OperatorIndex,
        recursively_check_dependents: bool,
        ctx: &DispatchCtx<'_>,
    ) -> Result<()> {
        if self.fetch_normal_work_orders(index) {
            // New work orders were generated; wait for them to run.
            return Ok(());
        }

        if self.normal_execution_over(index) {
            if self.state.is_rebuild_required(index) {
                if !self.state.rebuild_initiated(index) {
                    if self.initiate_rebuild(index, ctx)? {
                        self.mark_operator_finished(index);
                    } else {
                        // Rebuild work orders are now running on the workers.
                        return Ok(());
                    }
                } else if self.state.is_rebuild_over(index) {
                    self.mark_operator_finished(index);
                }
            } else {
                self.mark_operator_finished(index);
            }
            if recursively_check_dependents {
                self.process_unblocked_dependents(index, ctx)?;
            }
        }
        Ok(())
    }

    fn process_unblocked_dependents(&mut self, index: OperatorIndex, ctx: &DispatchCtx<'_>) -> Result<()> {
        let dependents: Vec<OperatorIndex> =
            self.dag.dependents(index).iter().map(|&(dep, _)| dep).collect();
        for dependent in dependents {
            if self.all_blocking_dependencies_met(dependent) {
                self.process_operator(dependent, true, ctx)?;
            }
        }
        Ok(())
    }

    /// Start the rebuild phase: broadcast the initiation to every registered
    /// worker and wait for their work-order counts. Returns true only when
    /// there is trivially nothing to rebuild.
    fn initiate_rebuild(&mut self, index: OperatorIndex, ctx: &DispatchCtx<'_>) -> Result<bool> {
        let Some(relation_id) = self.dag.operator(index).rebuild_relation() else {
            return Ok(true);
        };
        let recipients = ctx.directory.client_ids();
        if recipients.is_empty() {
            return Ok(true);
        }

        self.state.initiate_rebuild(index, recipients.len());
        debug!(
            query_id = self.query_id,
            operator_index = index,
            relation_id,
            num_workers = recipients.len(),
            "initiating rebuild"
        );
        for to in recipients {
            let message = SchedulerMessage::InitiateRebuild {
                query_id: self.query_id,
                operator_index: index,
                relation_id,
            };
            let kind = message.kind();
            let status = ctx.bus.send(ctx.foreman_client_id, to, message);
            if status != SendStatus::Ok {
                return Err(SchedulerError::SendFailed {
                    kind,
                    from: ctx.foreman_client_id,
                    to,
                    status,
                });
            }
        }
        Ok(false)
    }

    fn mark_operator_finished(&mut self, index: OperatorIndex) {
        self.state.set_finished(index);
        debug!(
            query_id = self.query_id,
            operator_index = index,
            operator = self.dag.operator(index).name(),
            "operator finished"
        );

        let output_relation = self.dag.operator(index).output_relation();
        let dependents: Vec<OperatorIndex> =
            self.dag.dependents(index).iter().map(|&(dep, _)| dep).collect();
        for dependent in dependents {
            if let Some(relation_id) = output_relation {
                self.dag.operator_mut(dependent).done_feeding_input(relation_id);
            }
            if self.all_blocking_dependencies_met(dependent) {
                self.dag.operator_mut(dependent).all_dependencies_met();
            }
        }
    }
}
