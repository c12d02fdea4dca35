//! The operator seam between the scheduler and the execution engine.
//!
//! Operators are pre-compiled by the optimizer; the scheduler only asks them
//! to generate work orders once their blocking dependencies are terminal, and
//! relays streamed blocks and feedback to them. Work-order payloads are
//! opaque bytes: what a work order *does* is the storage engine's business.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{BlockId, PartitionId, RelationId};
use crate::scheduler::container::WorkOrdersContainer;
use crate::scheduler::{OperatorIndex, QueryId};

/// One unit of executable work for one operator instance of one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: Uuid,
    pub query_id: QueryId,
    pub operator_index: OperatorIndex,
    /// Opaque, operator-owned payload. Never inspected by the scheduler.
    pub payload: Vec<u8>,
}

impl WorkOrder {
    pub fn new(query_id: QueryId, operator_index: OperatorIndex, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            query_id,
            operator_index,
            payload,
        }
    }
}

/// A relational operator instance as seen by the scheduler.
pub trait Operator: Send {
    fn name(&self) -> &str;

    /// Generate pending work orders into the container. Called only once all
    /// blocking dependencies are terminal, and again whenever new input may
    /// have arrived. Returns true once the operator will never generate more.
    fn generate_work_orders(
        &mut self,
        container: &mut WorkOrdersContainer,
        operator_index: OperatorIndex,
    ) -> bool;

    /// A pipelined upstream operator produced a block for this consumer.
    fn feed_input_block(
        &mut self,
        _block_id: BlockId,
        _relation_id: RelationId,
        _partition_id: Option<PartitionId>,
    ) {
    }

    /// The upstream producer of `relation_id` is done feeding blocks.
    fn done_feeding_input(&mut self, _relation_id: RelationId) {}

    /// All blocking dependencies of this operator became terminal.
    fn all_dependencies_met(&mut self) {}

    /// Operator-defined side channel, delivered from executed work orders.
    fn receive_feedback(&mut self, _payload: &[u8]) {}

    /// Relation this operator writes, if any.
    fn output_relation(&self) -> Option<RelationId> {
        None
    }

    /// Some(relation) if a rebuild phase must finalize this operator's
    /// mutated storage after normal execution.
    fn rebuild_relation(&self) -> Option<RelationId> {
        None
    }
}

/// An operator with a fixed batch of work, emitted in one wave as soon as its
/// blocking dependencies are met. Covers scans, joins over staged input, and
/// most of what the tests and the demo runner need.
pub struct BatchOperator {
    name: String,
    payloads: Vec<Vec<u8>>,
    emitted: bool,
    output_relation: Option<RelationId>,
    rebuild_relation: Option<RelationId>,
}

impl BatchOperator {
    pub fn new(name: impl Into<String>, payloads: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            payloads,
            emitted: false,
            output_relation: None,
            rebuild_relation: None,
        }
    }

    /// Convenience: `count` empty payloads.
    pub fn with_work_orders(name: impl Into<String>, count: usize) -> Self {
        Self::new(name, vec![Vec::new(); count])
    }

    pub fn output_relation(mut self, relation_id: RelationId) -> Self {
        self.output_relation = Some(relation_id);
        self
    }

    pub fn rebuild_relation(mut self, relation_id: RelationId) -> Self {
        self.rebuild_relation = Some(relation_id);
        self
    }
}

impl Operator for BatchOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_work_orders(
        &mut self,
        container: &mut WorkOrdersContainer,
        operator_index: OperatorIndex,
    ) -> bool {
        if !self.emitted {
            for payload in self.payloads.drain(..) {
                container.push(operator_index, payload);
            }
            self.emitted = true;
        }
        true
    }

    fn output_relation(&self) -> Option<RelationId> {
        self.output_relation
    }

    fn rebuild_relation(&self) -> Option<RelationId> {
        self.rebuild_relation
    }
}

/// A pipelined consumer: emits one work order per streamed input block and is
/// done generating once the upstream producer has finished feeding.
pub struct RelayOperator {
    name: String,
    input_relation: RelationId,
    buffered_blocks: Vec<BlockId>,
    input_done: bool,
    output_relation: Option<RelationId>,
}

impl RelayOperator {
    pub fn new(name: impl Into<String>, input_relation: RelationId) -> Self {
        Self {
            name: name.into(),
            input_relation,
            buffered_blocks: Vec::new(),
            input_done: false,
            output_relation: None,
        }
    }

    pub fn output_relation(mut self, relation_id: RelationId) -> Self {
        self.output_relation = Some(relation_id);
        self
    }
}

impl Operator for RelayOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_work_orders(
        &mut self,
        container: &mut WorkOrdersContainer,
        operator_index: OperatorIndex,
    ) -> bool {
        for block_id in self.buffered_blocks.drain(..) {
            container.push(operator_index, block_id.to_le_bytes().to_vec());
        }
        self.input_done
    }

    fn feed_input_block(
        &mut self,
        block_id: BlockId,
        relation_id: RelationId,
        _partition_id: Option<PartitionId>,
    ) {
        if relation_id == self.input_relation {
            self.buffered_blocks.push(block_id);
        }
    }

    fn done_feeding_input(&mut self, relation_id: RelationId) {
        if relation_id == self.input_relation {
            self.input_done = true;
        }
    }

    fn output_relation(&self) -> Option<RelationId> {
        self.output_relation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_operator_emits_once() {
        let mut op = BatchOperator::with_work_orders("scan", 3);
        let mut container = WorkOrdersContainer::new(42, 1);

        assert!(op.generate_work_orders(&mut container, 0));
        assert_eq!(container.num_pending(0), 3);

        // A second generation round adds nothing.
        assert!(op.generate_work_orders(&mut container, 0));
        assert_eq!(container.num_pending(0), 3);
    }

    #[test]
    fn relay_operator_follows_streamed_blocks() {
        let mut op = RelayOperator::new("probe", 9);
        let mut container = WorkOrdersContainer::new(42, 1);

        assert!(!op.generate_work_orders(&mut container, 0));
        assert_eq!(container.num_pending(0), 0);

        op.feed_input_block(500, 9, None);
        op.feed_input_block(501, 8, None); // wrong relation, ignored
        assert!(!op.generate_work_orders(&mut container, 0));
        assert_eq!(container.num_pending(0), 1);

        op.done_feeding_input(9);
        assert!(op.generate_work_orders(&mut container, 0));
        assert_eq!(container.num_pending(0), 1);
    }
}
