//! Holding area for generated-but-undispatched work orders, one FIFO per
//! operator.

use std::collections::VecDeque;

use crate::scheduler::operator::WorkOrder;
use crate::scheduler::{OperatorIndex, QueryId};

/// Pending work orders for one query, grouped by operator. Orders leave the
/// container when the QueryManager hands them to the dispatch layer.
#[derive(Debug)]
pub struct WorkOrdersContainer {
    query_id: QueryId,
    pending: Vec<VecDeque<WorkOrder>>,
}

impl WorkOrdersContainer {
    pub fn new(query_id: QueryId, num_operators: usize) -> Self {
        Self {
            query_id,
            pending: (0..num_operators).map(|_| VecDeque::new()).collect(),
        }
    }

    /// Enqueue a new work order for the operator. The payload stays opaque.
    pub fn push(&mut self, operator_index: OperatorIndex, payload: Vec<u8>) {
        debug_assert!(operator_index < self.pending.len());
        self.pending[operator_index].push_back(WorkOrder::new(self.query_id, operator_index, payload));
    }

    pub fn pop(&mut self, operator_index: OperatorIndex) -> Option<WorkOrder> {
        debug_assert!(operator_index < self.pending.len());
        self.pending[operator_index].pop_front()
    }

    pub fn num_pending(&self, operator_index: OperatorIndex) -> usize {
        debug_assert!(operator_index < self.pending.len());
        self.pending[operator_index].len()
    }

    pub fn has_pending(&self, operator_index: OperatorIndex) -> bool {
        self.num_pending(operator_index) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_leave_in_fifo_order_per_operator() {
        let mut container = WorkOrdersContainer::new(1, 2);
        container.push(0, vec![1]);
        container.push(0, vec![2]);
        container.push(1, vec![3]);

        assert_eq!(container.num_pending(0), 2);
        assert_eq!(container.pop(0).unwrap().payload, vec![1]);
        assert_eq!(container.pop(0).unwrap().payload, vec![2]);
        assert!(container.pop(0).is_none());
        assert!(container.has_pending(1));
    }
}
