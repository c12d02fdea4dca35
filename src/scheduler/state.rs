//! Per-query execution bookkeeping: operator progress flags, dispatched
//! work-order counts, and rebuild-phase accounting.

use std::collections::HashMap;

use crate::scheduler::OperatorIndex;

/// Progress of an operator's rebuild phase. Initiation is broadcast to every
/// registered worker; each worker responds with the number of rebuild work
/// orders it will run. The phase is over once all workers responded and all
/// announced orders completed.
#[derive(Debug, Clone, Copy)]
pub struct RebuildStatus {
    pub initiated: bool,
    /// Workers that have not yet announced their rebuild work-order count.
    pub pending_responses: usize,
    /// Announced rebuild work orders not yet completed.
    pub outstanding: usize,
}

/// Tracks execution progress for one query: which operators finished, how
/// many of their work orders are dispatched and uncompleted, and rebuild
/// state. Indices are validated by the QueryManager before they reach here.
#[derive(Debug)]
pub struct QueryExecutionState {
    num_operators: usize,
    num_finished: usize,
    /// Dispatched, not-yet-completed work orders per operator. Distinct from
    /// pending orders, which have not been dispatched at all.
    queued: Vec<usize>,
    done_generating: Vec<bool>,
    finished: Vec<bool>,
    rebuild_required: Vec<bool>,
    rebuild: HashMap<OperatorIndex, RebuildStatus>,
}

impl QueryExecutionState {
    pub fn new(num_operators: usize) -> Self {
        Self {
            num_operators,
            num_finished: 0,
            queued: vec![0; num_operators],
            done_generating: vec![false; num_operators],
            finished: vec![false; num_operators],
            rebuild_required: vec![false; num_operators],
            rebuild: HashMap::new(),
        }
    }

    pub fn num_operators(&self) -> usize {
        self.num_operators
    }

    pub fn num_finished(&self) -> usize {
        self.num_finished
    }

    pub fn is_query_finished(&self) -> bool {
        self.num_finished == self.num_operators
    }

    pub fn increment_queued(&mut self, index: OperatorIndex) {
        debug_assert!(index < self.num_operators);
        self.queued[index] += 1;
    }

    /// Returns false if no work order was outstanding for the operator, which
    /// the caller must treat as a protocol violation.
    #[must_use]
    pub fn decrement_queued(&mut self, index: OperatorIndex) -> bool {
        debug_assert!(index < self.num_operators);
        if self.queued[index] == 0 {
            return false;
        }
        self.queued[index] -= 1;
        true
    }

    pub fn num_queued(&self, index: OperatorIndex) -> usize {
        debug_assert!(index < self.num_operators);
        self.queued[index]
    }

    pub fn set_done_generating(&mut self, index: OperatorIndex) {
        debug_assert!(index < self.num_operators);
        self.done_generating[index] = true;
    }

    pub fn has_done_generating(&self, index: OperatorIndex) -> bool {
        debug_assert!(index < self.num_operators);
        self.done_generating[index]
    }

    pub fn set_finished(&mut self, index: OperatorIndex) {
        debug_assert!(index < self.num_operators);
        if !self.finished[index] {
            self.finished[index] = true;
            self.num_finished += 1;
        }
    }

    pub fn is_finished(&self, index: OperatorIndex) -> bool {
        debug_assert!(index < self.num_operators);
        self.finished[index]
    }

    pub fn set_rebuild_required(&mut self, index: OperatorIndex) {
        debug_assert!(index < self.num_operators);
        self.rebuild_required[index] = true;
    }

    pub fn is_rebuild_required(&self, index: OperatorIndex) -> bool {
        debug_assert!(index < self.num_operators);
        self.rebuild_required[index]
    }

    pub fn rebuild_initiated(&self, index: OperatorIndex) -> bool {
        self.rebuild.get(&index).map(|s| s.initiated).unwrap_or(false)
    }

    /// Mark rebuild as initiated, awaiting a response from each of
    /// `num_workers` workers.
    pub fn initiate_rebuild(&mut self, index: OperatorIndex, num_workers: usize) {
        debug_assert!(index < self.num_operators);
        self.rebuild.insert(
            index,
            RebuildStatus {
                initiated: true,
                pending_responses: num_workers,
                outstanding: 0,
            },
        );
    }

    /// One worker announced its rebuild work-order count. Returns false if no
    /// response was expected.
    #[must_use]
    pub fn record_rebuild_response(&mut self, index: OperatorIndex, num_work_orders: usize) -> bool {
        match self.rebuild.get_mut(&index) {
            Some(status) if status.initiated && status.pending_responses > 0 => {
                status.pending_responses -= 1;
                status.outstanding += num_work_orders;
                true
            }
            _ => false,
        }
    }

    /// Returns false if no rebuild work order was outstanding.
    #[must_use]
    pub fn decrement_rebuild_outstanding(&mut self, index: OperatorIndex) -> bool {
        match self.rebuild.get_mut(&index) {
            Some(status) if status.initiated && status.outstanding > 0 => {
                status.outstanding -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_rebuild_over(&self, index: OperatorIndex) -> bool {
        self.rebuild
            .get(&index)
            .map(|s| s.initiated && s.pending_responses == 0 && s.outstanding == 0)
            .unwrap_or(false)
    }

    pub fn rebuild_status(&self, index: OperatorIndex) -> Option<RebuildStatus> {
        self.rebuild.get(&index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_finishes_when_all_operators_do() {
        let mut state = QueryExecutionState::new(2);
        assert!(!state.is_query_finished());
        state.set_finished(0);
        state.set_finished(0); // idempotent
        assert_eq!(state.num_finished(), 1);
        state.set_finished(1);
        assert!(state.is_query_finished());
    }

    #[test]
    fn queued_counts_never_go_negative() {
        let mut state = QueryExecutionState::new(1);
        state.increment_queued(0);
        assert!(state.decrement_queued(0));
        assert!(!state.decrement_queued(0));
    }

    #[test]
    fn rebuild_fan_in_over_two_workers() {
        let mut state = QueryExecutionState::new(1);
        state.set_rebuild_required(0);
        state.initiate_rebuild(0, 2);
        assert!(state.rebuild_initiated(0));
        assert!(!state.is_rebuild_over(0));

        assert!(state.record_rebuild_response(0, 2));
        assert!(state.record_rebuild_response(0, 0));
        assert!(!state.record_rebuild_response(0, 0));
        assert!(!state.is_rebuild_over(0));

        assert!(state.decrement_rebuild_outstanding(0));
        assert!(state.decrement_rebuild_outstanding(0));
        assert!(state.is_rebuild_over(0));
        assert!(!state.decrement_rebuild_outstanding(0));
    }
}
