//! The operator DAG handed over by the optimizer, and the query handle that
//! wraps it on its way into the scheduler.

use std::fmt;

use crate::bus::ClientId;
use crate::catalog::RelationId;
use crate::scheduler::operator::Operator;
use crate::scheduler::{OperatorIndex, QueryId};

/// Directed acyclic graph of operator instances. An edge from producer to
/// consumer carries a pipeline-breaker flag: breaker edges are blocking
/// dependencies, non-breaker edges allow block streaming between the two
/// operators.
pub struct QueryDag {
    nodes: Vec<Box<dyn Operator>>,
    // (consumer, is_pipeline_breaker) per producer.
    dependents: Vec<Vec<(OperatorIndex, bool)>>,
    // (producer, is_pipeline_breaker) per consumer.
    dependencies: Vec<Vec<(OperatorIndex, bool)>>,
}

impl QueryDag {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            dependents: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn add_operator(&mut self, operator: Box<dyn Operator>) -> OperatorIndex {
        self.nodes.push(operator);
        self.dependents.push(Vec::new());
        self.dependencies.push(Vec::new());
        self.nodes.len() - 1
    }

    /// Link `producer` to `consumer`. A pipeline-breaker edge blocks the
    /// consumer until the producer is terminal; a streaming edge lets blocks
    /// flow while the producer is still running.
    pub fn add_dependency(
        &mut self,
        producer: OperatorIndex,
        consumer: OperatorIndex,
        pipeline_breaker: bool,
    ) {
        self.dependents[producer].push((consumer, pipeline_breaker));
        self.dependencies[consumer].push((producer, pipeline_breaker));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn operator(&self, index: OperatorIndex) -> &dyn Operator {
        self.nodes[index].as_ref()
    }

    pub fn operator_mut(&mut self, index: OperatorIndex) -> &mut dyn Operator {
        self.nodes[index].as_mut()
    }

    pub fn dependents(&self, index: OperatorIndex) -> &[(OperatorIndex, bool)] {
        &self.dependents[index]
    }

    pub fn dependencies(&self, index: OperatorIndex) -> &[(OperatorIndex, bool)] {
        &self.dependencies[index]
    }
}

impl Default for QueryDag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryDag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDag")
            .field("operators", &self.nodes.iter().map(|op| op.name()).collect::<Vec<_>>())
            .field("dependents", &self.dependents)
            .finish()
    }
}

/// An admitted-or-admittable query: its id, its operator DAG, and where its
/// result goes. Produced by the optimizer, consumed by the PolicyEnforcer.
pub struct QueryHandle {
    query_id: QueryId,
    dag: QueryDag,
    result_relation: Option<RelationId>,
    client_id: Option<ClientId>,
}

impl QueryHandle {
    pub fn new(query_id: QueryId, dag: QueryDag) -> Self {
        Self {
            query_id,
            dag,
            result_relation: None,
            client_id: None,
        }
    }

    /// Relation holding the query's result, to be persisted and reported to
    /// the client on completion.
    pub fn with_result_relation(mut self, relation_id: RelationId) -> Self {
        self.result_relation = Some(relation_id);
        self
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn result_relation(&self) -> Option<RelationId> {
        self.result_relation
    }

    /// Stamped by the Foreman from the admit request's envelope.
    pub fn set_client_id(&mut self, client_id: ClientId) {
        self.client_id = Some(client_id);
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub(crate) fn into_parts(self) -> (QueryId, QueryDag, Option<RelationId>, Option<ClientId>) {
        (self.query_id, self.dag, self.result_relation, self.client_id)
    }
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("query_id", &self.query_id)
            .field("num_operators", &self.dag.len())
            .field("result_relation", &self.result_relation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::operator::BatchOperator;

    #[test]
    fn edges_are_mirrored() {
        let mut dag = QueryDag::new();
        let scan = dag.add_operator(Box::new(BatchOperator::with_work_orders("scan", 1)));
        let agg = dag.add_operator(Box::new(BatchOperator::with_work_orders("agg", 1)));
        dag.add_dependency(scan, agg, true);

        assert_eq!(dag.dependents(scan), &[(agg, true)]);
        assert_eq!(dag.dependencies(agg), &[(scan, true)]);
        assert!(dag.dependencies(scan).is_empty());
    }
}
