//! The coordinator core: per-query state machines, admission control, worker
//! capacity bookkeeping, and the Foreman event loop that ties them together.

pub mod container;
pub mod dag;
pub mod directory;
pub mod foreman;
pub mod operator;
pub mod policy;
pub mod query_manager;
pub mod state;

use crate::bus::{ClientId, MessageBus};

/// Process-unique, monotonically assigned query identifier.
pub type QueryId = u64;

/// Index of an operator node within a query's DAG.
pub type OperatorIndex = usize;

pub use container::WorkOrdersContainer;
pub use dag::{QueryDag, QueryHandle};
pub use directory::ShiftbossDirectory;
pub use foreman::Foreman;
pub use operator::{BatchOperator, Operator, RelayOperator, WorkOrder};
pub use policy::{PolicyEnforcer, WorkOrderTimeEntry};
pub use query_manager::{OperatorStatus, QueryManager};
pub use state::QueryExecutionState;

/// Borrowed view of the dispatch environment, handed down to code that needs
/// to send coordinator-originated messages (query initiation, rebuild
/// initiation) without owning the bus or the directory.
pub struct DispatchCtx<'a> {
    pub bus: &'a MessageBus,
    pub foreman_client_id: ClientId,
    pub directory: &'a ShiftbossDirectory,
}
