/// Configuration for the coordinator side of the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of queries executing concurrently. Queries admitted
    /// past this bound wait in a FIFO queue.
    pub max_concurrent_queries: usize,

    /// Maximum number of work orders collected from the admitted queries in
    /// a single dispatch round. The budget is split evenly across queries.
    pub max_messages_per_dispatch_round: usize,

    /// Record per-work-order execution times. Recorded entries are retained
    /// after the query itself is removed.
    pub profile_work_orders: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 1,
            max_messages_per_dispatch_round: 20,
            profile_work_orders: false,
        }
    }
}

/// Configuration for a single worker process.
#[derive(Debug, Clone)]
pub struct ShiftbossConfig {
    /// Maximum number of work orders this worker may have queued at once.
    /// The Foreman never exceeds this; it is the backpressure limit.
    pub work_order_capacity: usize,
}

impl Default for ShiftbossConfig {
    fn default() -> Self {
        Self {
            work_order_capacity: 8,
        }
    }
}
