use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quarry::bus::{ClientId, MessageBus, MessageKind, SchedulerMessage, SendStatus};
use quarry::catalog::{Catalog, InMemoryCatalog, RelationId};
use quarry::config::{SchedulerConfig, ShiftbossConfig};
use quarry::error::SchedulerError;
use quarry::scheduler::{
    BatchOperator, Foreman, QueryDag, QueryHandle, QueryId, RelayOperator, WorkOrder,
};
use quarry::shiftboss::{NewBlock, Shiftboss, WorkOrderArtifacts, WorkOrderExecutor};

#[derive(Parser, Debug)]
#[command(name = "quarry")]
#[command(version)]
#[command(about = "A work-order scheduling engine for DAG-structured queries")]
struct Args {
    /// Number of shiftboss workers to start
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Per-worker queued work order capacity
    #[arg(long, default_value = "8")]
    capacity: usize,

    /// Number of demo queries to submit
    #[arg(long, default_value = "2")]
    queries: u64,

    /// Work orders generated by each query's scan operator
    #[arg(long, default_value = "4")]
    scan_work_orders: usize,

    /// Queries admitted to execution concurrently; the rest wait in FIFO order
    #[arg(long, default_value = "1")]
    max_concurrent: usize,

    /// Record per-work-order timing and print it as CSV on exit
    #[arg(long)]
    profile: bool,

    /// Print each query's result relation metadata as JSON
    #[arg(long)]
    json: bool,
}

/// Demo execution engine. A payload carrying a known relation id commits one
/// fresh block into that relation; anything else is a no-op.
struct DemoExecutor {
    catalog: Arc<InMemoryCatalog>,
    next_block_id: Arc<AtomicU64>,
}

impl WorkOrderExecutor for DemoExecutor {
    fn execute(&mut self, order: &WorkOrder) -> WorkOrderArtifacts {
        let mut artifacts = WorkOrderArtifacts::default();
        if let Ok(bytes) = <[u8; 8]>::try_from(order.payload.as_slice()) {
            let relation_id = RelationId::from_le_bytes(bytes);
            if self.catalog.relation(relation_id).is_some() {
                artifacts.new_blocks.push(NewBlock {
                    relation_id,
                    block_id: self.next_block_id.fetch_add(1, Ordering::Relaxed),
                    partition_id: None,
                });
            }
        }
        artifacts
    }
}

/// A two-operator demo query: a scan producing blocks into an intermediate
/// relation, pipelined into a relay that emits one work order per block.
fn build_demo_query(query_id: QueryId, scan_work_orders: usize) -> (QueryHandle, RelationId) {
    let scan_relation = 100 + query_id * 2;
    let result_relation = scan_relation + 1;

    let payloads = vec![scan_relation.to_le_bytes().to_vec(); scan_work_orders];
    let mut dag = QueryDag::new();
    let scan = dag.add_operator(Box::new(
        BatchOperator::new("scan", payloads).output_relation(scan_relation),
    ));
    let relay = dag.add_operator(Box::new(
        RelayOperator::new("relay", scan_relation).output_relation(result_relation),
    ));
    dag.add_dependency(scan, relay, false);

    let handle = QueryHandle::new(query_id, dag).with_result_relation(result_relation);
    (handle, scan_relation)
}

fn send_checked(
    conn: &quarry::bus::BusConnection,
    to: ClientId,
    message: SchedulerMessage,
) -> Result<(), SchedulerError> {
    let kind = message.kind();
    let status = conn.send(to, message);
    if status != SendStatus::Ok {
        return Err(SchedulerError::SendFailed {
            kind,
            from: conn.client_id(),
            to,
            status,
        });
    }
    Ok(())
}

/// Cancelled on SIGTERM or ctrl-c. The driver reacts by poisoning the
/// Foreman, which drains the cluster before exiting.
fn shutdown_token() -> io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let token = CancellationToken::new();
    let handler = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("caught SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("caught interrupt"),
        }
        handler.cancel();
    });
    Ok(token)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let shutdown = shutdown_token()?;

    let bus = MessageBus::new();
    let catalog = Arc::new(InMemoryCatalog::new());
    let next_block_id = Arc::new(AtomicU64::new(1_000_000));

    let config = SchedulerConfig {
        max_concurrent_queries: args.max_concurrent,
        profile_work_orders: args.profile,
        ..SchedulerConfig::default()
    };
    let mut foreman = Foreman::new(&bus, catalog.clone(), config);
    let foreman_id = foreman.client_id();
    let foreman_task = tokio::spawn(async move {
        let result = foreman.run().await;
        (foreman, result)
    });

    for _ in 0..args.workers {
        let shiftboss = Shiftboss::new(
            &bus,
            foreman_id,
            DemoExecutor {
                catalog: catalog.clone(),
                next_block_id: next_block_id.clone(),
            },
            ShiftbossConfig {
                work_order_capacity: args.capacity,
            },
        );
        tokio::spawn(shiftboss.run());
    }

    let mut client = bus.connect();
    client.register_sender(MessageKind::AdmitRequest);
    client.register_sender(MessageKind::Poison);
    client.register_receiver(MessageKind::QueryExecutionSuccess);

    let mut handles = Vec::new();
    for query_id in 0..args.queries {
        let (handle, scan_relation) = build_demo_query(query_id, args.scan_work_orders);
        catalog.create_relation(scan_relation, format!("scan_{query_id}"));
        catalog.create_relation(scan_relation + 1, format!("result_{query_id}"));
        handles.push(handle);
    }
    info!(
        num_queries = args.queries,
        num_workers = args.workers,
        max_concurrent = args.max_concurrent,
        "submitting demo queries"
    );
    send_checked(&client, foreman_id, SchedulerMessage::AdmitRequest { handles })?;

    let mut completed = 0;
    while completed < args.queries {
        tokio::select! {
            _ = shutdown.cancelled() => {
                warn!(completed, "shutdown requested before all queries finished");
                break;
            }
            envelope = client.receive() => {
                let Some(envelope) = envelope else { break };
                match envelope.message {
                    SchedulerMessage::QueryExecutionSuccess { result } => {
                        completed += 1;
                        match result {
                            Some(relation) => {
                                info!(
                                    relation = %relation.name,
                                    num_blocks = relation.blocks.len(),
                                    "query finished"
                                );
                                if args.json {
                                    println!("{}", serde_json::to_string(&relation)?);
                                }
                            }
                            None => info!("query finished without a result relation"),
                        }
                    }
                    other => warn!(kind = ?other.kind(), "client ignoring unexpected message"),
                }
            }
        }
    }

    send_checked(&client, foreman_id, SchedulerMessage::Poison)?;
    let (foreman, result) = foreman_task.await?;
    result?;

    if args.profile {
        let mut out = io::stdout();
        for query_id in 0..args.queries {
            foreman.write_profiling_results(query_id, &mut out)?;
        }
    }

    Ok(())
}
