use benchmark_scheduler::logging::init_logging;
use benchmark_scheduler::store::NodeId;
use benchmark_scheduler::store::memory::MemoryCluster;
use benchmark_scheduler::{ClusterContext, SchedulerConfig, TaskManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<String> = None;
    let mut node_id: Option<NodeId> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                config_path = Some(args[i + 1].clone());
                i += 2;
            }
            "--node-id" if i + 1 < args.len() => {
                node_id = Some(NodeId(args[i + 1].clone()));
                i += 2;
            }
            "--help" | "-h" => {
                eprintln!("Usage: {} [--config <file>] [--node-id <id>]", args[0]);
                eprintln!("Settings may also be given as SCHEDULER__<KEY> environment variables.");
                return Ok(());
            }
            other => {
                eprintln!("Ignoring unknown argument '{}'", other);
                i += 1;
            }
        }
    }

    let config = SchedulerConfig::load(config_path.as_deref())?;
    init_logging(&config.log_filter);

    let node_id = node_id.unwrap_or_default();
    tracing::info!(node = %node_id, ?config, "starting scheduler node");

    // 1. Store:
    let cluster = MemoryCluster::new();
    let node = cluster.join(node_id);
    let evictor = cluster.spawn_evictor(config.eviction_period());

    // 2. Scheduler:
    let context = ClusterContext::from_memory(&node, config)?;
    context.contexts().ensure_generator_context().await?;
    let manager = TaskManager::start(context);

    // 3. Run until interrupted:
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    manager.stop().await;
    evictor.abort();
    cluster.leave(node.node_id());

    Ok(())
}
