mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use apilog_kernel::buffer::OverflowPolicy;
use apilog_kernel::catalog::ObjectStoreCatalog;
use apilog_kernel::config::NodeConfig;
use apilog_kernel::layout::TableLocation;
use apilog_kernel::lease::ObjectStoreLock;
use apilog_kernel::node::{Node, NodeReport};
use apilog_kernel::record::LogRecord;
use apilog_kernel::replay::replay_history;
use apilog_kernel::simulate::{simulate_cluster, SimulationConfig};
use apilog_kernel::storage::{InMemoryObjectStore, LocalObjectStore, ObjectStore};

/// API log table writer
#[derive(Parser, Debug)]
#[command(name = "apilog")]
#[command(about = "Buffers API access logs and commits them to a shared table", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a writer node fed with JSON-lines records on stdin
    Run(RunArgs),

    /// Simulate a cluster in-process and print a JSON report
    Simulate(SimulateArgs),

    /// Replay and validate a table's history
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to node config JSON
    #[arg(long, env = "APILOG_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "APILOG_NODE_ID")]
    node_id: Option<String>,

    /// Warehouse root directory shared by all nodes
    #[arg(long, env = "APILOG_WAREHOUSE")]
    warehouse: Option<PathBuf>,

    #[arg(long, env = "APILOG_NAMESPACE")]
    namespace: Option<String>,

    #[arg(long, env = "APILOG_TABLE")]
    table: Option<String>,

    #[arg(long, env = "APILOG_WRITE_INTERVAL_MS")]
    write_interval_ms: Option<u64>,

    #[arg(long, env = "APILOG_COMMIT_INTERVAL_MS")]
    commit_interval_ms: Option<u64>,

    #[arg(long, env = "APILOG_LEASE_TTL_MS")]
    lease_ttl_ms: Option<u64>,

    #[arg(long, env = "APILOG_BATCH_SIZE")]
    batch_size: Option<usize>,

    #[arg(long, env = "APILOG_BUFFER_CAPACITY")]
    buffer_capacity: Option<usize>,

    /// Failed batches kept for retry before the oldest is dropped
    #[arg(long, env = "APILOG_MAX_BACKLOG_BATCHES")]
    max_backlog_batches: Option<usize>,

    /// `drop-oldest` or `drop-newest`
    #[arg(long, env = "APILOG_OVERFLOW_POLICY", value_parser = parse_policy)]
    overflow_policy: Option<OverflowPolicy>,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Path to simulation config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use a directory instead of memory as the shared warehouse
    #[arg(long)]
    warehouse: Option<PathBuf>,

    #[arg(long)]
    nodes: Option<usize>,

    #[arg(long)]
    rounds: Option<u64>,

    #[arg(long)]
    events_per_round: Option<usize>,

    #[arg(long)]
    crash_leader_at: Option<u64>,

    /// Storage outage as `START..END` rounds
    #[arg(long, value_parser = parse_rounds)]
    outage: Option<(u64, u64)>,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[arg(long, env = "APILOG_WAREHOUSE")]
    warehouse: PathBuf,

    #[arg(long, env = "APILOG_NAMESPACE", default_value = "minio")]
    namespace: String,

    #[arg(long, env = "APILOG_TABLE", default_value = "api_logs")]
    table: String,
}

fn parse_policy(s: &str) -> Result<OverflowPolicy, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown overflow policy `{s}`"))
}

fn parse_rounds(s: &str) -> Result<(u64, u64), String> {
    let (start, end) = s
        .split_once("..")
        .ok_or_else(|| format!("expected START..END, got `{s}`"))?;
    let start = start.parse().map_err(|e| format!("bad start: {e}"))?;
    let end = end.parse().map_err(|e| format!("bad end: {e}"))?;
    Ok((start, end))
}

/// Final output of `apilog run`
#[derive(Debug, Serialize)]
struct RunOutput {
    #[serde(flatten)]
    report: NodeReport,
    rejected_lines: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Simulate(args) => simulate(args).await,
        Command::Inspect(args) => inspect(args).await,
    }
}

fn node_config(args: RunArgs) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };

    if let Some(v) = args.node_id {
        config.node_id = v;
    }
    if let Some(v) = args.warehouse {
        config.warehouse = v;
    }
    if let Some(v) = args.namespace {
        config.namespace = v;
    }
    if let Some(v) = args.table {
        config.table = v;
    }
    if let Some(v) = args.write_interval_ms {
        config.write_interval_ms = v;
    }
    if let Some(v) = args.commit_interval_ms {
        config.commit_interval_ms = v;
    }
    if let Some(v) = args.lease_ttl_ms {
        config.lease_ttl_ms = v;
    }
    if let Some(v) = args.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = args.buffer_capacity {
        config.buffer_capacity = v;
    }
    if let Some(v) = args.max_backlog_batches {
        config.max_backlog_batches = v;
    }
    if let Some(v) = args.overflow_policy {
        config.overflow_policy = v;
    }

    config.validate()?;
    Ok(config)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = node_config(args)?;
    let node_id = config.node();

    let store: Arc<dyn ObjectStore> = Arc::new(
        LocalObjectStore::open(&config.warehouse)
            .await
            .with_context(|| format!("opening warehouse {}", config.warehouse.display()))?,
    );
    let lock = Arc::new(ObjectStoreLock::new(store.clone(), config.location()));
    let node = Node::start(config, store, lock).await?;
    let buffer = node.buffer();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut rejected_lines = 0u64;
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            _ = &mut interrupted => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogRecord>(&line) {
                    Ok(mut record) => {
                        if record.node.as_str().is_empty() {
                            record.node = node_id.clone();
                        }
                        buffer.record(record);
                    }
                    Err(e) => {
                        rejected_lines += 1;
                        tracing::warn!(error = %e, "rejected input line");
                    }
                }
            }
        }
    }

    let output = RunOutput {
        report: node.shutdown().await?,
        rejected_lines,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn simulate(args: SimulateArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<SimulationConfig>(&data)?
        }
        None => SimulationConfig::default(),
    };
    if let Some(v) = args.nodes {
        config.nodes = v;
    }
    if let Some(v) = args.rounds {
        config.rounds = v;
    }
    if let Some(v) = args.events_per_round {
        config.events_per_round = v;
    }
    if args.crash_leader_at.is_some() {
        config.crash_leader_at = args.crash_leader_at;
    }
    if args.outage.is_some() {
        config.outage = args.outage;
    }
    if let Some(v) = args.seed {
        config.seed = v;
    }

    let store: Arc<dyn ObjectStore> = match &args.warehouse {
        Some(dir) => Arc::new(LocalObjectStore::open(dir).await?),
        None => Arc::new(InMemoryObjectStore::new()),
    };

    let result = simulate_cluster(config, store).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.is_consistent() {
        anyhow::bail!("simulation finished with an inconsistent table");
    }
    Ok(())
}

async fn inspect(args: InspectArgs) -> Result<()> {
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::open(&args.warehouse).await?);
    let catalog =
        ObjectStoreCatalog::open(store, TableLocation::new(args.namespace, args.table)).await?;
    let report = replay_history(&catalog).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_outage_range() {
        assert_eq!(parse_rounds("4..9").unwrap(), (4, 9));
        assert!(parse_rounds("4-9").is_err());
    }

    #[test]
    fn parses_overflow_policy() {
        assert_eq!(parse_policy("drop-newest").unwrap(), OverflowPolicy::DropNewest);
        assert!(parse_policy("drop-all").is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "apilog",
            "run",
            "--node-id",
            "minio2",
            "--batch-size",
            "10",
            "--overflow-policy",
            "drop-newest",
            "--max-backlog-batches",
            "3",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = node_config(args).unwrap();
        assert_eq!(config.node_id, "minio2");
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.max_backlog_batches, 3);
        assert_eq!(config.namespace, "minio");
    }

    #[test]
    fn zero_backlog_flag_is_rejected() {
        let cli = Cli::try_parse_from(["apilog", "run", "--max-backlog-batches", "0"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(node_config(args).is_err());
    }
}
