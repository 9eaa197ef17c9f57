// keel metadata node binary entry point.
//
// Wires the persisted system tables, the local metadata log, and the
// background coordinators into one process, and hosts the CLI and
// logging configuration.

use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use keel_meta::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "keel-node", version, about = "keel cluster metadata node")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Node(NodeArgs),
}

/// CLI options for running a node.
#[derive(Parser, Debug)]
pub struct NodeArgs {
    #[arg(long, env = "KEEL_NODE_ID")]
    node_id: u64,

    #[arg(long, env = "KEEL_DATA_DIR")]
    data_dir: String,

    /// Number of shards the node serves queries from.
    #[arg(long, env = "KEEL_SHARDS", default_value_t = 2)]
    shards: u32,

    /// Cap on concurrently held consensus voter seats.
    #[arg(long, env = "KEEL_MAX_VOTERS", default_value_t = 3)]
    max_voters: usize,

    /// Metadata batch commit timeout (ms). `0` waits indefinitely.
    #[arg(long, env = "KEEL_COMMIT_TIMEOUT_MS", default_value_t = 10_000)]
    commit_timeout_ms: u64,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args).await,
    }
}

/// Open the node's state and run until interrupted.
pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Open the node's state and run until `shutdown` resolves.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    let data_dir = PathBuf::from(&args.data_dir);
    fs::create_dir_all(&data_dir).context("create data dir")?;

    let commit_timeout = if args.commit_timeout_ms == 0 {
        None
    } else {
        Some(Duration::from_millis(args.commit_timeout_ms))
    };
    let node = Node::open(NodeConfig {
        node_id: args.node_id,
        data_dir,
        shard_count: args.shards,
        max_voters: args.max_voters,
        commit_timeout,
    })?;

    node.start_view_building_coordinator();
    node.voters().insert_voter(args.node_id).await?;
    tracing::info!(node_id = args.node_id, "node running");

    shutdown.await.context("wait for shutdown signal")?;
    tracing::info!("shutting down");
    node.shutdown().await;
    Ok(())
}
