//! WolfShard - Shard Replication Consistency Manager
//!
//! Runs one participant: follower services on the replication address,
//! leader replication for the shards this node leads, and the HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfshard::api::HttpServer;
use wolfshard::config::WolfShardConfig;
use wolfshard::error::{Error, Result};
use wolfshard::network::{NetworkServer, NetworkTransport};
use wolfshard::node::ShardNode;
use wolfshard::state::{ConfigurationStore, MemoryConfigStore, StateTracker};

/// WolfShard - Shard Replication Consistency Manager
#[derive(Parser)]
#[command(name = "wolfshard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfshard.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfShard node
    Start,

    /// Show shard status of a running node
    Status {
        /// HTTP API address of the node
        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfshard.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Status { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "pretty");
            run_status(address).await
        }
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the WolfShard node
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = match WolfShardConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            init_logging(log_level.as_deref().unwrap_or("info"), "pretty");
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    init_logging(
        log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );

    tracing::info!("Starting WolfShard node {}", config.node.id);

    let state_dir = config.state_dir();
    std::fs::create_dir_all(&state_dir)?;
    let tracker = Arc::new(StateTracker::new(state_dir, config.node.id.clone())?);
    tracker.mark_started().await?;

    let config_store: Arc<dyn ConfigurationStore> = Arc::new(MemoryConfigStore::from_config(&config));
    let transport = Arc::new(NetworkTransport::from_config(&config));

    let node = Arc::new(ShardNode::new(
        config.clone(),
        transport.clone(),
        Some(tracker),
        Some(config_store),
    ));

    // Followers must be reachable before leaders start resyncing them
    let server = Arc::new(NetworkServer::new(
        config.node.bind_address.clone(),
        node.follower.clone(),
    ));
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("Replication server failed: {}", e);
            }
        })
    };

    node.bootstrap().await?;
    tracing::info!(
        "Node {} leads {} shards and follows {}",
        node.node_id(),
        config.led_shards().count(),
        config.followed_shards().count()
    );

    let http = HttpServer::new(config.api.clone(), node.clone());
    let http_task = tokio::spawn(async move {
        if let Err(e) = http.start().await {
            tracing::error!("HTTP API failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    node.shutdown();
    server.stop();
    transport.client().close_all().await;
    http_task.abort();
    let _ = server_task.await;

    tracing::info!("WolfShard node stopped");
    Ok(())
}

/// Show status of a running node
async fn run_status(address: String) -> Result<()> {
    for path in ["health", "shards"] {
        let url = format!("http://{}/{}", address, path);
        let response = reqwest::get(&url)
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        println!("{}", serde_json::to_string_pretty(&body)?);
    }
    Ok(())
}

/// Write a starter configuration
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfShard Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7700"
data_dir = "/var/lib/wolfshard/{node_id}"

[replication]
ack_timeout_ms = 2000
max_sequence_gap = 1024
gap_timeout_ms = 500
intermediate_commit_threshold = 10000
compaction_interval = 256

[digest]
fanout = 16
leaf_rows = 64
rebuild_storm_threshold = 3
rebuild_window_secs = 60
batch_ttl_secs = 120

[reconcile]
suspicion_budget = 2
resync_ttl_ms = 600000
max_passes = 16
repair_batch_size = 256
restart_backoff_ms = 1000

[api]
enabled = true
bind_address = "0.0.0.0:8090"
cors_enabled = false

[logging]
level = "info"
format = "pretty"

# [[peers]]
# id = "node-2"
# address = "node-2.example.com:7700"

# [[shards]]
# id = "users"
# leader = "{node_id}"
# followers = ["node-2"]
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nAdd peers and shards, then start with: wolfshard start --config {}", output.display());

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfShardConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  Node ID:  {}", config.node.id);
            println!("  Peers:    {}", config.peers.len());
            println!("  Shards:   {}", config.shards.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfShardConfig::from_file(&config_path)?;

    println!("WolfShard Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Data Directory:   {}", config.node.data_dir.display());
    println!();
    println!("Replication:");
    println!("  Ack Timeout:    {} ms", config.replication.ack_timeout_ms);
    println!("  Max Seq Gap:    {}", config.replication.max_sequence_gap);
    println!("  Txn Threshold:  {}", config.replication.intermediate_commit_threshold);
    println!();
    println!("Reconciliation:");
    println!("  Budget:         {}", config.reconcile.suspicion_budget);
    println!("  Resync TTL:     {} ms", config.reconcile.resync_ttl_ms);
    println!("  Max Passes:     {}", config.reconcile.max_passes);
    println!();
    println!("Shards:");
    for shard in &config.shards {
        let role = if shard.leader == config.node.id {
            "leader"
        } else if shard.followers.contains(&config.node.id) {
            "follower"
        } else {
            "-"
        };
        println!(
            "  {:<16} {:<9} leader={} followers={:?}",
            shard.id, role, shard.leader, shard.followers
        );
    }

    Ok(())
}
