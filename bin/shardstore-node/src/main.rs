//! Shardstore Storage Node
//!
//! Stores erasure-coded shard blobs for one tier. Registers itself in
//! the metadata service's node directory at startup and sweeps orphaned
//! shards in the background.

mod service;
mod sweeper;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use shardstore_catalog::StorageNode;
use shardstore_client::MetaClient;
use shardstore_common::{NodeId, Tier};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardstore-node")]
#[command(about = "Shardstore Storage Node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/shardstore/node.toml")]
    config: String,

    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Address advertised to the metadata service
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Data directory for shard blobs and sidecars
    #[arg(long)]
    data_dir: Option<String>,

    /// Tier label this node serves (hot|cold)
    #[arg(long)]
    tier: Option<Tier>,

    /// Metadata service endpoint
    #[arg(long)]
    meta_endpoint: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    node: NodeConfig,
    #[serde(default)]
    sweeper: SweeperFileConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct NodeConfig {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default)]
    advertise_addr: Option<String>,
    #[serde(default = "default_data_dir")]
    data_dir: String,
    #[serde(default)]
    tier: Option<Tier>,
    #[serde(default = "default_meta_endpoint")]
    meta_endpoint: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            advertise_addr: None,
            data_dir: default_data_dir(),
            tier: None,
            meta_endpoint: default_meta_endpoint(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SweeperFileConfig {
    #[serde(default = "default_sweep_interval")]
    interval_secs: u64,
    #[serde(default = "default_sweep_grace")]
    grace_secs: u64,
}

impl Default for SweeperFileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            grace_secs: default_sweep_grace(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

fn default_listen() -> String {
    "0.0.0.0:7411".to_string()
}

fn default_data_dir() -> String {
    "/var/lib/shardstore/node".to_string()
}

fn default_meta_endpoint() -> String {
    "http://localhost:7400".to_string()
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_sweep_grace() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Node id is minted once and persisted, so restarts keep their identity
fn load_or_create_node_id(data_dir: &std::path::Path) -> Result<NodeId> {
    let path = data_dir.join("node_id");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        if let Ok(id) = existing.trim().parse::<NodeId>() {
            return Ok(id);
        }
        warn!("unparseable node_id file, minting a new identity");
    }
    let id = NodeId::new();
    std::fs::write(&path, id.to_string())?;
    Ok(id)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config: Config = if std::path::Path::new(&args.config).exists() {
        let raw = std::fs::read_to_string(&args.config)?;
        toml::from_str(&raw).unwrap_or_else(|e| {
            eprintln!("Warning: failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };

    // CLI takes precedence over the config file.
    let listen = args.listen.unwrap_or(config.node.listen);
    let data_dir = PathBuf::from(args.data_dir.unwrap_or(config.node.data_dir));
    let tier = args.tier.or(config.node.tier).unwrap_or(Tier::Hot);
    let meta_endpoint = args.meta_endpoint.unwrap_or(config.node.meta_endpoint);
    let advertise = args
        .advertise_addr
        .or(config.node.advertise_addr)
        .unwrap_or_else(|| format!("http://{}", listen.replace("0.0.0.0", "127.0.0.1")));
    let log_level = if args.log_level != "info" {
        args.log_level
    } else {
        config.logging.level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Shardstore Storage Node");
    std::fs::create_dir_all(&data_dir)?;

    let node_id = load_or_create_node_id(&data_dir)?;
    let state = Arc::new(service::NodeState::new(
        node_id,
        advertise.clone(),
        tier,
        data_dir,
    )?);
    service::log_startup(&state);

    let meta = MetaClient::new(&meta_endpoint).map_err(|e| anyhow::anyhow!("{e}"))?;

    // Announce ourselves to the node directory; the catalog upsert is
    // idempotent so restarts just refresh the record. Registration is
    // retried with backoff for ~30s, then surfaced and abandoned (the
    // node still serves reads for shards it already holds).
    {
        let record = StorageNode {
            node_id,
            address: advertise.clone(),
            tier,
            registered_at: 0,
        };
        let meta = meta.clone();
        tokio::spawn(async move {
            for attempt in 1..=6u32 {
                match meta.register_node(&record).await {
                    Ok(()) => {
                        info!(endpoint = %meta.base(), "registered with metadata service");
                        return;
                    }
                    Err(e) if e.is_retryable() && attempt < 6 => {
                        warn!(attempt, error = %e, "registration failed, retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Err(e) => {
                        error!(error = %e, "registration failed; node will not receive placements");
                        return;
                    }
                }
            }
        });
    }

    tokio::spawn(service::disk_usage_loop(state.clone()));
    tokio::spawn(sweeper::run(
        state.clone(),
        meta,
        sweeper::SweeperConfig {
            interval: Duration::from_secs(config.sweeper.interval_secs),
            grace: Duration::from_secs(config.sweeper.grace_secs),
        },
    ));

    let router = service::router(state);
    let listener = TcpListener::bind(&listen).await?;
    info!(listen = %listen, advertise = %advertise, "serving");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    info!("Storage node shut down gracefully");
    Ok(())
}
