//! Shardstore Metadata Service
//!
//! One process per consensus member: the raft node, the catalog state
//! machine, and the REST API in front of both. The first node
//! bootstraps itself via `POST /cluster/init`; later nodes start empty
//! and join through `POST /cluster/join` on any member.

mod api;
mod app;
mod migrate;
mod network;
mod store;

use anyhow::Result;
use app::App;
use clap::Parser;
use network::Network;
use openraft::{Config, SnapshotPolicy};
use shardstore_catalog::Catalog;
use shardstore_client::NodeClient;
use shardstore_common::ErasureParams;
use shardstore_erasure::ShardCodec;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use store::{LogStore, StateMachineStore};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardstore-meta")]
#[command(about = "Shardstore Metadata Service")]
#[command(version)]
struct Args {
    /// Raft node id (stable across restarts, unique in the cluster)
    #[arg(long)]
    node_id: u64,

    /// Listen address for the HTTP API and raft transport
    #[arg(short, long, default_value = "0.0.0.0:7400")]
    listen: String,

    /// Address other nodes and clients use to reach this one
    /// (defaults to http://<listen>)
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Data directory for the raft log and catalog snapshots
    #[arg(long, default_value = "/var/lib/shardstore/meta")]
    data_dir: PathBuf,

    /// Erasure coding data shards (k)
    #[arg(long, default_value = "6")]
    ec_k: u8,

    /// Erasure coding parity shards (m)
    #[arg(long, default_value = "3")]
    ec_m: u8,

    /// Snapshot after this many new log entries
    #[arg(long, default_value = "5000")]
    snapshot_logs: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Shardstore Metadata Service");

    let params = ErasureParams::new(args.ec_k, args.ec_m);
    info!(
        "Erasure coding: k={} m={} ({} shards per object)",
        params.data_shards,
        params.parity_shards,
        params.total_shards()
    );

    std::fs::create_dir_all(&args.data_dir)?;

    let advertise = args
        .advertise_addr
        .clone()
        .unwrap_or_else(|| format!("http://{}", args.listen.replace("0.0.0.0", "127.0.0.1")));

    let catalog = Arc::new(Catalog::new(params));
    let codec = Arc::new(
        ShardCodec::new(params).map_err(|e| anyhow::anyhow!("invalid erasure params: {e}"))?,
    );

    let log_store = LogStore::open(&args.data_dir.join("raft.redb"))?;
    let sm_store = StateMachineStore::open(catalog.clone(), &args.data_dir)?;
    let network = Network::new()?;

    let config = Config {
        heartbeat_interval: 500,
        election_timeout_min: 1500,
        election_timeout_max: 3000,
        snapshot_policy: SnapshotPolicy::LogsSinceLast(args.snapshot_logs),
        ..Default::default()
    };
    let config = Arc::new(config.validate()?);

    let raft = openraft::Raft::new(args.node_id, config, network, log_store, sm_store)
        .await
        .map_err(|e| anyhow::anyhow!("raft startup failed: {e}"))?;

    let state = Arc::new(App {
        id: args.node_id,
        addr: advertise.clone(),
        raft: raft.clone(),
        catalog,
        codec,
        nodes: NodeClient::new().map_err(|e| anyhow::anyhow!("{e}"))?,
        migrations: migrate::MigrationRegistry::default(),
        api_metrics: app::ApiMetrics::default(),
        start_time: Instant::now(),
    });

    let router = api::router(state);

    let listener = TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, advertise = %advertise, node = args.node_id, "serving");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    // In-flight requests have drained; stop the raft core last.
    raft.shutdown().await.ok();
    info!("Metadata service shut down gracefully");

    Ok(())
}
