//! Shardstore Tier Migration Daemon
//!
//! Tails the tiering event stream and drives migrations through the
//! metadata service with bounded concurrency.

use anyhow::Result;
use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use shardstore_client::MetaClient;
use shardstore_common::metrics::PROMETHEUS_CONTENT_TYPE;
use shardstore_tiering::{
    JsonlEventStream, MetaMigrationDriver, TierController, TierControllerConfig, TierCounters,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardstore-tierd")]
#[command(about = "Shardstore Tier Migration Daemon")]
#[command(version)]
struct Args {
    /// Tiering event stream (JSONL file appended by the broker bridge)
    #[arg(long)]
    events: PathBuf,

    /// Metadata service endpoint
    #[arg(long, default_value = "http://localhost:7400")]
    meta_endpoint: String,

    /// Minimum model confidence to act on a recommendation
    #[arg(long, default_value = "0.80")]
    confidence_threshold: f64,

    /// Concurrent migrations (queue capacity is twice this)
    #[arg(long, default_value = "5")]
    concurrency: usize,

    /// Seconds between migration status polls
    #[arg(long, default_value = "10")]
    poll_interval_secs: u64,

    /// Per-migration deadline in seconds
    #[arg(long, default_value = "1800")]
    migration_deadline_secs: u64,

    /// Listen address for /metrics and /health
    #[arg(long, default_value = "0.0.0.0:7420")]
    metrics_listen: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

async fn metrics_handler(
    axum::extract::State(counters): axum::extract::State<Arc<TierCounters>>,
) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        counters.render(),
    )
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
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

    info!("Starting Shardstore Tier Migration Daemon");

    let config = TierControllerConfig {
        confidence_threshold: args.confidence_threshold,
        concurrency: args.concurrency,
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        migration_deadline: Duration::from_secs(args.migration_deadline_secs),
    };
    info!(
        threshold = config.confidence_threshold,
        concurrency = config.concurrency,
        queue = config.queue_capacity(),
        "controller configured"
    );

    let meta = MetaClient::new(&args.meta_endpoint).map_err(|e| anyhow::anyhow!("{e}"))?;
    let driver = Arc::new(MetaMigrationDriver::new(meta));
    let controller = TierController::new(config, driver);
    let counters = controller.counters();

    // Metrics endpoint.
    let metrics_app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(counters);
    let listener = TcpListener::bind(&args.metrics_listen).await?;
    info!(listen = %args.metrics_listen, "metrics server up");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, metrics_app).await {
            error!(error = %e, "metrics server failed");
        }
    });

    // Process-wide shutdown source.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        shutdown_tx.send(true).ok();
    });

    let stream = JsonlEventStream::open(&args.events)
        .await
        .map_err(|e| anyhow::anyhow!("opening event stream: {e}"))?;

    controller
        .run(stream, shutdown_rx)
        .await
        .map_err(|e| anyhow::anyhow!("controller failed: {e}"))?;

    info!("Tier daemon shut down gracefully");
    Ok(())
}
