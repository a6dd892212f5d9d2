//! Shard node HTTP service
//!
//! Stores shard blobs and their sidecar descriptors under
//! `<root>/shards/<bucket>/<object_key>/<shard_id>.{shard,meta}`.
//! The blob is written first; a shard only counts as durable once its
//! sidecar exists, so a crash in between leaves an orphan blob for the
//! sweeper. Deletion removes the sidecar first so a concurrent read
//! races only against blob removal and surfaces `NotFound`, which the
//! read path absorbs through reconstruction.

use axum::{
    extract::{Multipart, Path as UrlPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use shardstore_api::node::{upload_fields, NodeInfo, ShardSidecar, UploadShardResponse};
use shardstore_api::ErrorBody;
use shardstore_common::metrics::{
    render_counter, render_gauge, Counter, Gauge, Histogram, LATENCY_BUCKETS,
    PROMETHEUS_CONTENT_TYPE,
};
use shardstore_common::{ChecksumCalculator, NodeId, ShardType, Tier};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Per-operation request accounting
#[derive(Debug, Default)]
pub struct OpMetrics {
    pub total: Counter,
    pub errors: Counter,
}

impl OpMetrics {
    fn record(&self, success: bool) {
        self.total.inc();
        if !success {
            self.errors.inc();
        }
    }
}

/// Node-wide metrics
#[derive(Debug)]
pub struct NodeMetrics {
    pub bytes_stored_total: Counter,
    pub bytes_served_total: Counter,
    pub shard_count: Gauge,
    pub disk_usage_bytes: Gauge,
    /// Blobs the sweeper scrub found failing their sidecar CRC32C
    pub corrupt_shards: Counter,
    pub upload_duration: Histogram,
    pub download_duration: Histogram,
    pub upload: OpMetrics,
    pub download: OpMetrics,
    pub remove: OpMetrics,
    pub list: OpMetrics,
}

impl NodeMetrics {
    fn new() -> Self {
        Self {
            bytes_stored_total: Counter::default(),
            bytes_served_total: Counter::default(),
            shard_count: Gauge::default(),
            disk_usage_bytes: Gauge::default(),
            corrupt_shards: Counter::default(),
            upload_duration: Histogram::new(LATENCY_BUCKETS),
            download_duration: Histogram::new(LATENCY_BUCKETS),
            upload: OpMetrics::default(),
            download: OpMetrics::default(),
            remove: OpMetrics::default(),
            list: OpMetrics::default(),
        }
    }
}

/// Shared node state
pub struct NodeState {
    pub node_id: NodeId,
    pub advertise_addr: String,
    pub tier: Tier,
    root: PathBuf,
    pub metrics: NodeMetrics,
    pub start_time: Instant,
}

pub type SharedNode = Arc<NodeState>;

impl NodeState {
    /// Create the node state, ensuring the shard root exists
    pub fn new(
        node_id: NodeId,
        advertise_addr: String,
        tier: Tier,
        data_dir: PathBuf,
    ) -> anyhow::Result<Self> {
        let state = Self {
            node_id,
            advertise_addr,
            tier,
            root: data_dir,
            metrics: NodeMetrics::new(),
            start_time: Instant::now(),
        };
        std::fs::create_dir_all(state.shards_root())?;
        state.metrics.shard_count.set(state.count_shards());
        Ok(state)
    }

    /// Root directory holding all shard data
    #[must_use]
    pub fn shards_root(&self) -> PathBuf {
        self.root.join("shards")
    }

    fn object_dir(&self, bucket: &str, object_key: &str) -> PathBuf {
        self.shards_root().join(bucket).join(object_key)
    }

    fn blob_path(&self, bucket: &str, object_key: &str, shard_id: &str) -> PathBuf {
        self.object_dir(bucket, object_key)
            .join(format!("{shard_id}.shard"))
    }

    fn sidecar_path(&self, bucket: &str, object_key: &str, shard_id: &str) -> PathBuf {
        self.object_dir(bucket, object_key)
            .join(format!("{shard_id}.meta"))
    }

    /// Count sidecars under the root (a shard is durable iff its
    /// sidecar exists)
    #[must_use]
    pub fn count_shards(&self) -> u64 {
        let mut count = 0;
        walk_sidecars(&self.shards_root(), &mut |_| count += 1);
        count
    }

    /// Total bytes under the shard root
    #[must_use]
    pub fn disk_usage(&self) -> u64 {
        dir_size(&self.shards_root())
    }

    /// All sidecars, with their on-disk paths
    #[must_use]
    pub fn all_sidecars(&self) -> Vec<(PathBuf, ShardSidecar)> {
        let mut sidecars = Vec::new();
        walk_sidecars(&self.shards_root(), &mut |path| {
            if let Ok(bytes) = std::fs::read(path) {
                if let Ok(sidecar) = serde_json::from_slice::<ShardSidecar>(&bytes) {
                    sidecars.push((path.to_path_buf(), sidecar));
                }
            }
        });
        sidecars
    }

    /// Remove one shard (sidecar first), pruning emptied directories
    pub async fn remove_shard(&self, bucket: &str, object_key: &str, shard_id: &str) -> bool {
        let sidecar = self.sidecar_path(bucket, object_key, shard_id);
        let blob = self.blob_path(bucket, object_key, shard_id);

        let had_sidecar = tokio::fs::remove_file(&sidecar).await.is_ok();
        let had_blob = tokio::fs::remove_file(&blob).await.is_ok();

        if had_sidecar || had_blob {
            self.metrics
                .shard_count
                .set(self.metrics.shard_count.get().saturating_sub(1));
        }

        // Prune now-empty directories up to the shard root.
        let mut dir = blob.parent().map(Path::to_path_buf);
        let root = self.shards_root();
        while let Some(d) = dir {
            if d == root || tokio::fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }

        had_sidecar || had_blob
    }
}

/// Reject path components that would escape the shard root
fn safe_rel(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("empty path component".to_string());
    }
    if value.starts_with('/') {
        return Err("absolute path not allowed".to_string());
    }
    for segment in value.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(format!("invalid path segment in {value:?}"));
        }
    }
    Ok(())
}

fn walk_sidecars(dir: &Path, visit: &mut impl FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_sidecars(&path, visit);
        } else if path.extension().is_some_and(|ext| ext == "meta") {
            visit(&path);
        }
    }
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += dir_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}

fn bad_request(msg: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody { error: msg.into() }),
    )
        .into_response()
}

fn not_found(msg: impl Into<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody { error: msg.into() }),
    )
        .into_response()
}

fn io_failure(e: &std::io::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: format!("I/O failure: {e}"),
        }),
    )
        .into_response()
}

/// Build the node's router
pub fn router(state: SharedNode) -> Router {
    Router::new()
        .route("/shard/upload", post(upload_shard))
        .route("/shard/download/{*shard_id}", get(download_shard))
        .route("/shard/delete/{*shard_id}", delete(delete_shard))
        .route("/shard/list", get(list_shards))
        .route("/health", get(health))
        .route("/info", get(info_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, serde::Deserialize)]
struct ScopeParams {
    bucket: Option<String>,
    object: Option<String>,
}

async fn upload_shard(State(state): State<SharedNode>, mut multipart: Multipart) -> Response {
    let started = Instant::now();

    let mut shard_id = None;
    let mut bucket = None;
    let mut object_key = None;
    let mut shard_type = None;
    let mut index = None;
    let mut total_shards = None;
    let mut data: Option<axum::body::Bytes> = None;
    let mut hasher = ChecksumCalculator::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                state.metrics.upload.record(false);
                return bad_request(format!("malformed multipart body: {e}"));
            }
        };
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            upload_fields::DATA => match field.bytes().await {
                Ok(bytes) => {
                    hasher.update(&bytes);
                    data = Some(bytes);
                }
                Err(e) => {
                    state.metrics.upload.record(false);
                    return bad_request(format!("reading shard bytes: {e}"));
                }
            },
            other => {
                let Ok(text) = field.text().await else {
                    state.metrics.upload.record(false);
                    return bad_request(format!("non-text field {other:?}"));
                };
                match other {
                    upload_fields::SHARD_ID => shard_id = Some(text),
                    upload_fields::BUCKET => bucket = Some(text),
                    upload_fields::OBJECT_KEY => object_key = Some(text),
                    upload_fields::SHARD_TYPE => shard_type = Some(text),
                    upload_fields::INDEX => index = Some(text),
                    upload_fields::TOTAL_SHARDS => total_shards = Some(text),
                    _ => debug!(field = other, "ignoring unknown upload field"),
                }
            }
        }
    }

    // All fields are mandatory.
    let (Some(shard_id), Some(bucket), Some(object_key), Some(shard_type), Some(index), Some(total), Some(data)) =
        (shard_id, bucket, object_key, shard_type, index, total_shards, data)
    else {
        state.metrics.upload.record(false);
        return bad_request("missing upload field");
    };

    let shard_type: ShardType = match shard_type.parse() {
        Ok(t) => t,
        Err(e) => {
            state.metrics.upload.record(false);
            return bad_request(e);
        }
    };
    let (Ok(index), Ok(total)) = (index.parse::<u32>(), total.parse::<u32>()) else {
        state.metrics.upload.record(false);
        return bad_request("index/total_shards must be integers");
    };
    for value in [&shard_id, &bucket, &object_key] {
        if let Err(e) = safe_rel(value) {
            state.metrics.upload.record(false);
            return bad_request(e);
        }
    }

    let checksum = hasher.finalize();
    let size = data.len() as u64;

    let blob_path = state.blob_path(&bucket, &object_key, &shard_id);
    let dir = blob_path.parent().expect("blob path has a parent");
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        state.metrics.upload.record(false);
        return io_failure(&e);
    }

    // Blob first; the shard is durable only once the sidecar lands.
    if let Err(e) = tokio::fs::write(&blob_path, &data).await {
        state.metrics.upload.record(false);
        return io_failure(&e);
    }

    let sidecar = ShardSidecar {
        id: shard_id.clone(),
        bucket: bucket.clone(),
        object_key: object_key.clone(),
        shard_type,
        index,
        total,
        size,
        checksum: checksum.sha256_hex(),
        crc32c: checksum.crc32c,
        uploaded_at: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        tier: state.tier,
    };
    let sidecar_bytes = match serde_json::to_vec(&sidecar) {
        Ok(bytes) => bytes,
        Err(e) => {
            state.metrics.upload.record(false);
            return bad_request(format!("encoding sidecar: {e}"));
        }
    };
    if let Err(e) = tokio::fs::write(state.sidecar_path(&bucket, &object_key, &shard_id), sidecar_bytes).await
    {
        state.metrics.upload.record(false);
        return io_failure(&e);
    }

    state.metrics.bytes_stored_total.add(size);
    state.metrics.shard_count.set(state.metrics.shard_count.get() + 1);
    state
        .metrics
        .upload_duration
        .observe(started.elapsed().as_secs_f64());
    state.metrics.upload.record(true);

    debug!(shard = %shard_id, bucket, size, "stored shard");

    (
        StatusCode::CREATED,
        Json(UploadShardResponse {
            shard_id,
            size,
            checksum: sidecar.checksum.clone(),
            crc32c: sidecar.crc32c,
        }),
    )
        .into_response()
}

async fn download_shard(
    State(state): State<SharedNode>,
    UrlPath(shard_id): UrlPath<String>,
    Query(scope): Query<ScopeParams>,
) -> Response {
    let started = Instant::now();

    let (Some(bucket), Some(object)) = (scope.bucket, scope.object) else {
        state.metrics.download.record(false);
        return bad_request("bucket and object query parameters are required");
    };
    for value in [&shard_id, &bucket, &object] {
        if let Err(e) = safe_rel(value) {
            state.metrics.download.record(false);
            return bad_request(e);
        }
    }

    let sidecar_bytes =
        match tokio::fs::read(state.sidecar_path(&bucket, &object, &shard_id)).await {
            Ok(bytes) => bytes,
            Err(_) => {
                state.metrics.download.record(false);
                return not_found(format!("shard {shard_id}"));
            }
        };
    let sidecar: ShardSidecar = match serde_json::from_slice(&sidecar_bytes) {
        Ok(sidecar) => sidecar,
        Err(e) => {
            state.metrics.download.record(false);
            warn!(shard = %shard_id, error = %e, "corrupt sidecar");
            return io_failure(&std::io::Error::other("corrupt sidecar"));
        }
    };

    let data = match tokio::fs::read(state.blob_path(&bucket, &object, &shard_id)).await {
        Ok(data) => data,
        Err(_) => {
            state.metrics.download.record(false);
            return not_found(format!("shard {shard_id}"));
        }
    };

    state.metrics.bytes_served_total.add(data.len() as u64);
    state
        .metrics
        .download_duration
        .observe(started.elapsed().as_secs_f64());
    state.metrics.download.record(true);

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::HeaderName::from_static("x-shard-checksum"),
                sidecar.checksum.clone(),
            ),
            (
                header::HeaderName::from_static("x-shard-type"),
                sidecar.shard_type.to_string(),
            ),
        ],
        data,
    )
        .into_response()
}

async fn delete_shard(
    State(state): State<SharedNode>,
    UrlPath(shard_id): UrlPath<String>,
    Query(scope): Query<ScopeParams>,
) -> Response {
    let (Some(bucket), Some(object)) = (scope.bucket, scope.object) else {
        state.metrics.remove.record(false);
        return bad_request("bucket and object query parameters are required");
    };
    for value in [&shard_id, &bucket, &object] {
        if let Err(e) = safe_rel(value) {
            state.metrics.remove.record(false);
            return bad_request(e);
        }
    }

    // Idempotent: deleting a missing shard succeeds.
    let removed = state.remove_shard(&bucket, &object, &shard_id).await;
    debug!(shard = %shard_id, removed, "delete shard");
    state.metrics.remove.record(true);
    StatusCode::NO_CONTENT.into_response()
}

async fn list_shards(State(state): State<SharedNode>, Query(scope): Query<ScopeParams>) -> Response {
    let sidecars: Vec<ShardSidecar> = match (&scope.bucket, &scope.object) {
        (Some(bucket), Some(object)) => {
            if safe_rel(bucket).is_err() || safe_rel(object).is_err() {
                state.metrics.list.record(false);
                return bad_request("invalid bucket/object");
            }
            let mut found = Vec::new();
            walk_sidecars(&state.object_dir(bucket, object), &mut |path| {
                if let Ok(bytes) = std::fs::read(path) {
                    if let Ok(sidecar) = serde_json::from_slice(&bytes) {
                        found.push(sidecar);
                    }
                }
            });
            found
        }
        _ => state.all_sidecars().into_iter().map(|(_, s)| s).collect(),
    };

    state.metrics.list.record(true);
    Json(sidecars).into_response()
}

async fn health(State(state): State<SharedNode>) -> Response {
    // Liveness means the data directory is writable.
    let sentinel = state.shards_root().join(".health");
    match tokio::fs::write(&sentinel, b"ok").await {
        Ok(()) => {
            tokio::fs::remove_file(&sentinel).await.ok();
            (StatusCode::OK, "OK").into_response()
        }
        Err(e) => {
            warn!(error = %e, "data directory not writable");
            (StatusCode::SERVICE_UNAVAILABLE, "data dir not writable").into_response()
        }
    }
}

async fn info_handler(State(state): State<SharedNode>) -> Response {
    Json(NodeInfo {
        node_id: state.node_id.to_string(),
        address: state.advertise_addr.clone(),
        tier: state.tier,
        shard_count: state.metrics.shard_count.get(),
        disk_usage_bytes: state.metrics.disk_usage_bytes.get(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
    .into_response()
}

async fn metrics_handler(State(state): State<SharedNode>) -> Response {
    let m = &state.metrics;
    let mut out = String::with_capacity(4 * 1024);

    render_counter(
        &mut out,
        "shardstore_node_bytes_stored_total",
        "Shard bytes written",
        m.bytes_stored_total.get(),
    );
    render_counter(
        &mut out,
        "shardstore_node_bytes_served_total",
        "Shard bytes served",
        m.bytes_served_total.get(),
    );
    render_gauge(
        &mut out,
        "shardstore_node_shard_count",
        "Durable shards on this node",
        m.shard_count.get(),
    );
    render_gauge(
        &mut out,
        "shardstore_node_disk_usage_bytes",
        "Bytes under the shard root",
        m.disk_usage_bytes.get(),
    );
    render_counter(
        &mut out,
        "shardstore_node_corrupt_shards_total",
        "Blobs failing their sidecar checksum during scrub",
        m.corrupt_shards.get(),
    );
    m.upload_duration.render(
        &mut out,
        "shardstore_node_upload_duration_seconds",
        "Shard upload latency",
    );
    m.download_duration.render(
        &mut out,
        "shardstore_node_download_duration_seconds",
        "Shard download latency",
    );

    use std::fmt::Write;
    writeln!(
        out,
        "# HELP shardstore_node_requests_total Requests by operation and status"
    )
    .unwrap();
    writeln!(out, "# TYPE shardstore_node_requests_total counter").unwrap();
    for (op, metrics) in [
        ("upload", &m.upload),
        ("download", &m.download),
        ("delete", &m.remove),
        ("list", &m.list),
    ] {
        let errors = metrics.errors.get();
        let ok = metrics.total.get().saturating_sub(errors);
        writeln!(
            out,
            "shardstore_node_requests_total{{op=\"{op}\",status=\"success\"}} {ok}"
        )
        .unwrap();
        writeln!(
            out,
            "shardstore_node_requests_total{{op=\"{op}\",status=\"error\"}} {errors}"
        )
        .unwrap();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        out,
    )
        .into_response()
}

/// Walk the shard root every 30s and refresh the disk usage gauge
pub async fn disk_usage_loop(state: SharedNode) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        ticker.tick().await;
        let usage = state.disk_usage();
        state.metrics.disk_usage_bytes.set(usage);
        state.metrics.shard_count.set(state.count_shards());
    }
}

/// Log the node identity at startup
pub fn log_startup(state: &NodeState) {
    info!(
        node = %state.node_id,
        tier = %state.tier,
        root = %state.shards_root().display(),
        "storage node ready"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(dir: &Path) -> SharedNode {
        Arc::new(
            NodeState::new(
                NodeId::new(),
                "http://127.0.0.1:7411".into(),
                Tier::Hot,
                dir.to_path_buf(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_safe_rel() {
        assert!(safe_rel("b1").is_ok());
        assert!(safe_rel("a/b/c.txt").is_ok());
        assert!(safe_rel("b1-a/b-3").is_ok());
        assert!(safe_rel("").is_err());
        assert!(safe_rel("/etc/passwd").is_err());
        assert!(safe_rel("a/../b").is_err());
        assert!(safe_rel("a//b").is_err());
    }

    #[tokio::test]
    async fn test_remove_shard_prunes_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let blob = state.blob_path("b1", "a/b.txt", "b1-a/b.txt-0");
        tokio::fs::create_dir_all(blob.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&blob, b"shard bytes").await.unwrap();
        tokio::fs::write(
            state.sidecar_path("b1", "a/b.txt", "b1-a/b.txt-0"),
            b"{}",
        )
        .await
        .unwrap();

        assert!(state.remove_shard("b1", "a/b.txt", "b1-a/b.txt-0").await);
        // Emptied bucket/object directories are pruned; the root stays.
        assert!(!dir.path().join("shards/b1").exists());
        assert!(state.shards_root().exists());

        // Idempotent second delete.
        assert!(!state.remove_shard("b1", "a/b.txt", "b1-a/b.txt-0").await);
    }
}
