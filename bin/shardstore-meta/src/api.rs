//! REST surface of the metadata service
//!
//! Writes marshal into catalog commands and go through consensus; a
//! follower answers `307` with the leader in `Location`, a leaderless
//! cluster `503`, an apply deadline `504`, an FSM rejection `409`.
//! Reads are served from the locally applied state and are eventually
//! consistent on followers.

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::Deserialize;
use shardstore_api::{
    ClusterStatus, CreateBucketRequest, CreateObjectRequest, ErrorBody, JoinRequest,
    ListObjectsParams, ListObjectsResponse, MigrationSubmitRequest, MigrationSubmitResponse,
    RegisterNodeRequest, UpdateObjectRequest,
};
use shardstore_catalog::{ObjectMeta, Op};
use shardstore_common::metrics::{render_counter, render_gauge, PROMETHEUS_CONTENT_TYPE};
use shardstore_common::{BucketName, Error, ObjectKey};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::{AppState, NodeId, TypeConfig};
use crate::migrate;

/// Default page size for object listings
const DEFAULT_PAGE_SIZE: usize = 1000;

/// Build the full router (REST + raft transport)
pub fn router(app: AppState) -> Router {
    Router::new()
        // Metrics and health first; they bypass nothing but read best
        // with the wildcard routes below them.
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/buckets", post(create_bucket).get(list_buckets))
        .route("/buckets/{bucket}", get(get_bucket).delete(delete_bucket))
        .route(
            "/buckets/{bucket}/objects",
            post(create_object).get(list_objects),
        )
        .route(
            "/buckets/{bucket}/objects/{*key}",
            get(get_object)
                .patch(update_object)
                .delete(delete_object)
                .post(object_action),
        )
        .route("/nodes", get(list_nodes).post(register_node))
        .route("/migrations/{migration_id}", get(migration_status))
        .route("/cluster/status", get(cluster_status))
        .route("/cluster/init", post(cluster_init))
        .route("/cluster/join", post(cluster_join))
        .route("/raft/append-entries", post(raft_append_entries))
        .route("/raft/install-snapshot", post(raft_install_snapshot))
        .route("/raft/vote", post(raft_vote))
        .layer(middleware::from_fn_with_state(
            app.clone(),
            track_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

async fn track_requests(State(app): State<AppState>, req: Request, next: Next) -> Response {
    app.api_metrics.requests_total.inc();
    let resp = next.run(req).await;
    if resp.status().is_server_error() {
        app.api_metrics.requests_errors.inc();
    }
    resp
}

/// Error wrapper carrying the request URI so leader redirects can point
/// at the same resource on the leader.
struct ApiError {
    error: Error,
    uri: Option<String>,
}

impl ApiError {
    fn new(error: Error) -> Self {
        Self { error, uri: None }
    }

    fn at(error: Error, uri: &Uri) -> Self {
        Self {
            error,
            uri: Some(uri.to_string()),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self::new(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut resp = (
            status,
            Json(ErrorBody {
                error: self.error.to_string(),
            }),
        )
            .into_response();

        if let (Error::NotLeader { leader: Some(leader) }, Some(uri)) = (&self.error, &self.uri) {
            if let Ok(value) = header::HeaderValue::from_str(&format!("{leader}{uri}")) {
                resp.headers_mut().insert(header::LOCATION, value);
            }
        }
        resp
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---- Buckets ----

async fn create_bucket(
    State(app): State<AppState>,
    uri: Uri,
    Json(req): Json<CreateBucketRequest>,
) -> ApiResult<Response> {
    let name = BucketName::new(&req.name).map_err(|e| ApiError::new(e.into()))?;

    app.propose(Op::CreateBucket {
        name: name.as_str().to_string(),
        owner: req.owner,
        acl: req.acl,
        metadata: req.metadata,
    })
    .await
    .map_err(|e| ApiError::at(e, &uri))?;

    let bucket = app
        .catalog
        .get_bucket(name.as_str())
        .ok_or_else(|| ApiError::new(Error::internal("bucket vanished after apply")))?;
    Ok((StatusCode::CREATED, Json(bucket)).into_response())
}

async fn list_buckets(State(app): State<AppState>) -> Response {
    Json(app.catalog.list_buckets()).into_response()
}

async fn get_bucket(
    State(app): State<AppState>,
    Path(bucket): Path<String>,
) -> ApiResult<Response> {
    match app.catalog.get_bucket(&bucket) {
        Some(meta) => Ok(Json(meta).into_response()),
        None => Err(ApiError::new(Error::BucketNotFound(bucket))),
    }
}

async fn delete_bucket(
    State(app): State<AppState>,
    uri: Uri,
    Path(bucket): Path<String>,
) -> ApiResult<StatusCode> {
    app.propose(Op::DeleteBucket { name: bucket })
        .await
        .map_err(|e| ApiError::at(e, &uri))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Objects ----

async fn create_object(
    State(app): State<AppState>,
    uri: Uri,
    Path(bucket): Path<String>,
    Json(req): Json<CreateObjectRequest>,
) -> ApiResult<Response> {
    let key = ObjectKey::new(&req.key).map_err(|e| ApiError::new(e.into()))?;

    let object = ObjectMeta {
        bucket: bucket.clone(),
        key: key.as_str().to_string(),
        size: req.size,
        tier: req.tier,
        // Overwritten by the command clock at apply.
        created_at: 0,
        last_accessed: 0,
        content_type: req.content_type,
        checksum: req.checksum,
        encryption_key_ref: req.encryption_key_ref,
        metadata: req.metadata,
        shards: req.shards,
    };

    app.propose(Op::CreateObject { object })
        .await
        .map_err(|e| ApiError::at(e, &uri))?;

    let stored = app
        .catalog
        .get_object(&bucket, key.as_str())
        .ok_or_else(|| ApiError::new(Error::internal("object vanished after apply")))?;
    Ok((StatusCode::CREATED, Json(stored)).into_response())
}

async fn list_objects(
    State(app): State<AppState>,
    Path(bucket): Path<String>,
    Query(params): Query<ListObjectsParams>,
) -> ApiResult<Response> {
    if app.catalog.get_bucket(&bucket).is_none() {
        return Err(ApiError::new(Error::BucketNotFound(bucket)));
    }

    let limit = params.max_keys.unwrap_or(DEFAULT_PAGE_SIZE).min(10_000);
    let (objects, is_truncated) = app.catalog.list_objects(
        &bucket,
        params.prefix.as_deref().unwrap_or(""),
        params.start_after.as_deref(),
        limit,
    );

    let next_start_after = if is_truncated {
        objects.last().map(|o| o.key.clone())
    } else {
        None
    };

    Ok(Json(ListObjectsResponse {
        objects,
        is_truncated,
        next_start_after,
    })
    .into_response())
}

async fn get_object(
    State(app): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> ApiResult<Response> {
    match app.catalog.get_object(&bucket, &key) {
        Some(object) => Ok(Json(object).into_response()),
        None => Err(ApiError::new(Error::ObjectNotFound { bucket, key })),
    }
}

async fn update_object(
    State(app): State<AppState>,
    uri: Uri,
    Path((bucket, key)): Path<(String, String)>,
    Json(req): Json<UpdateObjectRequest>,
) -> ApiResult<StatusCode> {
    app.propose(Op::UpdateObject {
        bucket,
        key,
        tier: req.tier,
        last_accessed: req.last_accessed,
        shards: req.shards,
    })
    .await
    .map_err(|e| ApiError::at(e, &uri))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_object(
    State(app): State<AppState>,
    uri: Uri,
    Path((bucket, key)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    app.propose(Op::DeleteObject { bucket, key })
        .await
        .map_err(|e| ApiError::at(e, &uri))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ObjectActionParams {
    action: Option<String>,
}

/// Per-object actions ride on the wildcard route as a query parameter
/// because object keys may themselves contain `/`.
async fn object_action(
    State(app): State<AppState>,
    uri: Uri,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<ObjectActionParams>,
    body: axum::body::Bytes,
) -> ApiResult<Response> {
    match params.action.as_deref() {
        Some("touch") => {
            app.propose(Op::UpdateAccessTime { bucket, key })
                .await
                .map_err(|e| ApiError::at(e, &uri))?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Some("migrate") => {
            // Migrations run on the leader: the runner proposes the
            // commit itself and polls are answered from its registry.
            if !app.is_leader() {
                return Err(ApiError::at(
                    Error::NotLeader {
                        leader: app.leader_addr().filter(|addr| addr != &app.addr),
                    },
                    &uri,
                ));
            }
            let req: MigrationSubmitRequest = serde_json::from_slice(&body)
                .map_err(|e| ApiError::new(Error::invalid_request(format!("bad body: {e}"))))?;

            if app.catalog.get_object(&bucket, &key).is_none() {
                return Err(ApiError::new(Error::ObjectNotFound { bucket, key }));
            }

            let migration_id =
                migrate::spawn_migration(app.clone(), bucket, key, req.target_tier);
            Ok((
                StatusCode::ACCEPTED,
                Json(MigrationSubmitResponse { migration_id }),
            )
                .into_response())
        }
        other => Err(ApiError::new(Error::invalid_request(format!(
            "unknown object action: {other:?}"
        )))),
    }
}

async fn migration_status(
    State(app): State<AppState>,
    Path(migration_id): Path<String>,
) -> ApiResult<Response> {
    match app.migrations.status(&migration_id) {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(ApiError::new(Error::NotFound(format!(
            "migration {migration_id}"
        )))),
    }
}

// ---- Storage node directory ----

async fn list_nodes(State(app): State<AppState>) -> Response {
    Json(app.catalog.list_nodes()).into_response()
}

async fn register_node(
    State(app): State<AppState>,
    uri: Uri,
    Json(req): Json<RegisterNodeRequest>,
) -> ApiResult<StatusCode> {
    info!(node = %req.node.node_id, tier = %req.node.tier, addr = %req.node.address, "storage node registering");
    app.propose(Op::RegisterNode { node: req.node })
        .await
        .map_err(|e| ApiError::at(e, &uri))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Cluster ----

async fn cluster_status(State(app): State<AppState>) -> Response {
    let metrics = app.raft.metrics().borrow().clone();

    let leader = metrics.current_leader.and_then(|id| {
        metrics
            .membership_config
            .membership()
            .get_node(&id)
            .map(|n| n.addr.clone())
    });

    Json(ClusterStatus {
        state: format!("{:?}", metrics.state).to_lowercase(),
        leader,
        last_index: metrics.last_log_index,
        applied_index: metrics.last_applied.map(|l| l.index),
    })
    .into_response()
}

async fn cluster_init(State(app): State<AppState>) -> ApiResult<Response> {
    let mut members = BTreeMap::new();
    members.insert(app.id, BasicNode::new(app.addr.clone()));

    app.raft
        .initialize(members)
        .await
        .map_err(|e| ApiError::new(Error::conflict(format!("initialize: {e}"))))?;

    info!(node = app.id, "cluster bootstrapped with a single voter");
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn cluster_join(
    State(app): State<AppState>,
    uri: Uri,
    Json(req): Json<JoinRequest>,
) -> ApiResult<Response> {
    if !app.is_leader() {
        // Not the leader: hand back the leader's address and let the
        // joining node retry there.
        return Err(ApiError::at(
            Error::NotLeader {
                leader: app.leader_addr(),
            },
            &uri,
        ));
    }

    app.raft
        .add_learner(req.node_id, BasicNode::new(req.addr.clone()), true)
        .await
        .map_err(|e| ApiError::new(Error::internal(format!("add learner: {e}"))))?;

    let mut voters: BTreeSet<NodeId> = {
        let metrics = app.raft.metrics().borrow().clone();
        metrics.membership_config.membership().voter_ids().collect()
    };
    voters.insert(req.node_id);

    app.raft
        .change_membership(voters, false)
        .await
        .map_err(|e| ApiError::new(Error::internal(format!("change membership: {e}"))))?;

    info!(node = req.node_id, addr = %req.addr, "voter added to cluster");
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ---- Raft transport ----

async fn raft_append_entries(
    State(app): State<AppState>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    Json(app.raft.append_entries(req).await)
}

async fn raft_install_snapshot(
    State(app): State<AppState>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>> {
    Json(app.raft.install_snapshot(req).await)
}

async fn raft_vote(
    State(app): State<AppState>,
    Json(req): Json<VoteRequest<NodeId>>,
) -> Json<Result<VoteResponse<NodeId>, RaftError<NodeId>>> {
    Json(app.raft.vote(req).await)
}

// ---- Observability ----

async fn health() -> Response {
    (StatusCode::OK, "OK").into_response()
}

async fn metrics(State(app): State<AppState>) -> Response {
    let mut out = String::with_capacity(4 * 1024);

    render_counter(
        &mut out,
        "shardstore_meta_uptime_seconds",
        "Metadata service uptime",
        app.start_time.elapsed().as_secs(),
    );

    let (buckets, objects, nodes) = app.catalog.counts();
    render_gauge(
        &mut out,
        "shardstore_meta_buckets_total",
        "Buckets in the catalog",
        buckets,
    );
    render_gauge(
        &mut out,
        "shardstore_meta_objects_total",
        "Objects in the catalog",
        objects,
    );
    render_gauge(
        &mut out,
        "shardstore_meta_nodes_total",
        "Registered storage nodes",
        nodes,
    );

    let raft = app.raft.metrics().borrow().clone();
    render_gauge(
        &mut out,
        "shardstore_meta_raft_last_index",
        "Last raft log index",
        raft.last_log_index.unwrap_or(0),
    );
    render_gauge(
        &mut out,
        "shardstore_meta_raft_applied_index",
        "Last applied raft log index",
        raft.last_applied.map(|l| l.index).unwrap_or(0),
    );
    render_gauge(
        &mut out,
        "shardstore_meta_raft_is_leader",
        "1 when this node leads the group",
        u64::from(raft.current_leader == Some(app.id)),
    );

    render_counter(
        &mut out,
        "shardstore_meta_api_requests_total",
        "REST requests handled",
        app.api_metrics.requests_total.get(),
    );
    render_counter(
        &mut out,
        "shardstore_meta_api_request_errors_total",
        "REST requests answered 5xx",
        app.api_metrics.requests_errors.get(),
    );

    render_counter(
        &mut out,
        "shardstore_meta_migrations_submitted_total",
        "Migrations accepted",
        app.migrations.metrics.submitted.get(),
    );
    render_counter(
        &mut out,
        "shardstore_meta_migrations_succeeded_total",
        "Migrations completed",
        app.migrations.metrics.succeeded.get(),
    );
    render_counter(
        &mut out,
        "shardstore_meta_migrations_failed_total",
        "Migrations failed",
        app.migrations.metrics.failed.get(),
    );
    render_gauge(
        &mut out,
        "shardstore_meta_migrations_running",
        "Migrations in flight",
        app.migrations.metrics.running.get(),
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        out,
    )
        .into_response()
}
