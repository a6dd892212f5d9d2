//! Metadata service client
//!
//! Writes may land on a follower; the server answers `307` with the
//! leader in `Location` and the client retries there. Redirects are
//! protocol here, so the transport-level redirect handling is disabled.

use reqwest::{header, redirect, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardstore_api::{
    ClusterStatus, CreateBucketRequest, CreateObjectRequest, ErrorBody, ListObjectsParams,
    ListObjectsResponse, MigrationStatusResponse, MigrationSubmitRequest, MigrationSubmitResponse,
    RegisterNodeRequest, UpdateObjectRequest,
};
use shardstore_catalog::{BucketMeta, ObjectMeta, StorageNode};
use shardstore_common::{Error, Result, Tier, DEFAULT_HTTP_TIMEOUT};
use tracing::debug;

/// How many leader redirects to chase before giving up
const MAX_REDIRECTS: usize = 3;

/// Client for the metadata REST API
#[derive(Clone)]
pub struct MetaClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl MetaClient {
    /// Create a client against the given base URL (e.g. `http://meta:7400`)
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Attach a bearer token to every request
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// The endpoint this client currently targets
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    // ---- Buckets ----

    pub async fn create_bucket(&self, req: &CreateBucketRequest) -> Result<BucketMeta> {
        self.request_json(Method::POST, "/buckets", Some(req)).await
    }

    pub async fn delete_bucket(&self, name: &str) -> Result<()> {
        self.request_empty(Method::DELETE, &format!("/buckets/{name}"), None::<&()>)
            .await
    }

    pub async fn list_buckets(&self) -> Result<Vec<BucketMeta>> {
        self.request_json(Method::GET, "/buckets", None::<&()>).await
    }

    pub async fn get_bucket(&self, name: &str) -> Result<BucketMeta> {
        self.request_json(Method::GET, &format!("/buckets/{name}"), None::<&()>)
            .await
    }

    // ---- Objects ----

    pub async fn create_object(&self, bucket: &str, req: &CreateObjectRequest) -> Result<ObjectMeta> {
        self.request_json(Method::POST, &format!("/buckets/{bucket}/objects"), Some(req))
            .await
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        self.request_json(
            Method::GET,
            &format!("/buckets/{bucket}/objects/{key}"),
            None::<&()>,
        )
        .await
    }

    pub async fn list_objects(
        &self,
        bucket: &str,
        params: &ListObjectsParams,
    ) -> Result<ListObjectsResponse> {
        let mut path = format!("/buckets/{bucket}/objects");
        let mut query = Vec::new();
        if let Some(prefix) = &params.prefix {
            query.push(format!("prefix={prefix}"));
        }
        if let Some(after) = &params.start_after {
            query.push(format!("startAfter={after}"));
        }
        if let Some(max) = params.max_keys {
            query.push(format!("maxKeys={max}"));
        }
        if !query.is_empty() {
            path = format!("{path}?{}", query.join("&"));
        }
        self.request_json(Method::GET, &path, None::<&()>).await
    }

    pub async fn update_object(
        &self,
        bucket: &str,
        key: &str,
        req: &UpdateObjectRequest,
    ) -> Result<()> {
        self.request_empty(
            Method::PATCH,
            &format!("/buckets/{bucket}/objects/{key}"),
            Some(req),
        )
        .await
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.request_empty(
            Method::DELETE,
            &format!("/buckets/{bucket}/objects/{key}"),
            None::<&()>,
        )
        .await
    }

    /// Record a read hit; callers fire-and-forget this
    ///
    /// Object keys may contain `/`, so per-object actions ride on a
    /// query parameter rather than a path suffix.
    pub async fn touch_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.request_empty(
            Method::POST,
            &format!("/buckets/{bucket}/objects/{key}?action=touch"),
            None::<&()>,
        )
        .await
    }

    // ---- Storage node directory ----

    pub async fn list_nodes(&self) -> Result<Vec<StorageNode>> {
        self.request_json(Method::GET, "/nodes", None::<&()>).await
    }

    pub async fn register_node(&self, node: &StorageNode) -> Result<()> {
        let req = RegisterNodeRequest { node: node.clone() };
        self.request_empty(Method::POST, "/nodes", Some(&req)).await
    }

    // ---- Migrations ----

    pub async fn submit_migration(&self, bucket: &str, key: &str, target: Tier) -> Result<String> {
        let req = MigrationSubmitRequest { target_tier: target };
        let resp: MigrationSubmitResponse = self
            .request_json(
                Method::POST,
                &format!("/buckets/{bucket}/objects/{key}?action=migrate"),
                Some(&req),
            )
            .await?;
        Ok(resp.migration_id)
    }

    pub async fn migration_status(&self, migration_id: &str) -> Result<MigrationStatusResponse> {
        self.request_json(
            Method::GET,
            &format!("/migrations/{migration_id}"),
            None::<&()>,
        )
        .await
    }

    // ---- Cluster ----

    pub async fn cluster_status(&self) -> Result<ClusterStatus> {
        self.request_json(Method::GET, "/cluster/status", None::<&()>)
            .await
    }

    // ---- Internals ----

    async fn request_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let resp = self.send(method, path, body).await?;
        resp.json::<T>()
            .await
            .map_err(|e| Error::Serialization(format!("decoding {path} response: {e}")))
    }

    async fn request_empty<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<()> {
        self.send(method, path, body).await.map(|_| ())
    }

    /// Send a request, chasing leader redirects and mapping error bodies
    /// back onto the shared taxonomy.
    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response> {
        let mut url = format!("{}{}", self.base, path);

        for _ in 0..=MAX_REDIRECTS {
            let mut req = self.http.request(method.clone(), url.as_str());
            if let Some(token) = &self.token {
                req = req.bearer_auth(token);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| Error::upstream(format!("metadata service: {e}")))?;

            if resp.status() == StatusCode::TEMPORARY_REDIRECT {
                let Some(location) = resp
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(Error::NotLeader { leader: None });
                };
                debug!(leader = location, "following leader redirect");
                url = location.to_string();
                continue;
            }

            return Self::check_status(resp).await;
        }

        Err(Error::NotLeader { leader: None })
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let message = match resp.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };

        Err(match status {
            StatusCode::BAD_REQUEST => Error::InvalidRequest(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::AuthFailure(message),
            StatusCode::NOT_FOUND => Error::NotFound(message),
            StatusCode::CONFLICT => Error::StateConflict(message),
            StatusCode::SERVICE_UNAVAILABLE => Error::upstream(message),
            StatusCode::GATEWAY_TIMEOUT => Error::ApplyTimeout,
            _ => Error::internal(message),
        })
    }
}
