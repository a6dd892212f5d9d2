//! Shard node client
//!
//! Thin wrapper over the node's HTTP surface: multipart upload, binary
//! download, idempotent delete, sidecar listing.

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use shardstore_api::node::{upload_fields, ShardSidecar, UploadShardResponse, SHARD_CHECKSUM_HEADER};
use shardstore_common::{Error, Result, ShardType, DEFAULT_HTTP_TIMEOUT};

/// Client for shard node daemons
#[derive(Clone)]
pub struct NodeClient {
    http: reqwest::Client,
}

impl NodeClient {
    /// Build a client with the default outbound timeout
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// Upload one shard to a node
    pub async fn upload_shard(
        &self,
        node_addr: &str,
        shard_id: &str,
        bucket: &str,
        object_key: &str,
        shard_type: ShardType,
        index: u32,
        total_shards: u32,
        data: Vec<u8>,
    ) -> Result<UploadShardResponse> {
        let form = Form::new()
            .text(upload_fields::SHARD_ID, shard_id.to_string())
            .text(upload_fields::BUCKET, bucket.to_string())
            .text(upload_fields::OBJECT_KEY, object_key.to_string())
            .text(upload_fields::SHARD_TYPE, shard_type.as_str())
            .text(upload_fields::INDEX, index.to_string())
            .text(upload_fields::TOTAL_SHARDS, total_shards.to_string())
            .part(
                upload_fields::DATA,
                Part::bytes(data).file_name(shard_id.to_string()),
            );

        let resp = self
            .http
            .post(format!("{}/shard/upload", node_addr.trim_end_matches('/')))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::upstream(format!("shard upload to {node_addr}: {e}")))?;

        if !resp.status().is_success() {
            return Err(Self::error_for(resp, shard_id).await);
        }
        resp.json::<UploadShardResponse>()
            .await
            .map_err(|e| Error::Serialization(format!("decoding upload response: {e}")))
    }

    /// Download a shard; returns the bytes and the sidecar checksum header
    pub async fn download_shard(
        &self,
        node_addr: &str,
        shard_id: &str,
        bucket: &str,
        object_key: &str,
    ) -> Result<(Bytes, Option<String>)> {
        let resp = self
            .http
            .get(format!(
                "{}/shard/download/{shard_id}",
                node_addr.trim_end_matches('/')
            ))
            .query(&[("bucket", bucket), ("object", object_key)])
            .send()
            .await
            .map_err(|e| Error::upstream(format!("shard download from {node_addr}: {e}")))?;

        if !resp.status().is_success() {
            return Err(Self::error_for(resp, shard_id).await);
        }

        let checksum = resp
            .headers()
            .get(SHARD_CHECKSUM_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::upstream(format!("shard download body: {e}")))?;
        Ok((bytes, checksum))
    }

    /// Delete a shard (missing shards succeed)
    pub async fn delete_shard(
        &self,
        node_addr: &str,
        shard_id: &str,
        bucket: &str,
        object_key: &str,
    ) -> Result<()> {
        let resp = self
            .http
            .delete(format!(
                "{}/shard/delete/{shard_id}",
                node_addr.trim_end_matches('/')
            ))
            .query(&[("bucket", bucket), ("object", object_key)])
            .send()
            .await
            .map_err(|e| Error::upstream(format!("shard delete on {node_addr}: {e}")))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_for(resp, shard_id).await)
        }
    }

    /// List sidecars, optionally scoped to one object's directory
    pub async fn list_shards(
        &self,
        node_addr: &str,
        bucket: Option<&str>,
        object_key: Option<&str>,
    ) -> Result<Vec<ShardSidecar>> {
        let mut req = self
            .http
            .get(format!("{}/shard/list", node_addr.trim_end_matches('/')));
        if let Some(bucket) = bucket {
            req = req.query(&[("bucket", bucket)]);
        }
        if let Some(object) = object_key {
            req = req.query(&[("object", object)]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::upstream(format!("shard list on {node_addr}: {e}")))?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp, "list").await);
        }
        resp.json::<Vec<ShardSidecar>>()
            .await
            .map_err(|e| Error::Serialization(format!("decoding shard list: {e}")))
    }

    async fn error_for(resp: reqwest::Response, what: &str) -> Error {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Error::ShardNotFound(what.to_string()),
            StatusCode::BAD_REQUEST => Error::InvalidRequest(body),
            _ => Error::upstream(format!("shard node returned {status}: {body}")),
        }
    }
}
