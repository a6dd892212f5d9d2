//! Metadata REST API bodies

use serde::{Deserialize, Serialize};
use shardstore_catalog::{AclRight, ObjectMeta, ShardInfo, StorageNode};
use shardstore_common::Tier;
use std::collections::BTreeMap;

/// `POST /buckets`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBucketRequest {
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub acl: BTreeMap<String, AclRight>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// `POST /buckets/{bucket}/objects`
///
/// Submitted by the write pipeline once every shard is durable.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateObjectRequest {
    pub key: String,
    /// Original plaintext size in bytes
    pub size: u64,
    pub tier: Tier,
    pub content_type: String,
    /// SHA-256 of the plaintext, lowercase hex
    pub checksum: String,
    pub encryption_key_ref: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub shards: Vec<ShardInfo>,
}

/// `PATCH /buckets/{bucket}/objects/{key}`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateObjectRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<Vec<ShardInfo>>,
}

/// Query parameters for `GET /buckets/{bucket}/objects`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListObjectsParams {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub start_after: Option<String>,
    #[serde(default)]
    pub max_keys: Option<usize>,
}

/// `GET /buckets/{bucket}/objects` response
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListObjectsResponse {
    pub objects: Vec<ObjectMeta>,
    pub is_truncated: bool,
    /// Pass back as `startAfter` to fetch the next page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_start_after: Option<String>,
}

/// `GET /cluster/status`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// `follower` | `candidate` | `leader` | `learner`
    pub state: String,
    /// HTTP address of the current leader, when known
    #[serde(default)]
    pub leader: Option<String>,
    #[serde(default)]
    pub last_index: Option<u64>,
    #[serde(default)]
    pub applied_index: Option<u64>,
}

/// `POST /cluster/join`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub node_id: u64,
    /// HTTP address of the joining node
    pub addr: String,
}

/// `POST /nodes` — a shard node announcing itself
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    pub node: StorageNode,
}

/// `POST /buckets/{bucket}/objects/{key}/migrations`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSubmitRequest {
    pub target_tier: Tier,
}

/// `202` reply carrying the handle to poll
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSubmitResponse {
    pub migration_id: String,
}

/// Migration lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Running,
    Succeeded,
    Failed,
}

impl MigrationState {
    /// Whether this state is terminal
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// `GET /migrations/{id}`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatusResponse {
    pub migration_id: String,
    pub bucket: String,
    pub key: String,
    pub target_tier: Tier,
    pub state: MigrationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
}

/// Error body every non-2xx metadata response carries
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_object_wire_names() {
        let req: UpdateObjectRequest =
            serde_json::from_str(r#"{"tier":"cold","lastAccessed":1700000000}"#).unwrap();
        assert_eq!(req.tier, Some(Tier::Cold));
        assert_eq!(req.last_accessed, Some(1_700_000_000));
        assert!(req.shards.is_none());
    }

    #[test]
    fn test_migration_state_terminal() {
        assert!(!MigrationState::Running.is_terminal());
        assert!(MigrationState::Succeeded.is_terminal());
        assert!(MigrationState::Failed.is_terminal());
    }
}
