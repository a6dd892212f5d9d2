//! Catalog record types
//!
//! These are both the in-memory state and the JSON the metadata API
//! serves, so field names follow the wire convention.

use serde::{Deserialize, Serialize};
use shardstore_common::{NodeId, ShardType, Tier};
use std::collections::BTreeMap;

/// Access level a user holds on a bucket
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclRight {
    Read,
    Write,
    Admin,
}

/// Bucket record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketMeta {
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub acl: BTreeMap<String, AclRight>,
    pub created_at: u64,
    /// Number of objects currently in the bucket (maintained by the FSM)
    pub object_count: u64,
    /// Sum of object sizes in the bucket (maintained by the FSM)
    pub total_size: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Placement record for one shard of an object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardInfo {
    /// Globally unique within the object
    pub shard_id: String,
    pub node_id: NodeId,
    pub node_addr: String,
    pub shard_type: ShardType,
    /// Position in the erasure set (0..k+m-1)
    pub index: u32,
    /// Bytes on disk
    pub size: u64,
    /// SHA-256 of the shard bytes, lowercase hex
    pub checksum: String,
    /// CRC32C of the shard bytes; the read path rejects a fetched
    /// shard cheaply on this before the SHA-256 comparison
    pub crc32c: u32,
}

/// Object record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub bucket: String,
    pub key: String,
    /// Original plaintext size in bytes
    pub size: u64,
    pub tier: Tier,
    pub created_at: u64,
    pub last_accessed: u64,
    pub content_type: String,
    /// SHA-256 of the plaintext, lowercase hex
    pub checksum: String,
    /// Opaque handle into the secret provider; never key material
    pub encryption_key_ref: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub shards: Vec<ShardInfo>,
}

/// A registered storage node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageNode {
    pub node_id: NodeId,
    /// Base HTTP address, e.g. `http://10.0.0.7:7411`
    pub address: String,
    pub tier: Tier,
    pub registered_at: u64,
}

/// Composite map key for an object: `<bucket>/<key>`
///
/// Unambiguous because bucket names cannot contain `/`.
#[must_use]
pub fn object_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}
