//! Shard node service bodies
//!
//! The sidecar descriptor doubles as the on-disk `.meta` file format,
//! so its field names are frozen.

use serde::{Deserialize, Serialize};
use shardstore_common::{ShardType, Tier};

/// Response header carrying the shard's SHA-256 (hex)
pub const SHARD_CHECKSUM_HEADER: &str = "X-Shard-Checksum";

/// Response header carrying the shard type tag
pub const SHARD_TYPE_HEADER: &str = "X-Shard-Type";

/// Per-shard descriptor, stored as `<shard_id>.meta` next to the blob
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardSidecar {
    /// Shard id, unique within the object
    pub id: String,
    pub bucket: String,
    pub object_key: String,
    #[serde(rename = "type")]
    pub shard_type: ShardType,
    /// Position in the erasure set
    pub index: u32,
    /// Total shards in the set (k + m)
    pub total: u32,
    /// Bytes on disk
    pub size: u64,
    /// SHA-256 of the shard bytes, lowercase hex
    pub checksum: String,
    /// CRC32C of the shard bytes, for cheap blob-vs-sidecar checks
    pub crc32c: u32,
    /// Epoch seconds at upload
    pub uploaded_at: u64,
    /// Tier label of the node that stored it
    pub tier: Tier,
}

/// `POST /shard/upload` multipart field names
pub mod upload_fields {
    pub const SHARD_ID: &str = "shard_id";
    pub const BUCKET: &str = "bucket";
    pub const OBJECT_KEY: &str = "object_key";
    pub const SHARD_TYPE: &str = "shard_type";
    pub const INDEX: &str = "index";
    pub const TOTAL_SHARDS: &str = "total_shards";
    pub const DATA: &str = "data";
}

/// `201` reply for a stored shard
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadShardResponse {
    pub shard_id: String,
    pub size: u64,
    /// SHA-256 of the shard bytes, lowercase hex
    pub checksum: String,
    /// CRC32C of the shard bytes
    pub crc32c: u32,
}

/// Query parameters scoping a shard to its object directory
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShardScope {
    pub bucket: Option<String>,
    pub object: Option<String>,
}

/// `GET /info`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    pub address: String,
    pub tier: Tier,
    pub shard_count: u64,
    pub disk_usage_bytes: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_field_names() {
        let sidecar = ShardSidecar {
            id: "b1-hello.txt-0".into(),
            bucket: "b1".into(),
            object_key: "hello.txt".into(),
            shard_type: ShardType::Data,
            index: 0,
            total: 9,
            size: 64,
            checksum: "ab".repeat(32),
            crc32c: 0xdead_beef,
            uploaded_at: 1_700_000_000,
            tier: Tier::Hot,
        };
        let json = serde_json::to_value(&sidecar).unwrap();
        assert_eq!(json["type"], "data");
        assert_eq!(json["object_key"], "hello.txt");
        assert_eq!(json["uploaded_at"], 1_700_000_000u64);

        let back: ShardSidecar = serde_json::from_value(json).unwrap();
        assert_eq!(back, sidecar);
    }
}
