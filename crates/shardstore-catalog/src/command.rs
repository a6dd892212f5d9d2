//! Catalog commands
//!
//! The only way to mutate the catalog. A command is a tagged union of
//! concrete variants plus the clock stamped by the leader's API layer at
//! propose time; replicas apply identical bytes and read only that
//! stamp, which keeps replay deterministic.

use serde::{Deserialize, Serialize};
use shardstore_common::Tier;
use std::collections::BTreeMap;

use crate::types::{AclRight, ObjectMeta, ShardInfo, StorageNode};

/// A replicated catalog command
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Epoch seconds, assigned by the leader at propose time
    pub at: u64,
    pub op: Op,
}

impl Command {
    /// Create a command stamped with the given clock
    #[must_use]
    pub const fn new(at: u64, op: Op) -> Self {
        Self { at, op }
    }
}

/// Command variants
///
/// Externally tagged so the log store can use a non-self-describing
/// encoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    CreateBucket {
        name: String,
        owner: String,
        #[serde(default)]
        acl: BTreeMap<String, AclRight>,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
    },
    /// Removes the bucket and cascades to every object in it; a missing
    /// bucket is a no-op.
    DeleteBucket { name: String },
    /// Inserts a fully placed object. `created_at`/`last_accessed` are
    /// overwritten with the command clock.
    CreateObject { object: ObjectMeta },
    /// Patches tier, access time and/or the shard list.
    UpdateObject {
        bucket: String,
        key: String,
        tier: Option<Tier>,
        last_accessed: Option<u64>,
        shards: Option<Vec<ShardInfo>>,
    },
    /// Removes an object; missing is a no-op.
    DeleteObject { bucket: String, key: String },
    /// Sets `last_accessed` to the command clock.
    UpdateAccessTime { bucket: String, key: String },
    /// Upserts a storage node in the discovery directory.
    RegisterNode { node: StorageNode },
}

/// Why the FSM refused a command
///
/// Rejections are values, not errors: the entry still commits to the
/// log, the state is simply left untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Rejection {
    #[error("bucket already exists: {name}")]
    BucketExists { name: String },
    #[error("bucket not found: {name}")]
    BucketMissing { name: String },
    #[error("object already exists: {bucket}/{key}")]
    ObjectExists { bucket: String, key: String },
    #[error("object not found: {bucket}/{key}")]
    ObjectMissing { bucket: String, key: String },
    #[error("invalid shard list: {reason}")]
    InvalidShards { reason: String },
}

impl From<Rejection> for shardstore_common::Error {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::BucketExists { name } => Self::BucketAlreadyExists(name),
            Rejection::BucketMissing { name } => Self::BucketNotFound(name),
            Rejection::ObjectExists { bucket, key } => Self::ObjectAlreadyExists { bucket, key },
            Rejection::ObjectMissing { bucket, key } => Self::ObjectNotFound { bucket, key },
            Rejection::InvalidShards { reason } => Self::StateConflict(reason),
        }
    }
}

/// Reply returned through the consensus layer for an applied command
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct CommandReply {
    /// `None` means the command mutated the state
    pub rejection: Option<Rejection>,
}

impl CommandReply {
    /// Successful apply
    #[must_use]
    pub const fn ok() -> Self {
        Self { rejection: None }
    }

    /// Refused apply
    #[must_use]
    pub const fn rejected(rejection: Rejection) -> Self {
        Self {
            rejection: Some(rejection),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json_shape() {
        let cmd = Command::new(
            1_700_000_000,
            Op::DeleteBucket {
                name: "b1".to_string(),
            },
        );
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["at"], 1_700_000_000u64);
        assert_eq!(json["op"]["delete_bucket"]["name"], "b1");

        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }
}
