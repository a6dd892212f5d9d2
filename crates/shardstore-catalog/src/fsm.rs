//! The catalog state machine
//!
//! Apply takes the writer lock; reads and snapshots take the shared
//! lock, so a snapshot never observes a half-applied command.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shardstore_common::{ErasureParams, ShardType};
use std::collections::BTreeMap;

use crate::command::{Command, Op, Rejection};
use crate::types::{object_key, BucketMeta, ObjectMeta, ShardInfo, StorageNode};

/// Complete catalog state
///
/// `BTreeMap`s keep serialization order stable: two replicas that
/// applied the same log produce byte-identical snapshots.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogState {
    /// Buckets keyed by name
    pub buckets: BTreeMap<String, BucketMeta>,
    /// Objects keyed by `<bucket>/<key>`
    pub objects: BTreeMap<String, ObjectMeta>,
    /// Storage node directory keyed by node id
    pub nodes: BTreeMap<String, StorageNode>,
}

/// The metadata state machine
pub struct Catalog {
    params: ErasureParams,
    state: RwLock<CatalogState>,
}

impl Catalog {
    /// Create an empty catalog validating shard lists against the
    /// deployment's erasure parameters
    #[must_use]
    pub fn new(params: ErasureParams) -> Self {
        Self {
            params,
            state: RwLock::new(CatalogState::default()),
        }
    }

    /// The erasure parameters this catalog validates against
    #[must_use]
    pub const fn params(&self) -> ErasureParams {
        self.params
    }

    /// Apply one command under the writer lock
    ///
    /// A rejection leaves the state untouched; the caller surfaces it to
    /// the client as a conflict.
    pub fn apply(&self, cmd: &Command) -> Result<(), Rejection> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        match &cmd.op {
            Op::CreateBucket {
                name,
                owner,
                acl,
                metadata,
            } => {
                if state.buckets.contains_key(name) {
                    return Err(Rejection::BucketExists { name: name.clone() });
                }
                state.buckets.insert(
                    name.clone(),
                    BucketMeta {
                        name: name.clone(),
                        owner: owner.clone(),
                        acl: acl.clone(),
                        created_at: cmd.at,
                        object_count: 0,
                        total_size: 0,
                        metadata: metadata.clone(),
                    },
                );
                Ok(())
            }

            Op::DeleteBucket { name } => {
                // Missing bucket is a no-op; present bucket cascades to
                // every object keyed under it.
                if state.buckets.remove(name).is_some() {
                    state.objects.retain(|_, obj| obj.bucket != *name);
                }
                Ok(())
            }

            Op::CreateObject { object } => {
                let Some(bucket) = state.buckets.get_mut(&object.bucket) else {
                    return Err(Rejection::BucketMissing {
                        name: object.bucket.clone(),
                    });
                };
                let map_key = object_key(&object.bucket, &object.key);
                if state.objects.contains_key(&map_key) {
                    return Err(Rejection::ObjectExists {
                        bucket: object.bucket.clone(),
                        key: object.key.clone(),
                    });
                }
                self.validate_shards(&object.shards)?;

                bucket.object_count += 1;
                bucket.total_size += object.size;

                let mut stored = object.clone();
                stored.created_at = cmd.at;
                stored.last_accessed = cmd.at;
                state.objects.insert(map_key, stored);
                Ok(())
            }

            Op::UpdateObject {
                bucket,
                key,
                tier,
                last_accessed,
                shards,
            } => {
                if let Some(new_shards) = shards {
                    self.validate_shards(new_shards)?;
                }
                let map_key = object_key(bucket, key);
                let Some(object) = state.objects.get_mut(&map_key) else {
                    return Err(Rejection::ObjectMissing {
                        bucket: bucket.clone(),
                        key: key.clone(),
                    });
                };
                if let Some(tier) = tier {
                    object.tier = *tier;
                }
                if let Some(ts) = last_accessed {
                    object.last_accessed = *ts;
                }
                if let Some(new_shards) = shards {
                    object.shards = new_shards.clone();
                }
                Ok(())
            }

            Op::DeleteObject { bucket, key } => {
                let map_key = object_key(bucket, key);
                if let Some(removed) = state.objects.remove(&map_key) {
                    if let Some(bucket) = state.buckets.get_mut(&removed.bucket) {
                        bucket.object_count = bucket.object_count.saturating_sub(1);
                        bucket.total_size = bucket.total_size.saturating_sub(removed.size);
                    }
                }
                Ok(())
            }

            Op::UpdateAccessTime { bucket, key } => {
                let map_key = object_key(bucket, key);
                let Some(object) = state.objects.get_mut(&map_key) else {
                    return Err(Rejection::ObjectMissing {
                        bucket: bucket.clone(),
                        key: key.clone(),
                    });
                };
                object.last_accessed = cmd.at;
                Ok(())
            }

            Op::RegisterNode { node } => {
                let mut stored = node.clone();
                stored.registered_at = cmd.at;
                state.nodes.insert(node.node_id.to_string(), stored);
                Ok(())
            }
        }
    }

    /// Enforce the shard-shape invariant: exactly k+m shards, indices a
    /// permutation of 0..k+m-1, data before parity at the k boundary.
    fn validate_shards(&self, shards: &[ShardInfo]) -> Result<(), Rejection> {
        let total = self.params.total_shards();
        let k = self.params.data_shards as usize;

        if shards.len() != total {
            return Err(Rejection::InvalidShards {
                reason: format!("expected {total} shards, got {}", shards.len()),
            });
        }

        let mut seen = vec![false; total];
        for shard in shards {
            let idx = shard.index as usize;
            if idx >= total {
                return Err(Rejection::InvalidShards {
                    reason: format!("shard index {idx} out of range 0..{total}"),
                });
            }
            if seen[idx] {
                return Err(Rejection::InvalidShards {
                    reason: format!("duplicate shard index {idx}"),
                });
            }
            seen[idx] = true;

            let expected = if idx < k {
                ShardType::Data
            } else {
                ShardType::Parity
            };
            if shard.shard_type != expected {
                return Err(Rejection::InvalidShards {
                    reason: format!("shard index {idx} must be {expected}"),
                });
            }
        }
        Ok(())
    }

    /// Serialize the whole state
    ///
    /// Takes the shared lock, so it cannot interleave with an apply.
    pub fn snapshot(&self) -> Result<Vec<u8>, serde_json::Error> {
        let state = self.state.read();
        serde_json::to_vec(&*state)
    }

    /// Replace the state wholesale from a snapshot
    pub fn restore(&self, bytes: &[u8]) -> Result<(), serde_json::Error> {
        let restored: CatalogState = serde_json::from_slice(bytes)?;
        *self.state.write() = restored;
        Ok(())
    }

    // ---- Read surface (eventually consistent on followers) ----

    /// Look up a bucket by name
    #[must_use]
    pub fn get_bucket(&self, name: &str) -> Option<BucketMeta> {
        self.state.read().buckets.get(name).cloned()
    }

    /// All buckets in name order
    #[must_use]
    pub fn list_buckets(&self) -> Vec<BucketMeta> {
        self.state.read().buckets.values().cloned().collect()
    }

    /// Look up an object
    #[must_use]
    pub fn get_object(&self, bucket: &str, key: &str) -> Option<ObjectMeta> {
        self.state
            .read()
            .objects
            .get(&object_key(bucket, key))
            .cloned()
    }

    /// Page through a bucket's objects in key order
    ///
    /// Returns the page and whether more results remain.
    #[must_use]
    pub fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> (Vec<ObjectMeta>, bool) {
        let state = self.state.read();
        let range_start = object_key(bucket, "");

        let mut page = Vec::new();
        let mut truncated = false;
        for obj in state
            .objects
            .range(range_start..)
            .map(|(_, obj)| obj)
            .take_while(|obj| obj.bucket == bucket)
            .filter(|obj| obj.key.starts_with(prefix))
            .filter(|obj| start_after.is_none_or(|after| obj.key.as_str() > after))
        {
            if page.len() == limit {
                truncated = true;
                break;
            }
            page.push(obj.clone());
        }
        (page, truncated)
    }

    /// The storage node directory
    #[must_use]
    pub fn list_nodes(&self) -> Vec<StorageNode> {
        self.state.read().nodes.values().cloned().collect()
    }

    /// Whether an object exists (used by the node sweeper)
    #[must_use]
    pub fn object_exists(&self, bucket: &str, key: &str) -> bool {
        self.state.read().objects.contains_key(&object_key(bucket, key))
    }

    /// (bucket, object, node) counts for metrics
    #[must_use]
    pub fn counts(&self) -> (u64, u64, u64) {
        let state = self.state.read();
        (
            state.buckets.len() as u64,
            state.objects.len() as u64,
            state.nodes.len() as u64,
        )
    }

    /// Clone the full state (test and debugging aid)
    #[must_use]
    pub fn dump(&self) -> CatalogState {
        self.state.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardstore_common::{NodeId, Tier};

    fn catalog() -> Catalog {
        Catalog::new(ErasureParams::new(6, 3))
    }

    fn cmd(at: u64, op: Op) -> Command {
        Command::new(at, op)
    }

    fn create_bucket(name: &str) -> Op {
        Op::CreateBucket {
            name: name.to_string(),
            owner: "alice".to_string(),
            acl: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    fn shard_set(params: ErasureParams) -> Vec<ShardInfo> {
        let k = params.data_shards as usize;
        (0..params.total_shards())
            .map(|i| ShardInfo {
                shard_id: format!("b1-k1-{i}"),
                node_id: NodeId::new(),
                node_addr: format!("http://node{i}:7411"),
                shard_type: if i < k {
                    ShardType::Data
                } else {
                    ShardType::Parity
                },
                index: i as u32,
                size: 64,
                checksum: "00".repeat(32),
                crc32c: 0,
            })
            .collect()
    }

    fn object(bucket: &str, key: &str, size: u64) -> ObjectMeta {
        ObjectMeta {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
            tier: Tier::Hot,
            created_at: 0,
            last_accessed: 0,
            content_type: "text/plain".to_string(),
            checksum: "11".repeat(32),
            encryption_key_ref: "local:test".to_string(),
            metadata: BTreeMap::new(),
            shards: shard_set(ErasureParams::new(6, 3)),
        }
    }

    #[test]
    fn test_create_bucket_not_idempotent() {
        let cat = catalog();
        assert!(cat.apply(&cmd(1, create_bucket("b1"))).is_ok());
        assert!(matches!(
            cat.apply(&cmd(2, create_bucket("b1"))),
            Err(Rejection::BucketExists { .. })
        ));
        // The original survives the rejected replace.
        assert_eq!(cat.get_bucket("b1").unwrap().created_at, 1);
    }

    #[test]
    fn test_counters_track_objects() {
        let cat = catalog();
        cat.apply(&cmd(1, create_bucket("b2"))).unwrap();

        for (i, size) in [100u64, 200, 300].iter().enumerate() {
            let mut obj = object("b2", &format!("o{i}"), *size);
            obj.shards = shard_set(cat.params());
            cat.apply(&cmd(2, Op::CreateObject { object: obj })).unwrap();
        }
        let bucket = cat.get_bucket("b2").unwrap();
        assert_eq!(bucket.object_count, 3);
        assert_eq!(bucket.total_size, 600);

        cat.apply(&cmd(3, Op::DeleteObject {
            bucket: "b2".into(),
            key: "o1".into(),
        }))
        .unwrap();
        let bucket = cat.get_bucket("b2").unwrap();
        assert_eq!(bucket.object_count, 2);
        assert_eq!(bucket.total_size, 400);

        // Deleting again is a no-op, counters stay put.
        cat.apply(&cmd(4, Op::DeleteObject {
            bucket: "b2".into(),
            key: "o1".into(),
        }))
        .unwrap();
        let bucket = cat.get_bucket("b2").unwrap();
        assert_eq!(bucket.object_count, 2);
        assert_eq!(bucket.total_size, 400);
    }

    #[test]
    fn test_cascade_delete() {
        let cat = catalog();
        cat.apply(&cmd(1, create_bucket("b1"))).unwrap();
        cat.apply(&cmd(1, create_bucket("b2"))).unwrap();
        cat.apply(&cmd(2, Op::CreateObject {
            object: object("b1", "x", 10),
        }))
        .unwrap();
        cat.apply(&cmd(2, Op::CreateObject {
            object: object("b2", "y", 10),
        }))
        .unwrap();

        cat.apply(&cmd(3, Op::DeleteBucket { name: "b1".into() }))
            .unwrap();

        assert!(cat.get_bucket("b1").is_none());
        assert!(cat.get_object("b1", "x").is_none());
        // Unrelated bucket untouched.
        assert!(cat.get_object("b2", "y").is_some());

        let state = cat.dump();
        assert!(state.objects.values().all(|o| o.bucket != "b1"));
    }

    #[test]
    fn test_create_object_requires_bucket() {
        let cat = catalog();
        assert!(matches!(
            cat.apply(&cmd(1, Op::CreateObject {
                object: object("nope", "k", 1),
            })),
            Err(Rejection::BucketMissing { .. })
        ));
    }

    #[test]
    fn test_shard_shape_rejections() {
        let cat = catalog();
        cat.apply(&cmd(1, create_bucket("b1"))).unwrap();

        // Wrong count
        let mut obj = object("b1", "short", 1);
        obj.shards.pop();
        assert!(matches!(
            cat.apply(&cmd(2, Op::CreateObject { object: obj })),
            Err(Rejection::InvalidShards { .. })
        ));

        // Duplicate index
        let mut obj = object("b1", "dup", 1);
        obj.shards[1].index = 0;
        assert!(matches!(
            cat.apply(&cmd(2, Op::CreateObject { object: obj })),
            Err(Rejection::InvalidShards { .. })
        ));

        // Parity where data belongs
        let mut obj = object("b1", "swapped", 1);
        obj.shards[0].shard_type = ShardType::Parity;
        assert!(matches!(
            cat.apply(&cmd(2, Op::CreateObject { object: obj })),
            Err(Rejection::InvalidShards { .. })
        ));
    }

    #[test]
    fn test_update_object_and_access_time() {
        let cat = catalog();
        cat.apply(&cmd(1, create_bucket("b1"))).unwrap();
        cat.apply(&cmd(2, Op::CreateObject {
            object: object("b1", "x", 5),
        }))
        .unwrap();

        cat.apply(&cmd(3, Op::UpdateObject {
            bucket: "b1".into(),
            key: "x".into(),
            tier: Some(Tier::Cold),
            last_accessed: None,
            shards: None,
        }))
        .unwrap();
        assert_eq!(cat.get_object("b1", "x").unwrap().tier, Tier::Cold);

        cat.apply(&cmd(9, Op::UpdateAccessTime {
            bucket: "b1".into(),
            key: "x".into(),
        }))
        .unwrap();
        assert_eq!(cat.get_object("b1", "x").unwrap().last_accessed, 9);

        assert!(matches!(
            cat.apply(&cmd(9, Op::UpdateAccessTime {
                bucket: "b1".into(),
                key: "missing".into(),
            })),
            Err(Rejection::ObjectMissing { .. })
        ));
    }

    #[test]
    fn test_tier_change_idempotent() {
        let cat = catalog();
        cat.apply(&cmd(1, create_bucket("b1"))).unwrap();
        cat.apply(&cmd(2, Op::CreateObject {
            object: object("b1", "x", 5),
        }))
        .unwrap();

        let migrate = Op::UpdateObject {
            bucket: "b1".into(),
            key: "x".into(),
            tier: Some(Tier::Cold),
            last_accessed: None,
            shards: Some(shard_set(cat.params())),
        };
        cat.apply(&cmd(3, migrate.clone())).unwrap();
        let once = cat.dump();
        cat.apply(&cmd(3, migrate)).unwrap();
        assert_eq!(cat.dump(), once);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let cat = catalog();
        cat.apply(&cmd(1, create_bucket("b1"))).unwrap();
        cat.apply(&cmd(2, Op::CreateObject {
            object: object("b1", "deep/path/x", 5),
        }))
        .unwrap();
        cat.apply(&cmd(3, Op::RegisterNode {
            node: StorageNode {
                node_id: NodeId::new(),
                address: "http://n1:7411".into(),
                tier: Tier::Hot,
                registered_at: 0,
            },
        }))
        .unwrap();

        let snap = cat.snapshot().unwrap();
        let other = Catalog::new(cat.params());
        other.restore(&snap).unwrap();

        assert_eq!(cat.dump(), other.dump());
        assert_eq!(snap, other.snapshot().unwrap());
    }

    #[test]
    fn test_replay_determinism() {
        // The same log applied to two fresh catalogs yields
        // byte-identical snapshots.
        let log: Vec<Command> = vec![
            cmd(1, create_bucket("b1")),
            cmd(2, Op::CreateObject {
                object: object("b1", "a", 10),
            }),
            cmd(3, Op::CreateObject {
                object: object("b1", "b", 20),
            }),
            cmd(4, Op::UpdateObject {
                bucket: "b1".into(),
                key: "a".into(),
                tier: Some(Tier::Cold),
                last_accessed: Some(4),
                shards: None,
            }),
            cmd(5, Op::DeleteObject {
                bucket: "b1".into(),
                key: "b".into(),
            }),
            cmd(6, create_bucket("b2")),
            cmd(7, Op::DeleteBucket { name: "b2".into() }),
        ];

        let a = catalog();
        let b = catalog();
        for command in &log {
            let ra = a.apply(command);
            let rb = b.apply(command);
            assert_eq!(ra, rb);
        }
        assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
    }

    #[test]
    fn test_list_objects_paging() {
        let cat = catalog();
        cat.apply(&cmd(1, create_bucket("b1"))).unwrap();
        for key in ["a/1", "a/2", "b/1", "c/1"] {
            cat.apply(&cmd(2, Op::CreateObject {
                object: object("b1", key, 1),
            }))
            .unwrap();
        }

        let (page, truncated) = cat.list_objects("b1", "", None, 3);
        assert_eq!(page.len(), 3);
        assert!(truncated);
        assert_eq!(page[0].key, "a/1");

        let (page, truncated) = cat.list_objects("b1", "", Some("b/1"), 10);
        assert_eq!(page.len(), 1);
        assert!(!truncated);
        assert_eq!(page[0].key, "c/1");

        let (page, _) = cat.list_objects("b1", "a/", None, 10);
        assert_eq!(page.len(), 2);
    }
}
