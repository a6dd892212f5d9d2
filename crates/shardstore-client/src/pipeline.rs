//! Write/read pipeline
//!
//! Write: object key → encrypt → erasure-encode → fan out to storage
//! nodes → commit metadata. Read: metadata → fetch ≥ k shards →
//! reconstruct → decrypt → verify. The pipeline never half-commits:
//! metadata is only written once every shard is durable, and a failed
//! fan-out cleans up after itself best-effort.

use futures::future::join_all;
use shardstore_api::{CreateObjectRequest, ListObjectsParams, ListObjectsResponse};
use shardstore_catalog::{BucketMeta, ObjectMeta, ShardInfo, StorageNode};
use shardstore_common::{sha256_hex, Checksum, Error, Result, ShardType, Tier};
use shardstore_crypto::{SecretProvider, ENVELOPE_OVERHEAD};
use shardstore_erasure::ShardCodec;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::meta::MetaClient;
use crate::node::NodeClient;

/// Client-side object pipeline
pub struct Pipeline {
    meta: MetaClient,
    nodes: NodeClient,
    codec: Arc<ShardCodec>,
    secrets: Arc<dyn SecretProvider>,
}

impl Pipeline {
    /// Assemble a pipeline from its collaborators
    pub fn new(
        meta: MetaClient,
        codec: Arc<ShardCodec>,
        secrets: Arc<dyn SecretProvider>,
    ) -> Result<Self> {
        Ok(Self {
            meta,
            nodes: NodeClient::new()?,
            codec,
            secrets,
        })
    }

    /// The metadata client this pipeline talks through
    #[must_use]
    pub fn meta(&self) -> &MetaClient {
        &self.meta
    }

    /// Upload an object: encrypt, encode, place, then commit metadata
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        plaintext: &[u8],
        content_type: &str,
        tier: Tier,
        metadata: BTreeMap<String, String>,
    ) -> Result<ObjectMeta> {
        let scope = format!("{bucket}/{key}");
        let (key_ref, material) = self.secrets.generate_key(&scope).await?;

        let sealed = shardstore_crypto::seal(plaintext, &material)?;
        let checksum = sha256_hex(plaintext);

        let shards = self
            .codec
            .encode(&sealed)
            .map_err(shardstore_common::Error::from)?;

        let targets = self.placement_nodes(tier).await?;
        let placed = place_shards(
            &self.nodes,
            &targets,
            bucket,
            key,
            self.codec.data_shards(),
            shards,
        )
        .await?;

        debug!(bucket, key, shards = placed.len(), "shards placed, committing metadata");

        let req = CreateObjectRequest {
            key: key.to_string(),
            size: plaintext.len() as u64,
            tier,
            content_type: content_type.to_string(),
            checksum,
            encryption_key_ref: key_ref,
            metadata,
            shards: placed.clone(),
        };
        match self.meta.create_object(bucket, &req).await {
            Ok(object) => Ok(object),
            Err(e) => {
                // The commit failed; the uploaded shards are orphans.
                // Clean up best-effort, surface the original error.
                delete_placed_shards(&self.nodes, bucket, key, &placed).await;
                Err(e)
            }
        }
    }

    /// Download an object: fetch, reconstruct, decrypt, verify
    pub async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let object = self.meta.get_object(bucket, key).await?;

        let ciphertext = fetch_ciphertext(&self.nodes, &self.codec, &object).await?;

        let material = self.secrets.unwrap_key(&object.encryption_key_ref).await?;
        let mut plaintext = shardstore_crypto::open(&ciphertext, &material)?;
        plaintext.truncate(object.size as usize);

        if sha256_hex(&plaintext) != object.checksum {
            return Err(Error::IntegrityFailure(format!(
                "object checksum mismatch for {bucket}/{key}"
            )));
        }

        // Record the read hit without holding up the response.
        let meta = self.meta.clone();
        let (bucket, key) = (bucket.to_string(), key.to_string());
        tokio::spawn(async move {
            if let Err(e) = meta.touch_object(&bucket, &key).await {
                debug!(bucket, key, error = %e, "access-time update dropped");
            }
        });

        Ok(plaintext)
    }

    /// Delete an object: metadata first, shard blobs best-effort
    ///
    /// Anything missed here is collected by the node sweeper.
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let object = match self.meta.get_object(bucket, key).await {
            Ok(object) => Some(object),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        self.meta.delete_object(bucket, key).await?;

        if let Some(object) = object {
            delete_placed_shards(&self.nodes, bucket, key, &object.shards).await;
        }
        Ok(())
    }

    /// List a page of a bucket's objects
    pub async fn list(
        &self,
        bucket: &str,
        params: &ListObjectsParams,
    ) -> Result<ListObjectsResponse> {
        self.meta.list_objects(bucket, params).await
    }

    /// List buckets
    pub async fn list_buckets(&self) -> Result<Vec<BucketMeta>> {
        self.meta.list_buckets().await
    }

    /// Pick the placement node set for a tier
    ///
    /// Requires at least k+m registered nodes carrying the tier label;
    /// shard `i` goes to node `i mod n`.
    async fn placement_nodes(&self, tier: Tier) -> Result<Vec<StorageNode>> {
        let nodes: Vec<StorageNode> = self
            .meta
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.tier == tier)
            .collect();

        let required = self.codec.total_shards();
        if nodes.len() < required {
            return Err(Error::upstream(format!(
                "insufficient {tier} storage nodes: have {}, need {required}",
                nodes.len()
            )));
        }
        Ok(nodes)
    }
}

/// Shard id for position `index` of an object
#[must_use]
pub fn shard_id(bucket: &str, key: &str, index: usize) -> String {
    format!("{bucket}-{key}-{index}")
}

/// Fan the encoded shards out to their nodes in parallel
///
/// Shard `i` is assigned to `targets[i % targets.len()]`; the first
/// `data_shards` positions are data, the rest parity. All uploads must
/// succeed; on any failure the successfully placed shards are deleted
/// best-effort and the first error is returned, so no partial placement
/// survives.
pub async fn place_shards(
    nodes: &NodeClient,
    targets: &[StorageNode],
    bucket: &str,
    key: &str,
    data_shards: usize,
    shards: Vec<Vec<u8>>,
) -> Result<Vec<ShardInfo>> {
    let total = shards.len() as u32;

    let uploads = shards.into_iter().enumerate().map(|(i, data)| {
        let node = &targets[i % targets.len()];
        let id = shard_id(bucket, key, i);
        let size = data.len() as u64;
        let shard_type = if i < data_shards {
            ShardType::Data
        } else {
            ShardType::Parity
        };
        async move {
            let resp = nodes
                .upload_shard(
                    &node.address,
                    &id,
                    bucket,
                    key,
                    shard_type,
                    i as u32,
                    total,
                    data,
                )
                .await?;
            Ok::<_, Error>(ShardInfo {
                shard_id: resp.shard_id,
                node_id: node.node_id,
                node_addr: node.address.clone(),
                shard_type,
                index: i as u32,
                size,
                checksum: resp.checksum,
                crc32c: resp.crc32c,
            })
        }
    });

    let results = join_all(uploads).await;

    let mut placed = Vec::with_capacity(results.len());
    let mut first_error = None;
    for result in results {
        match result {
            Ok(info) => placed.push(info),
            Err(e) if first_error.is_none() => first_error = Some(e),
            Err(_) => {}
        }
    }

    if let Some(error) = first_error {
        delete_placed_shards(nodes, bucket, key, &placed).await;
        return Err(error);
    }

    placed.sort_by_key(|s| s.index);
    Ok(placed)
}

/// Reconstruct an object's ciphertext from its placed shards
///
/// Fetches every shard in parallel, tolerates up to m losses, verifies
/// each fetched shard against its recorded checksums (CRC32C first for
/// the cheap reject, then SHA-256; a mismatch is an integrity failure,
/// not a loss) and decodes.
pub async fn fetch_ciphertext(
    nodes: &NodeClient,
    codec: &ShardCodec,
    object: &ObjectMeta,
) -> Result<Vec<u8>> {
    let total = codec.total_shards();
    let mut slots: Vec<Option<Vec<u8>>> = vec![None; total];

    let fetches = object.shards.iter().map(|shard| async move {
        let result = nodes
            .download_shard(&shard.node_addr, &shard.shard_id, &object.bucket, &object.key)
            .await;
        (shard, result)
    });

    for (shard, result) in join_all(fetches).await {
        match result {
            Ok((bytes, _header_checksum)) => {
                let recorded = Checksum::from_parts(shard.crc32c, &shard.checksum)
                    .ok_or_else(|| {
                        Error::Serialization(format!(
                            "unparseable recorded checksum for shard {}",
                            shard.shard_id
                        ))
                    })?;
                if !recorded.verify_full(&bytes) {
                    return Err(Error::IntegrityFailure(format!(
                        "shard {} does not match its recorded checksum",
                        shard.shard_id
                    )));
                }
                if (shard.index as usize) < total {
                    slots[shard.index as usize] = Some(bytes.to_vec());
                }
            }
            Err(e) => {
                // A lost shard is tolerated up to m; reconstruction
                // decides whether we are still whole.
                warn!(shard = %shard.shard_id, error = %e, "shard fetch failed");
            }
        }
    }

    let ciphertext_len = object.size as usize + ENVELOPE_OVERHEAD;
    codec
        .decode(&slots, ciphertext_len)
        .map_err(shardstore_common::Error::from)
}

/// Best-effort deletion of placed shards (write-abort and delete paths)
pub async fn delete_placed_shards(
    nodes: &NodeClient,
    bucket: &str,
    key: &str,
    shards: &[ShardInfo],
) {
    let deletes = shards.iter().map(|shard| async move {
        if let Err(e) = nodes
            .delete_shard(&shard.node_addr, &shard.shard_id, bucket, key)
            .await
        {
            warn!(shard = %shard.shard_id, error = %e, "orphan shard left for sweeper");
        }
    });
    join_all(deletes).await;
}
