//! Orphan shard sweeper
//!
//! Two kinds of garbage accumulate on a node: shards whose object was
//! deleted while this node was unreachable, and blobs whose upload
//! crashed before the sidecar landed. Both are removed once older than
//! the grace period; the catalog is the authority on what still exists.
//! Each pass also scrubs every blob against its sidecar CRC32C; a
//! corrupt shard is counted and left in place (reads recover through
//! parity, and deleting it would silently shrink redundancy).

use shardstore_client::MetaClient;
use shardstore_common::Checksum;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::service::SharedNode;

pub struct SweeperConfig {
    pub interval: Duration,
    pub grace: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            grace: Duration::from_secs(3600),
        }
    }
}

/// Run the sweep loop forever
pub async fn run(state: SharedNode, meta: MetaClient, config: SweeperConfig) {
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        ticker.tick().await;
        if let Err(e) = sweep_once(&state, &meta, config.grace).await {
            warn!(error = %e, "sweep pass failed");
        }
    }
}

/// One sweep pass; returns the number of shards removed
pub async fn sweep_once(
    state: &SharedNode,
    meta: &MetaClient,
    grace: Duration,
) -> shardstore_common::Result<u64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut removed = 0;

    for (path, sidecar) in state.all_sidecars() {
        // Scrub: cheap CRC32C of the blob against its sidecar.
        if let Ok(blob) = std::fs::read(path.with_extension("shard")) {
            if let Some(recorded) = Checksum::from_parts(sidecar.crc32c, &sidecar.checksum) {
                if !recorded.verify_fast(&blob) {
                    warn!(
                        shard = %sidecar.id,
                        bucket = %sidecar.bucket,
                        object = %sidecar.object_key,
                        "blob fails its sidecar checksum"
                    );
                    state.metrics.corrupt_shards.inc();
                }
            }
        }

        if now.saturating_sub(sidecar.uploaded_at) < grace.as_secs() {
            continue;
        }

        match meta.get_object(&sidecar.bucket, &sidecar.object_key).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(
                    shard = %sidecar.id,
                    bucket = %sidecar.bucket,
                    object = %sidecar.object_key,
                    "sweeping shard for deleted object"
                );
                state
                    .remove_shard(&sidecar.bucket, &sidecar.object_key, &sidecar.id)
                    .await;
                removed += 1;
            }
            // Metadata service unreachable or unsure: keep the shard,
            // try again next pass.
            Err(e) => {
                debug!(shard = %sidecar.id, error = %e, "skipping shard, catalog lookup failed");
            }
        }
    }

    // Blobs without a sidecar are half-written uploads; age them out by
    // file mtime.
    removed += sweep_orphan_blobs(state, grace);

    if removed > 0 {
        info!(removed, "sweep pass reclaimed shards");
    }
    Ok(removed)
}

fn sweep_orphan_blobs(state: &SharedNode, grace: Duration) -> u64 {
    let mut removed = 0;
    let root = state.shards_root();
    let mut stack = vec![root];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().is_none_or(|ext| ext != "shard") {
                continue;
            }
            if path.with_extension("meta").exists() {
                continue;
            }
            let old_enough = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| {
                    SystemTime::now()
                        .duration_since(mtime)
                        .unwrap_or_default()
                        >= grace
                })
                .unwrap_or(false);
            if old_enough && std::fs::remove_file(&path).is_ok() {
                debug!(blob = %path.display(), "removed sidecar-less blob");
                removed += 1;
            }
        }
    }
    removed
}
