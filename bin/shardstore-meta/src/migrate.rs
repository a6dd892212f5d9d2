//! Server-side tier migrations
//!
//! A migration reconstructs the object's ciphertext (no decryption),
//! re-encodes it, places fresh shards on the target tier, commits the
//! tier + shard-list update through consensus, then deletes the old
//! placement best-effort. At every commit boundary either the old or
//! the new placement is fully intact.

use parking_lot::RwLock;
use shardstore_api::{MigrationState, MigrationStatusResponse};
use shardstore_catalog::{Op, StorageNode};
use shardstore_client::pipeline::{delete_placed_shards, fetch_ciphertext, place_shards};
use shardstore_common::metrics::{Counter, Gauge};
use shardstore_common::{Error, Result, Tier};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::{now_epoch, AppState};

/// Server-side ceiling on a single migration
const MIGRATION_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// Migration outcome counters
#[derive(Debug, Default)]
pub struct MigrationMetrics {
    pub submitted: Counter,
    pub succeeded: Counter,
    pub failed: Counter,
    pub running: Gauge,
}

/// In-memory registry of migrations this leader has run
///
/// Controller retries arrive as fresh submissions, so the registry only
/// needs to outlive the poll loop, not the process.
#[derive(Default)]
pub struct MigrationRegistry {
    statuses: RwLock<HashMap<String, MigrationStatusResponse>>,
    pub metrics: MigrationMetrics,
}

impl MigrationRegistry {
    /// Look up a migration's current state
    #[must_use]
    pub fn status(&self, migration_id: &str) -> Option<MigrationStatusResponse> {
        self.statuses.read().get(migration_id).cloned()
    }

    fn finish(&self, migration_id: &str, state: MigrationState, error: Option<String>) {
        let mut statuses = self.statuses.write();
        if let Some(status) = statuses.get_mut(migration_id) {
            status.state = state;
            status.error = error;
            status.finished_at = Some(now_epoch());
        }
        drop(statuses);

        self.metrics
            .running
            .set(self.metrics.running.get().saturating_sub(1));
        match state {
            MigrationState::Succeeded => self.metrics.succeeded.inc(),
            MigrationState::Failed => self.metrics.failed.inc(),
            MigrationState::Running => {}
        }
    }
}

/// Register and spawn a migration task, returning its poll handle
pub fn spawn_migration(app: AppState, bucket: String, key: String, target: Tier) -> String {
    let migration_id = Uuid::new_v4().to_string();

    app.migrations.statuses.write().insert(
        migration_id.clone(),
        MigrationStatusResponse {
            migration_id: migration_id.clone(),
            bucket: bucket.clone(),
            key: key.clone(),
            target_tier: target,
            state: MigrationState::Running,
            error: None,
            started_at: now_epoch(),
            finished_at: None,
        },
    );
    app.migrations.metrics.submitted.inc();
    app.migrations.metrics.running.add(1);

    let id = migration_id.clone();
    tokio::spawn(async move {
        let work = run_migration(&app, &bucket, &key, target);
        let outcome = tokio::time::timeout(MIGRATION_DEADLINE, work).await;
        match outcome {
            Ok(Ok(())) => {
                info!(bucket, key, %target, migration = id, "migration complete");
                app.migrations.finish(&id, MigrationState::Succeeded, None);
            }
            Ok(Err(e)) => {
                warn!(bucket, key, %target, migration = id, error = %e, "migration failed");
                app.migrations
                    .finish(&id, MigrationState::Failed, Some(e.to_string()));
            }
            Err(_) => {
                warn!(bucket, key, migration = id, "migration deadline exceeded");
                app.migrations.finish(
                    &id,
                    MigrationState::Failed,
                    Some("deadline exceeded".to_string()),
                );
            }
        }
    });

    migration_id
}

async fn run_migration(app: &AppState, bucket: &str, key: &str, target: Tier) -> Result<()> {
    let object = app
        .catalog
        .get_object(bucket, key)
        .ok_or_else(|| Error::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;

    // Repeated tier changes to the same target are idempotent; the
    // placement is already where it should be.
    if object.tier == target {
        return Ok(());
    }

    // Reconstruct the ciphertext from the current placement. The
    // envelope stays sealed; migrations never need the object key.
    let ciphertext = fetch_ciphertext(&app.nodes, &app.codec, &object).await?;
    let shards = app
        .codec
        .encode(&ciphertext)
        .map_err(shardstore_common::Error::from)?;

    let targets: Vec<StorageNode> = app
        .catalog
        .list_nodes()
        .into_iter()
        .filter(|n| n.tier == target)
        .collect();
    let required = app.codec.total_shards();
    if targets.len() < required {
        return Err(Error::upstream(format!(
            "insufficient {target} storage nodes: have {}, need {required}",
            targets.len()
        )));
    }

    let placed = place_shards(
        &app.nodes,
        &targets,
        bucket,
        key,
        app.codec.data_shards(),
        shards,
    )
    .await?;

    // Commit the swap. If this fails the new shards are orphans for the
    // sweeper and the old placement is still authoritative.
    let commit = app
        .propose(Op::UpdateObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            tier: Some(target),
            last_accessed: None,
            shards: Some(placed.clone()),
        })
        .await;
    if let Err(e) = commit {
        delete_placed_shards(&app.nodes, bucket, key, &placed).await;
        return Err(e);
    }

    // Old placement is now unreferenced; reclaim it best-effort.
    delete_placed_shards(&app.nodes, bucket, key, &object.shards).await;
    Ok(())
}
