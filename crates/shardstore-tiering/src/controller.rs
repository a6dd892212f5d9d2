//! The tier migration controller
//!
//! One ingest task applies the decision rules and feeds a bounded
//! queue; a fixed pool of workers submits migrations and monitors each
//! one to a terminal state. Offsets are committed after the
//! enqueue-or-drop decision, never after worker completion, so the
//! event loop can never be blocked by slow migrations.

use async_trait::async_trait;
use shardstore_api::{MigrationState, MigrationStatusResponse, TieringRequest};
use shardstore_client::MetaClient;
use shardstore_common::{Result, Tier};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::counters::TierCounters;
use crate::stream::EventStream;

/// Controller tuning
#[derive(Clone, Debug)]
pub struct TierControllerConfig {
    /// Recommendations below this confidence are skipped
    pub confidence_threshold: f64,
    /// Worker pool size; queue capacity is twice this
    pub concurrency: usize,
    /// Migration status poll cadence
    pub poll_interval: Duration,
    /// Per-migration deadline; elapsing records *timed-out*
    pub migration_deadline: Duration,
}

impl Default for TierControllerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.80,
            concurrency: 5,
            poll_interval: Duration::from_secs(10),
            migration_deadline: Duration::from_secs(30 * 60),
        }
    }
}

impl TierControllerConfig {
    /// Queue capacity derived from the worker count
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.concurrency * 2
    }
}

/// The migration surface the workers drive
///
/// In production this is the metadata service; tests substitute stubs.
#[async_trait]
pub trait MigrationDriver: Send + Sync {
    /// Ask for a migration; returns a handle to poll
    async fn submit(&self, bucket: &str, key: &str, target: Tier) -> Result<String>;

    /// Current state of a previously submitted migration
    async fn status(&self, migration_id: &str) -> Result<MigrationStatusResponse>;
}

/// `MigrationDriver` over the metadata REST API
pub struct MetaMigrationDriver {
    meta: MetaClient,
}

impl MetaMigrationDriver {
    #[must_use]
    pub const fn new(meta: MetaClient) -> Self {
        Self { meta }
    }
}

#[async_trait]
impl MigrationDriver for MetaMigrationDriver {
    async fn submit(&self, bucket: &str, key: &str, target: Tier) -> Result<String> {
        self.meta.submit_migration(bucket, key, target).await
    }

    async fn status(&self, migration_id: &str) -> Result<MigrationStatusResponse> {
        self.meta.migration_status(migration_id).await
    }
}

/// The event-driven migration controller
pub struct TierController {
    config: TierControllerConfig,
    driver: Arc<dyn MigrationDriver>,
    counters: Arc<TierCounters>,
}

impl TierController {
    /// Create a controller over the given driver
    #[must_use]
    pub fn new(config: TierControllerConfig, driver: Arc<dyn MigrationDriver>) -> Self {
        Self {
            config,
            driver,
            counters: Arc::new(TierCounters::new()),
        }
    }

    /// Outcome counters (shared with the metrics endpoint)
    #[must_use]
    pub fn counters(&self) -> Arc<TierCounters> {
        Arc::clone(&self.counters)
    }

    /// Consume the stream until it ends or shutdown is signalled
    ///
    /// On shutdown the ingest loop stops taking events; workers drain
    /// whatever is queued and finish monitoring their current
    /// migration before exiting.
    pub async fn run(
        &self,
        mut stream: impl EventStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let capacity = self.config.queue_capacity();
        let (tx, rx) = mpsc::channel::<TieringRequest>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(self.config.concurrency);
        for worker_id in 0..self.config.concurrency {
            let rx = Arc::clone(&rx);
            let driver = Arc::clone(&self.driver);
            let counters = Arc::clone(&self.counters);
            let config = self.config.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let request = rx.lock().await.recv().await;
                    let Some(request) = request else { break };
                    counters
                        .queue_depth
                        .set(counters.queue_depth.get().saturating_sub(1));
                    run_migration(worker_id, &config, driver.as_ref(), &counters, request).await;
                }
                debug!(worker_id, "tier worker finished");
            }));
        }

        loop {
            let record = tokio::select! {
                record = stream.next() => record?,
                _ = shutdown.changed() => {
                    info!("shutdown signalled, tier ingest stopping");
                    break;
                }
            };
            let Some(record) = record else { break };

            self.counters.events.inc();

            match serde_json::from_str::<TieringRequest>(&record.payload) {
                Err(e) => {
                    warn!(offset = record.offset, error = %e, "unparseable tiering event");
                    self.counters.invalid.inc();
                }
                Ok(event) => {
                    if event.current_tier == event.recommended_tier {
                        self.counters.skipped.inc();
                    } else if event.confidence < self.config.confidence_threshold {
                        debug!(
                            bucket = %event.bucket_name,
                            key = %event.object_key,
                            confidence = event.confidence,
                            "below confidence threshold"
                        );
                        self.counters.skipped.inc();
                    } else {
                        match tx.try_send(event) {
                            Ok(()) => {
                                self.counters.queue_depth.add(1);
                            }
                            Err(mpsc::error::TrySendError::Full(event)) => {
                                // Lossy by design: the upstream log
                                // retains the event and a later
                                // recommendation re-expresses it.
                                warn!(
                                    bucket = %event.bucket_name,
                                    key = %event.object_key,
                                    "queue full, dropping tiering request"
                                );
                                self.counters.dropped.inc();
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }

            // At-least-once contract: the offset moves once the
            // enqueue-or-drop decision is made.
            stream.commit(record.offset).await?;
        }

        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }
}

/// Drive one migration to a terminal state
async fn run_migration(
    worker_id: usize,
    config: &TierControllerConfig,
    driver: &dyn MigrationDriver,
    counters: &TierCounters,
    request: TieringRequest,
) {
    let bucket = &request.bucket_name;
    let key = &request.object_key;
    let target = request.recommended_tier;

    let started = Instant::now();
    let migration_id = match driver.submit(bucket, key, target).await {
        Ok(id) => id,
        Err(e) => {
            warn!(worker_id, bucket, key, error = %e, "migration submit failed");
            counters.creation_failed.inc();
            return;
        }
    };
    info!(worker_id, bucket, key, %target, migration_id, "migration submitted");

    let deadline = started + config.migration_deadline;
    loop {
        if Instant::now() >= deadline {
            warn!(worker_id, migration_id, "migration deadline elapsed");
            counters.timed_out.inc();
            return;
        }
        tokio::time::sleep(config.poll_interval).await;

        match driver.status(&migration_id).await {
            Ok(status) => match status.state {
                MigrationState::Running => {}
                MigrationState::Succeeded => {
                    let elapsed = started.elapsed();
                    info!(worker_id, migration_id, ?elapsed, "migration succeeded");
                    counters.succeeded.inc();
                    counters.migration_duration.observe(elapsed.as_secs_f64());
                    return;
                }
                MigrationState::Failed => {
                    warn!(
                        worker_id,
                        migration_id,
                        error = status.error.as_deref().unwrap_or("unknown"),
                        "migration failed"
                    );
                    counters.failed.inc();
                    return;
                }
            },
            // Transient poll failures retry until the deadline.
            Err(e) => debug!(worker_id, migration_id, error = %e, "status poll failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryEventStream;
    use shardstore_common::Error;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Notify;

    fn event(current: Tier, recommended: Tier, confidence: f64) -> String {
        serde_json::to_string(&TieringRequest {
            timestamp: 1_700_000_000.0,
            bucket_name: "b1".into(),
            object_key: "x".into(),
            current_tier: current,
            recommended_tier: recommended,
            confidence,
            probability_hot: 0.5,
            model_version: "test-v1".into(),
        })
        .unwrap()
    }

    /// Driver whose migrations succeed immediately
    struct InstantDriver {
        submitted: AtomicU64,
    }

    #[async_trait]
    impl MigrationDriver for InstantDriver {
        async fn submit(&self, _bucket: &str, _key: &str, _target: Tier) -> Result<String> {
            let n = self.submitted.fetch_add(1, Ordering::SeqCst);
            Ok(format!("mig-{n}"))
        }

        async fn status(&self, migration_id: &str) -> Result<MigrationStatusResponse> {
            Ok(MigrationStatusResponse {
                migration_id: migration_id.into(),
                bucket: "b1".into(),
                key: "x".into(),
                target_tier: Tier::Hot,
                state: MigrationState::Succeeded,
                error: None,
                started_at: 0,
                finished_at: Some(1),
            })
        }
    }

    fn fast_config(concurrency: usize) -> TierControllerConfig {
        TierControllerConfig {
            confidence_threshold: 0.80,
            concurrency,
            poll_interval: Duration::from_millis(5),
            migration_deadline: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_decision_rules() {
        let driver = Arc::new(InstantDriver {
            submitted: AtomicU64::new(0),
        });
        let controller = TierController::new(fast_config(2), driver.clone());
        let counters = controller.counters();

        let (tx, stream) = MemoryEventStream::new();
        tx.send(event(Tier::Hot, Tier::Hot, 0.99)).unwrap(); // equal tiers
        tx.send(event(Tier::Cold, Tier::Hot, 0.5)).unwrap(); // low confidence
        tx.send(event(Tier::Cold, Tier::Hot, 0.9)).unwrap(); // accepted
        tx.send("not json".into()).unwrap(); // invalid
        drop(tx);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        controller.run(stream, shutdown_rx).await.unwrap();

        assert_eq!(counters.events.get(), 4);
        assert_eq!(counters.skipped.get(), 2);
        assert_eq!(counters.invalid.get(), 1);
        assert_eq!(counters.succeeded.get(), 1);
        assert_eq!(driver.submitted.load(Ordering::SeqCst), 1);
    }

    /// Driver that parks the first `submit` until released; later
    /// submits fail straight away.
    struct ParkedDriver {
        entered: Notify,
        release: Notify,
        parked_once: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl MigrationDriver for ParkedDriver {
        async fn submit(&self, _bucket: &str, _key: &str, _target: Tier) -> Result<String> {
            if !self.parked_once.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Err(Error::upstream("no migration"))
        }

        async fn status(&self, _id: &str) -> Result<MigrationStatusResponse> {
            unreachable!("submit never succeeds")
        }
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_without_blocking() {
        // One worker, so capacity = 2. The worker parks on the first
        // request; two more queue; everything beyond that is dropped.
        let driver = Arc::new(ParkedDriver {
            entered: Notify::new(),
            release: Notify::new(),
            parked_once: std::sync::atomic::AtomicBool::new(false),
        });
        let controller = TierController::new(fast_config(1), driver.clone());
        let counters = controller.counters();

        let (tx, stream) = MemoryEventStream::new();
        tx.send(event(Tier::Cold, Tier::Hot, 0.9)).unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn({
            let driver = driver.clone();
            async move {
                // Wait until the worker owns the first request before
                // flooding the queue.
                driver.entered.notified().await;
                for _ in 0..4 {
                    tx.send(event(Tier::Cold, Tier::Hot, 0.9)).unwrap();
                }
                drop(tx);
            }
        });

        let done = tokio::spawn(async move { controller.run(stream, shutdown_rx).await });

        run.await.unwrap();
        // Let the ingest loop drain the flood, then release the worker.
        tokio::time::sleep(Duration::from_millis(50)).await;
        driver.release.notify_one();
        done.await.unwrap().unwrap();

        assert_eq!(counters.events.get(), 5);
        assert_eq!(counters.dropped.get(), 2);
        assert_eq!(counters.creation_failed.get(), 3);
    }

    /// Driver whose migrations never finish
    struct StuckDriver;

    #[async_trait]
    impl MigrationDriver for StuckDriver {
        async fn submit(&self, _bucket: &str, _key: &str, _target: Tier) -> Result<String> {
            Ok("mig-stuck".into())
        }

        async fn status(&self, migration_id: &str) -> Result<MigrationStatusResponse> {
            Ok(MigrationStatusResponse {
                migration_id: migration_id.into(),
                bucket: "b1".into(),
                key: "x".into(),
                target_tier: Tier::Hot,
                state: MigrationState::Running,
                error: None,
                started_at: 0,
                finished_at: None,
            })
        }
    }

    #[tokio::test]
    async fn test_deadline_records_timed_out() {
        let config = TierControllerConfig {
            migration_deadline: Duration::from_millis(30),
            ..fast_config(1)
        };
        let controller = TierController::new(config, Arc::new(StuckDriver));
        let counters = controller.counters();

        let (tx, stream) = MemoryEventStream::new();
        tx.send(event(Tier::Cold, Tier::Hot, 0.95)).unwrap();
        drop(tx);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        controller.run(stream, shutdown_rx).await.unwrap();

        assert_eq!(counters.timed_out.get(), 1);
        assert_eq!(counters.succeeded.get(), 0);
    }

    #[tokio::test]
    async fn test_offset_committed_after_decision() {
        let controller = TierController::new(
            fast_config(1),
            Arc::new(InstantDriver {
                submitted: AtomicU64::new(0),
            }),
        );

        let (tx, stream) = MemoryEventStream::new();
        // Skipped events still move the committed offset.
        tx.send(event(Tier::Hot, Tier::Hot, 0.99)).unwrap();
        tx.send(event(Tier::Cold, Tier::Cold, 0.99)).unwrap();
        drop(tx);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        // MemoryEventStream is consumed by run(); committed offset is
        // checked through the counters instead: both events were
        // decided (skipped), so the stream must have been fully
        // consumed without blocking on any worker.
        let counters = controller.counters();
        controller.run(stream, shutdown_rx).await.unwrap();
        assert_eq!(counters.skipped.get(), 2);
    }
}
