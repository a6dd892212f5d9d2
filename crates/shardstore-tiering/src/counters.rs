//! Tier controller outcome accounting

use shardstore_common::metrics::{
    render_gauge, render_labelled_counter, Counter, Gauge, Histogram, DURATION_BUCKETS,
};

/// Counters for every terminal state of the request state machine
#[derive(Debug)]
pub struct TierCounters {
    /// Records seen on the stream
    pub events: Counter,
    /// Dropped by the decision rules (equal tiers / low confidence)
    pub skipped: Counter,
    /// Dropped because the queue was full
    pub dropped: Counter,
    /// Unparseable records
    pub invalid: Counter,
    /// Migration submit refused by the metadata service
    pub creation_failed: Counter,
    pub succeeded: Counter,
    pub failed: Counter,
    pub timed_out: Counter,
    /// Requests currently sitting in the queue
    pub queue_depth: Gauge,
    /// End-to-end duration of successful migrations
    pub migration_duration: Histogram,
}

impl TierCounters {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Counter::default(),
            skipped: Counter::default(),
            dropped: Counter::default(),
            invalid: Counter::default(),
            creation_failed: Counter::default(),
            succeeded: Counter::default(),
            failed: Counter::default(),
            timed_out: Counter::default(),
            queue_depth: Gauge::default(),
            migration_duration: Histogram::new(DURATION_BUCKETS),
        }
    }

    /// Render as Prometheus text
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2 * 1024);
        render_labelled_counter(
            &mut out,
            "shardstore_tier_events_total",
            "Tiering events by outcome",
            "outcome",
            &[
                ("received", self.events.get()),
                ("skipped", self.skipped.get()),
                ("dropped", self.dropped.get()),
                ("invalid", self.invalid.get()),
                ("creation_failed", self.creation_failed.get()),
                ("succeeded", self.succeeded.get()),
                ("failed", self.failed.get()),
                ("timed_out", self.timed_out.get()),
            ],
        );
        render_gauge(
            &mut out,
            "shardstore_tier_queue_depth",
            "Requests waiting for a worker",
            self.queue_depth.get(),
        );
        self.migration_duration.render(
            &mut out,
            "shardstore_tier_migration_duration_seconds",
            "Duration of successful migrations",
        );
        out
    }
}

impl Default for TierCounters {
    fn default() -> Self {
        Self::new()
    }
}
