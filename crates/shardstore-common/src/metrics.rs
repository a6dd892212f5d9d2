//! Metric primitives
//!
//! Plain atomics rendered into Prometheus text exposition by each
//! daemon's `/metrics` handler. No registry crate; a daemon owns a
//! struct of these and walks its fields when asked.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment by one
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-write-wins gauge
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    /// Set the gauge
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    /// Increment by `n`
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket duration histogram (seconds)
///
/// Bucket boundaries are chosen at construction; observations are
/// recorded as microsecond sums so rendering can emit `_sum` without
/// floating-point accumulation.
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

/// Default latency buckets: 5ms .. 60s
pub const LATENCY_BUCKETS: &[f64] = &[0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0];

/// Coarser buckets for long-running work such as migrations: 1s .. 30min
pub const DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 1800.0];

impl Histogram {
    /// Create a histogram with the given bucket upper bounds
    #[must_use]
    pub fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    /// Record one observation, in seconds
    pub fn observe(&self, seconds: f64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if seconds <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    /// Number of observations
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Render as Prometheus histogram series
    pub fn render(&self, out: &mut String, name: &str, help: &str) {
        writeln!(out, "# HELP {name} {help}").unwrap();
        writeln!(out, "# TYPE {name} histogram").unwrap();
        for (i, bound) in self.bounds.iter().enumerate() {
            writeln!(
                out,
                "{name}_bucket{{le=\"{bound}\"}} {}",
                self.buckets[i].load(Ordering::Relaxed)
            )
            .unwrap();
        }
        let count = self.count.load(Ordering::Relaxed);
        writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}").unwrap();
        writeln!(
            out,
            "{name}_sum {}",
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        )
        .unwrap();
        writeln!(out, "{name}_count {count}").unwrap();
    }
}

/// Render a counter as Prometheus text
pub fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    writeln!(out, "# HELP {name} {help}").unwrap();
    writeln!(out, "# TYPE {name} counter").unwrap();
    writeln!(out, "{name} {value}").unwrap();
}

/// Render a gauge as Prometheus text
pub fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    writeln!(out, "# HELP {name} {help}").unwrap();
    writeln!(out, "# TYPE {name} gauge").unwrap();
    writeln!(out, "{name} {value}").unwrap();
}

/// Render a labelled counter series; `series` is `(label_value, value)`
/// pairs under a single label key.
pub fn render_labelled_counter(
    out: &mut String,
    name: &str,
    help: &str,
    label: &str,
    series: &[(&str, u64)],
) {
    writeln!(out, "# HELP {name} {help}").unwrap();
    writeln!(out, "# TYPE {name} counter").unwrap();
    for (value_label, value) in series {
        writeln!(out, "{name}{{{label}=\"{value_label}\"}} {value}").unwrap();
    }
}

/// Content type for Prometheus text exposition
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let c = Counter::default();
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);

        let g = Gauge::default();
        g.set(42);
        assert_eq!(g.get(), 42);
    }

    #[test]
    fn test_histogram_buckets() {
        let h = Histogram::new(LATENCY_BUCKETS);
        h.observe(0.003);
        h.observe(0.2);
        h.observe(120.0); // beyond the last bound, lands only in +Inf
        assert_eq!(h.count(), 3);

        let mut out = String::new();
        h.render(&mut out, "test_seconds", "test");
        assert!(out.contains("test_seconds_bucket{le=\"0.005\"} 1"));
        assert!(out.contains("test_seconds_bucket{le=\"60\"} 2"));
        assert!(out.contains("test_seconds_bucket{le=\"+Inf\"} 3"));
        assert!(out.contains("test_seconds_count 3"));
    }

    #[test]
    fn test_render_labelled() {
        let mut out = String::new();
        render_labelled_counter(
            &mut out,
            "events_total",
            "events",
            "outcome",
            &[("succeeded", 2), ("failed", 1)],
        );
        assert!(out.contains("events_total{outcome=\"succeeded\"} 2"));
        assert!(out.contains("events_total{outcome=\"failed\"} 1"));
    }
}
