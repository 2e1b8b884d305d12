//! In-process counters and latency statistics.
//!
//! One registry per process, shared by every node the process hosts.
//! Experiment drivers reset it between runs and snapshot it afterwards.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

#[derive(Debug, Clone, Default)]
struct LatencyStats {
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

/// Aggregated view of one latency series.
#[derive(Debug, Clone)]
pub struct LatencySummary {
    pub count: u64,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    pub throughput_per_sec: f64,
}

/// Everything the registry has seen since the last reset.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub latencies: HashMap<String, LatencySummary>,
    pub elapsed: Duration,
}

struct Inner {
    counters: HashMap<String, u64>,
    latencies: HashMap<String, LatencyStats>,
    started: Instant,
}

pub struct MetricsRegistry {
    inner: Mutex<Inner>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                counters: HashMap::new(),
                latencies: HashMap::new(),
                started: Instant::now(),
            }),
        }
    }

    pub fn increment(&self, name: &str, value: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub fn record_latency(&self, name: &str, elapsed: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let stats = inner.latencies.entry(name.to_string()).or_default();
        if stats.count == 0 {
            stats.min = elapsed;
            stats.max = elapsed;
        } else {
            stats.min = stats.min.min(elapsed);
            stats.max = stats.max.max(elapsed);
        }
        stats.count += 1;
        stats.total += elapsed;
    }

    /// Current value of a counter (0 when never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Forgets everything recorded so far, atomically.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.counters.clear();
        inner.latencies.clear();
        inner.started = Instant::now();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap();
        let elapsed = inner.started.elapsed().max(Duration::from_nanos(1));

        let latencies = inner
            .latencies
            .iter()
            .map(|(name, stats)| {
                (
                    name.clone(),
                    LatencySummary {
                        count: stats.count,
                        mean: stats.total / stats.count.max(1) as u32,
                        min: stats.min,
                        max: stats.max,
                        throughput_per_sec: stats.count as f64 / elapsed.as_secs_f64(),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            counters: inner.counters.clone(),
            latencies,
            elapsed,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: Lazy<MetricsRegistry> = Lazy::new(MetricsRegistry::new);

/// The process-wide registry.
pub fn registry() -> &'static MetricsRegistry {
    &REGISTRY
}

#[cfg(test)]
mod metrics_test {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.counter("dht.get.local_hits"), 0);
        registry.increment("dht.get.local_hits", 1);
        registry.increment("dht.get.local_hits", 2);
        assert_eq!(registry.counter("dht.get.local_hits"), 3);
    }

    #[test]
    fn latency_summary_tracks_count_mean_and_extremes() {
        let registry = MetricsRegistry::new();
        registry.record_latency("dht.rpc.get", Duration::from_millis(10));
        registry.record_latency("dht.rpc.get", Duration::from_millis(30));

        let snapshot = registry.snapshot();
        let summary = &snapshot.latencies["dht.rpc.get"];
        assert_eq!(summary.count, 2);
        assert_eq!(summary.mean, Duration::from_millis(20));
        assert_eq!(summary.min, Duration::from_millis(10));
        assert_eq!(summary.max, Duration::from_millis(30));
        assert!(summary.throughput_per_sec > 0.0);
    }

    #[test]
    fn reset_clears_all_series() {
        let registry = MetricsRegistry::new();
        registry.increment("dht.get.miss", 5);
        registry.record_latency("dht.rpc.set", Duration::from_millis(1));
        registry.reset();

        let snapshot = registry.snapshot();
        assert!(snapshot.counters.is_empty());
        assert!(snapshot.latencies.is_empty());
    }
}
