use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory histogram over a bounded window of recent observations.
struct Histogram {
    observations: Mutex<Vec<f64>>,
    capacity: usize,
}

impl Histogram {
    fn new(capacity: usize) -> Self {
        Self {
            observations: Mutex::new(Vec::new()),
            capacity,
        }
    }
    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == self.capacity {
            obs.remove(0);
        }
        obs.push(value);
    }
    fn summary(&self) -> HistogramSummary {
        let mut obs = self.observations.lock().clone();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = obs.len();
        let sum: f64 = obs.iter().sum();
        let p50 = obs[count / 2];
        let p95 = obs[((count as f64 * 0.95) as usize).min(count - 1)];
        let p99 = obs[((count as f64 * 0.99) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum,
            p50,
            p95,
            p99,
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Point-in-time copy of the turn counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub turns_started: u64,
    pub turns_completed: u64,
    pub turns_degraded: u64,
    pub turns_conflicted: u64,
    pub turns_cancelled: u64,
    pub turns_failed: u64,
    pub persistence_failures: u64,
    pub generation_latency_ms: HistogramSummary,
}

/// Process-wide turn counters, shared by the coordinator and the HTTP layer.
pub struct TurnMetrics {
    started: Counter,
    completed: Counter,
    degraded: Counter,
    conflicted: Counter,
    cancelled: Counter,
    failed: Counter,
    persistence_failures: Counter,
    generation_latency_ms: Histogram,
}

impl Default for TurnMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnMetrics {
    pub fn new() -> Self {
        Self {
            started: Counter::new(),
            completed: Counter::new(),
            degraded: Counter::new(),
            conflicted: Counter::new(),
            cancelled: Counter::new(),
            failed: Counter::new(),
            persistence_failures: Counter::new(),
            generation_latency_ms: Histogram::new(1024),
        }
    }

    pub fn turn_started(&self) {
        self.started.increment();
    }

    pub fn turn_completed(&self) {
        self.completed.increment();
    }

    pub fn turn_degraded(&self) {
        self.degraded.increment();
    }

    pub fn turn_conflicted(&self) {
        self.conflicted.increment();
    }

    pub fn turn_cancelled(&self) {
        self.cancelled.increment();
    }

    pub fn turn_failed(&self) {
        self.failed.increment();
    }

    pub fn persistence_failed(&self) {
        self.persistence_failures.increment();
    }

    pub fn observe_generation(&self, latency: Duration) {
        self.generation_latency_ms
            .observe(latency.as_secs_f64() * 1000.0);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            turns_started: self.started.get(),
            turns_completed: self.completed.get(),
            turns_degraded: self.degraded.get(),
            turns_conflicted: self.conflicted.get(),
            turns_cancelled: self.cancelled.get(),
            turns_failed: self.failed.get(),
            persistence_failures: self.persistence_failures.get(),
            generation_latency_ms: self.generation_latency_ms.summary(),
        }
    }
}
