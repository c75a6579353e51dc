//! Runner Metrics Store (C2).
//!
//! Per-`runnerName` rolling window of observations: latency percentiles
//! over the last N≈256 completed inferences, current load (in-flight /
//! capacity), and a health flag (false once the circuit breaker for that
//! runner has opened). Writers are the generation loop and the
//! orchestrator; the reader is the selection policy. Loss of a few samples
//! under contention is acceptable; counters are monotonic.
//!
//! Uses a concurrent map for the outer `runnerName -> RunnerStats`
//! table so readers and writers never block each other on unrelated
//! keys.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

const WINDOW_CAPACITY: usize = 256;

/// Fixed-capacity ring of recent latency samples (milliseconds).
struct LatencyRing {
    samples: Vec<u64>,
    next: usize,
    filled: usize,
}

impl LatencyRing {
    fn new() -> Self {
        Self { samples: vec![0; WINDOW_CAPACITY], next: 0, filled: 0 }
    }

    fn push(&mut self, latency_ms: u64) {
        self.samples[self.next] = latency_ms;
        self.next = (self.next + 1) % WINDOW_CAPACITY;
        self.filled = (self.filled + 1).min(WINDOW_CAPACITY);
    }

    /// Nearest-rank percentile over whatever samples are currently filled.
    fn percentile(&self, pct: f64) -> u64 {
        if self.filled == 0 {
            return 0;
        }
        let mut sorted: Vec<u64> = self.samples[..self.filled].to_vec();
        sorted.sort_unstable();
        let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(sorted.len() - 1);
        sorted[idx]
    }
}

pub struct RunnerStats {
    ring: Mutex<LatencyRing>,
    in_flight: AtomicI64,
    capacity: AtomicU64,
    healthy: std::sync::atomic::AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl RunnerStats {
    fn new(capacity: u64) -> Self {
        Self {
            ring: Mutex::new(LatencyRing::new()),
            in_flight: AtomicI64::new(0),
            capacity: AtomicU64::new(capacity.max(1)),
            healthy: std::sync::atomic::AtomicBool::new(true),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn p50(&self) -> u64 {
        self.ring.lock().percentile(50.0)
    }

    pub fn p95(&self) -> u64 {
        self.ring.lock().percentile(95.0)
    }

    pub fn p99(&self) -> u64 {
        self.ring.lock().percentile(99.0)
    }

    /// In-flight concurrent requests / per-runner capacity, in `[0, ~)`.
    pub fn load(&self) -> f64 {
        let capacity = self.capacity.load(Ordering::Relaxed).max(1) as f64;
        (self.in_flight.load(Ordering::Relaxed).max(0) as f64) / capacity
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

/// Thread-safe store, one [`RunnerStats`] per `runnerName`, created lazily
/// on first observation. Process-wide, explicit-init object per spec §9.
#[derive(Default)]
pub struct MetricsStore {
    runners: DashMap<String, RunnerStats>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self { runners: DashMap::new() }
    }

    fn entry(&self, runner_name: &str) -> dashmap::mapref::one::Ref<'_, String, RunnerStats> {
        self.runners.entry(runner_name.to_string()).or_insert_with(|| RunnerStats::new(1));
        self.runners.get(runner_name).expect("just inserted")
    }

    pub fn begin_request(&self, runner_name: &str) {
        self.entry(runner_name).in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_request(&self, runner_name: &str, latency_ms: u64, success: bool) {
        let stats = self.entry(runner_name);
        stats.in_flight.fetch_sub(1, Ordering::Relaxed);
        stats.ring.lock().push(latency_ms);
        if success {
            stats.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_capacity(&self, runner_name: &str, capacity: u64) {
        self.entry(runner_name).capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    pub fn set_healthy(&self, runner_name: &str, healthy: bool) {
        self.entry(runner_name).set_healthy(healthy);
    }

    pub fn snapshot(&self, runner_name: &str) -> RunnerMetricsSnapshot {
        let stats = self.entry(runner_name);
        RunnerMetricsSnapshot {
            runner_name: runner_name.to_string(),
            p50_ms: stats.p50(),
            p95_ms: stats.p95(),
            p99_ms: stats.p99(),
            load: stats.load(),
            healthy: stats.healthy(),
            completed: stats.completed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerMetricsSnapshot {
    pub runner_name: String,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub load: f64,
    pub healthy: bool,
    pub completed: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_runner_reports_zeroed_healthy_stats() {
        let store = MetricsStore::new();
        let snap = store.snapshot("ghost");
        assert_eq!(snap.p50_ms, 0);
        assert!(snap.healthy);
        assert_eq!(snap.load, 0.0);
    }

    #[test]
    fn load_reflects_in_flight_over_capacity() {
        let store = MetricsStore::new();
        store.set_capacity("r1", 4);
        store.begin_request("r1");
        store.begin_request("r1");
        assert_eq!(store.snapshot("r1").load, 0.5);
        store.end_request("r1", 10, true);
        assert_eq!(store.snapshot("r1").load, 0.25);
    }

    #[test]
    fn percentiles_over_known_samples() {
        let store = MetricsStore::new();
        for ms in 1..=100u64 {
            store.begin_request("r1");
            store.end_request("r1", ms, true);
        }
        let snap = store.snapshot("r1");
        assert_eq!(snap.p50_ms, 50);
        assert_eq!(snap.p99_ms, 99);
    }

    #[test]
    fn health_flag_round_trips() {
        let store = MetricsStore::new();
        store.set_healthy("r1", false);
        assert!(!store.snapshot("r1").healthy);
    }
}
