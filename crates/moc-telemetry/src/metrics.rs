//! Lock-free-ish primitive metric types.
//!
//! Mirrors the atomic `Counter`/`Gauge` pattern used by the monitoring
//! dashboard's metrics collector, extended with a small fixed-bucket
//! histogram. Every update is an atomic fetch-add/store and therefore
//! bounded well under the microsecond budget §4.1 requires of Telemetry.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that can move up or down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket cumulative histogram (Prometheus `le` bucket semantics).
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    state: Mutex<HistogramState>,
}

#[derive(Debug, Default)]
struct HistogramState {
    count: u64,
    sum: f64,
    bucket_counts: Vec<u64>,
}

/// Default bucket bounds, seconds. Shared by load/unload/inference/job/goal
/// duration histograms; fine enough resolution from 10ms to 5 minutes.
pub const DEFAULT_BOUNDS_SEC: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

impl Histogram {
    pub fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            state: Mutex::new(HistogramState {
                count: 0,
                sum: 0.0,
                bucket_counts: vec![0; bounds.len()],
            }),
        }
    }

    pub fn observe(&self, value: f64) {
        if !value.is_finite() || value < 0.0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.count += 1;
        state.sum += value;
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                state.bucket_counts[i] += 1;
            }
        }
    }

    /// Snapshot as `(upper_bound, cumulative_count)` pairs, plus `+Inf`.
    pub fn snapshot(&self) -> (u64, f64, Vec<(f64, u64)>) {
        let state = self.state.lock().unwrap();
        let mut buckets: Vec<(f64, u64)> = self
            .bounds
            .iter()
            .copied()
            .zip(state.bucket_counts.iter().copied())
            .collect();
        buckets.push((f64::INFINITY, state.count));
        (state.count, state.sum, buckets)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new(DEFAULT_BOUNDS_SEC)
    }
}
