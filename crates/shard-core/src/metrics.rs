//! Fixed-bucket latency histogram
//!
//! Lock-free recording; snapshots are plain serializable values.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bucket bounds in milliseconds; the last bucket is open-ended
pub const LATENCY_BUCKETS_MS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000];

/// Latency histogram with atomic counters
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
            max_micros: AtomicU64::new(0),
        }
    }

    /// Record one observation
    pub fn record(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let millis = micros / 1_000;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| millis < *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum_micros = self.sum_micros.load(Ordering::Relaxed);
        HistogramSnapshot {
            count,
            sum_ms: sum_micros as f64 / 1_000.0,
            max_ms: self.max_micros.load(Ordering::Relaxed) as f64 / 1_000.0,
            mean_ms: if count == 0 {
                0.0
            } else {
                sum_micros as f64 / 1_000.0 / count as f64
            },
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

/// Point-in-time view of a [`LatencyHistogram`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    /// Per-bucket counts aligned with [`LATENCY_BUCKETS_MS`], plus overflow
    pub buckets: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_buckets() {
        let histogram = LatencyHistogram::new();
        histogram.record(Duration::from_micros(300)); // < 1ms
        histogram.record(Duration::from_millis(7)); // < 10ms
        histogram.record(Duration::from_secs(10)); // overflow

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.buckets[0], 1);
        assert_eq!(snapshot.buckets[2], 1);
        assert_eq!(snapshot.buckets[LATENCY_BUCKETS_MS.len()], 1);
        assert_eq!(snapshot.max_ms, 10_000.0);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = LatencyHistogram::default().snapshot();
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.mean_ms, 0.0);
        assert_eq!(snapshot.buckets.len(), LATENCY_BUCKETS_MS.len() + 1);
    }
}
