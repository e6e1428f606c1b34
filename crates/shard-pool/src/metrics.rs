//! Per-shard counters and manager-level snapshots

use serde::{Deserialize, Serialize};
use shard_core::{HistogramSnapshot, LatencyHistogram};
use shard_types::ShardId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Running counters for one shard
#[derive(Debug, Default)]
pub(crate) struct ShardCounters {
    pub query_count: AtomicU64,
    pub error_count: AtomicU64,
    pub slow_query_count: AtomicU64,
    pub unhealthy_route_count: AtomicU64,
    pub latency: LatencyHistogram,
}

impl ShardCounters {
    pub fn record_query(&self, elapsed: Duration) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.latency.record(elapsed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_query(&self) {
        self.slow_query_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unhealthy_route(&self) {
        self.unhealthy_route_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, shard_id: &str) -> ShardMetricsSnapshot {
        ShardMetricsSnapshot {
            shard_id: shard_id.to_string(),
            query_count: self.query_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            slow_query_count: self.slow_query_count.load(Ordering::Relaxed),
            unhealthy_route_count: self.unhealthy_route_count.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

/// Counters for one shard at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardMetricsSnapshot {
    pub shard_id: ShardId,
    pub query_count: u64,
    pub error_count: u64,
    pub slow_query_count: u64,
    /// Queries routed while the shard was unhealthy
    pub unhealthy_route_count: u64,
    pub latency: HistogramSnapshot,
}

/// Shard gauges plus per-shard counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerMetricsSnapshot {
    pub total_shards: usize,
    pub healthy_shards: usize,
    pub unhealthy_shards: usize,
    pub initializing_shards: usize,
    /// Ordered by shard id
    pub shards: Vec<ShardMetricsSnapshot>,
}

impl ManagerMetricsSnapshot {
    pub fn shard(&self, shard_id: &str) -> Option<&ShardMetricsSnapshot> {
        self.shards.iter().find(|s| s.shard_id == shard_id)
    }
}
