//! Interceptor counters

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shard_core::{HistogramSnapshot, LatencyHistogram};
use shard_types::ShardId;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct InterceptorMetrics {
    routed: Mutex<HashMap<ShardId, u64>>,
    errors: Mutex<HashMap<ShardId, u64>>,
    missing_tenant: AtomicU64,
    excluded: AtomicU64,
    routing_latency: LatencyHistogram,
}

impl InterceptorMetrics {
    pub fn record_routed(&self, shard_id: &str, elapsed: Duration) {
        *self.routed.lock().entry(shard_id.to_string()).or_insert(0) += 1;
        self.routing_latency.record(elapsed);
    }

    pub fn record_error(&self, shard_id: &str) {
        *self.errors.lock().entry(shard_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_missing_tenant(&self) {
        self.missing_tenant.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_excluded(&self) {
        self.excluded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InterceptorMetricsSnapshot {
        InterceptorMetricsSnapshot {
            routed_by_shard: self.routed.lock().iter().map(|(k, v)| (k.clone(), *v)).collect(),
            errors_by_shard: self.errors.lock().iter().map(|(k, v)| (k.clone(), *v)).collect(),
            missing_tenant: self.missing_tenant.load(Ordering::Relaxed),
            excluded: self.excluded.load(Ordering::Relaxed),
            routing_latency: self.routing_latency.snapshot(),
        }
    }
}

/// Interceptor counters at a point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterceptorMetricsSnapshot {
    /// Messages handled successfully inside a tenant scope, by shard
    pub routed_by_shard: BTreeMap<ShardId, u64>,
    /// Handler failures inside a tenant scope, by shard
    pub errors_by_shard: BTreeMap<ShardId, u64>,
    /// Messages that arrived without a tenant header
    pub missing_tenant: u64,
    /// Messages on excluded topics
    pub excluded: u64,
    pub routing_latency: HistogramSnapshot,
}

impl InterceptorMetricsSnapshot {
    pub fn total_routed(&self) -> u64 {
        self.routed_by_shard.values().sum()
    }
}
