//! Shard identity, resolution results and health snapshots

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Shard identifier (unique across the registry)
pub type ShardId = String;

/// Identity and connection parameters for one shard.
///
/// Immutable once registered; replace a shard by removing and re-adding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Unique shard identifier
    pub shard_id: ShardId,

    /// Connection URL handed to the pool factory
    pub connection_url: String,

    /// Optional relative weight (informational)
    #[serde(default)]
    pub weight: Option<u32>,

    /// Whether the shard only serves reads
    #[serde(default)]
    pub read_only: bool,

    /// Optional region hint
    #[serde(default)]
    pub region: Option<String>,
}

impl ShardInfo {
    /// Create a writable shard with no region or weight
    pub fn new(shard_id: impl Into<ShardId>, connection_url: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            connection_url: connection_url.into(),
            weight: None,
            read_only: false,
            region: None,
        }
    }

    /// Set region hint
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Mark as read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Outcome of resolving a tenant to a shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKeyResult {
    /// Hash of the tenant identifier
    pub shard_key: u32,

    /// Number of registered shards at resolution time (1 when none are registered)
    pub total_shards: usize,

    /// Selected shard
    pub shard_id: ShardId,
}

/// Health of a shard's connection pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardHealth {
    /// Last probe succeeded
    Healthy,
    /// Last probe failed or the pool reported an error
    Unhealthy,
    /// Pool created, first probe not finished yet
    Initializing,
}

impl Default for ShardHealth {
    fn default() -> Self {
        Self::Initializing
    }
}

impl std::fmt::Display for ShardHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardHealth::Healthy => write!(f, "healthy"),
            ShardHealth::Unhealthy => write!(f, "unhealthy"),
            ShardHealth::Initializing => write!(f, "initializing"),
        }
    }
}

/// Read-only operational snapshot of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    pub shard_id: ShardId,
    pub status: ShardHealth,

    /// Connections held by the pool (idle + in use)
    pub total_connections: usize,

    /// Connections sitting idle in the pool
    pub idle_connections: usize,

    /// Callers waiting for a connection
    pub waiting_requests: usize,

    pub last_health_check: Option<SystemTime>,

    /// Last error observed on this shard, cleared on recovery
    pub error: Option<String>,
}

impl ShardStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == ShardHealth::Healthy
    }
}
