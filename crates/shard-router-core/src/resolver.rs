//! Resolution seam between the pool manager and its consumers

use shard_types::ShardKeyResult;

use crate::error::RouterError;

/// Something that can bind a tenant to a shard.
///
/// Implemented by the sharded pool manager; consumed by the tenant context
/// (eager resolution on scope entry) and the message interceptor.
pub trait ShardResolver: Send + Sync {
    /// Resolve a tenant, failing when it cannot be routed
    fn resolve_shard(&self, tenant_id: &str) -> Result<ShardKeyResult, RouterError>;

    /// Number of shards currently reporting healthy
    fn healthy_shard_count(&self) -> usize;
}
