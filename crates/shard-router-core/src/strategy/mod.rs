//! Sharding Strategies
//!
//! A strategy owns the tenant -> shard mapping metadata only: the registered
//! [`ShardInfo`] set and any resolution cache. Connection lifecycle belongs
//! to the pool manager, so strategies can be exercised without real pools.
//!
//! - `ModuloHashStrategy`: `murmur3(tenant) % shard_count` over sorted ids

mod modulo_hash;

pub use modulo_hash::ModuloHashStrategy;

use shard_types::{ShardInfo, ShardKeyResult};

/// Trait for tenant -> shard mapping strategies
pub trait ShardingStrategy: Send + Sync {
    /// Resolve a tenant.
    ///
    /// Never fails: with zero shards the result degrades to the configured
    /// default shard id, so check [`can_handle`](Self::can_handle) first.
    fn get_shard_key(&self, tenant_id: &str) -> ShardKeyResult;

    /// Register (or replace) a shard; invalidates every cached resolution
    fn add_shard(&self, info: ShardInfo);

    /// Unregister a shard; `false` when it was not registered
    fn remove_shard(&self, shard_id: &str) -> bool;

    fn get_shard_info(&self, shard_id: &str) -> Option<ShardInfo>;

    /// All registered shards, ordered by shard id
    fn get_all_shards(&self) -> Vec<ShardInfo>;

    /// True iff at least one shard is registered and the tenant id is non-empty
    fn can_handle(&self, tenant_id: &str) -> bool;

    fn shard_count(&self) -> usize;

    /// Number of cached resolutions
    fn cache_size(&self) -> usize;

    fn clear_cache(&self);

    /// Strategy name for logging
    fn name(&self) -> &'static str;
}
