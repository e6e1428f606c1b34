//! Modulo Hash Strategy
//!
//! `shard_ids_sorted[murmur3(tenant, seed) % shard_count]`
//!
//! Sorting the ids makes the index -> id mapping independent of registration
//! order, so every process with the same shard set agrees on placement.
//! Changing the shard count reassigns most tenants; this strategy makes no
//! attempt to minimize movement.

use parking_lot::{Mutex, RwLock};
use shard_core::StrategyConfig;
use shard_types::{ShardId, ShardInfo, ShardKeyResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::ShardingStrategy;
use crate::hash::murmur3_32;

/// Registered shards plus the derived sorted id list.
///
/// `sorted_ids` is rebuilt and swapped whole on every mutation, so readers
/// holding an old `Arc` keep a consistent view.
#[derive(Debug, Default)]
struct Topology {
    shards: HashMap<ShardId, ShardInfo>,
    sorted_ids: Arc<Vec<ShardId>>,
    generation: u64,
}

impl Topology {
    fn rebuild(&mut self) {
        let mut ids: Vec<ShardId> = self.shards.keys().cloned().collect();
        ids.sort();
        self.sorted_ids = Arc::new(ids);
        self.generation += 1;
    }
}

/// Per-tenant resolution cache tagged with the topology generation it was
/// built against; inserts from a stale generation are dropped.
#[derive(Debug, Default)]
struct ResolutionCache {
    generation: u64,
    entries: HashMap<String, ShardKeyResult>,
}

/// Modulo hash sharding strategy with per-tenant cache
#[derive(Debug)]
pub struct ModuloHashStrategy {
    config: StrategyConfig,
    topology: RwLock<Topology>,
    cache: Mutex<ResolutionCache>,
}

impl ModuloHashStrategy {
    /// Create with default configuration (seed 0, cache enabled)
    pub fn new() -> Self {
        Self::with_config(StrategyConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(config: StrategyConfig) -> Self {
        Self {
            config,
            topology: RwLock::new(Topology::default()),
            cache: Mutex::new(ResolutionCache::default()),
        }
    }

    /// Create and register an initial shard set
    pub fn with_shards(config: StrategyConfig, shards: impl IntoIterator<Item = ShardInfo>) -> Self {
        let strategy = Self::with_config(config);
        for shard in shards {
            strategy.add_shard(shard);
        }
        strategy
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Sorted shard ids used for index selection
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.topology.read().sorted_ids.to_vec()
    }

    /// Mutate the topology and invalidate the cache in one critical section
    fn mutate<R>(&self, f: impl FnOnce(&mut HashMap<ShardId, ShardInfo>) -> R) -> R {
        let mut topology = self.topology.write();
        let result = f(&mut topology.shards);
        topology.rebuild();

        let mut cache = self.cache.lock();
        cache.entries.clear();
        cache.generation = topology.generation;
        result
    }

    fn cache_lookup(&self, tenant_id: &str) -> Option<ShardKeyResult> {
        self.cache.lock().entries.get(tenant_id).cloned()
    }

    fn cache_insert(&self, tenant_id: &str, result: &ShardKeyResult, generation: u64) {
        let mut cache = self.cache.lock();
        if cache.generation != generation {
            return;
        }
        if cache.entries.len() >= self.config.max_cache_size {
            debug!(
                entries = cache.entries.len(),
                max = self.config.max_cache_size,
                "Shard resolution cache full, clearing"
            );
            cache.entries.clear();
        }
        cache.entries.insert(tenant_id.to_string(), result.clone());
    }
}

impl Default for ModuloHashStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardingStrategy for ModuloHashStrategy {
    fn get_shard_key(&self, tenant_id: &str) -> ShardKeyResult {
        if self.config.enable_cache {
            if let Some(hit) = self.cache_lookup(tenant_id) {
                trace!(tenant_id = %tenant_id, shard_id = %hit.shard_id, "Shard cache hit");
                return hit;
            }
        }

        let (sorted_ids, generation) = {
            let topology = self.topology.read();
            (Arc::clone(&topology.sorted_ids), topology.generation)
        };

        let shard_key = murmur3_32(tenant_id.as_bytes(), self.config.hash_seed);

        if sorted_ids.is_empty() {
            return ShardKeyResult {
                shard_key,
                total_shards: 1,
                shard_id: self.config.default_shard_id.clone(),
            };
        }

        let index = shard_key as usize % sorted_ids.len();
        let result = ShardKeyResult {
            shard_key,
            total_shards: sorted_ids.len(),
            shard_id: sorted_ids[index].clone(),
        };

        trace!(
            tenant_id = %tenant_id,
            shard_key = shard_key,
            shard_id = %result.shard_id,
            "Resolved tenant shard"
        );

        if self.config.enable_cache {
            self.cache_insert(tenant_id, &result, generation);
        }

        result
    }

    fn add_shard(&self, info: ShardInfo) {
        let shard_id = info.shard_id.clone();
        let total = self.mutate(|shards| {
            shards.insert(shard_id.clone(), info);
            shards.len()
        });
        info!(shard_id = %shard_id, total_shards = total, "Shard registered with strategy");
    }

    fn remove_shard(&self, shard_id: &str) -> bool {
        // Check first so a miss leaves the cache intact
        if !self.topology.read().shards.contains_key(shard_id) {
            return false;
        }
        let removed = self.mutate(|shards| shards.remove(shard_id).is_some());
        if removed {
            info!(shard_id = %shard_id, "Shard removed from strategy");
        }
        removed
    }

    fn get_shard_info(&self, shard_id: &str) -> Option<ShardInfo> {
        self.topology.read().shards.get(shard_id).cloned()
    }

    fn get_all_shards(&self) -> Vec<ShardInfo> {
        let topology = self.topology.read();
        topology
            .sorted_ids
            .iter()
            .filter_map(|id| topology.shards.get(id).cloned())
            .collect()
    }

    fn can_handle(&self, tenant_id: &str) -> bool {
        !tenant_id.is_empty() && !self.topology.read().sorted_ids.is_empty()
    }

    fn shard_count(&self) -> usize {
        self.topology.read().sorted_ids.len()
    }

    fn cache_size(&self) -> usize {
        self.cache.lock().entries.len()
    }

    fn clear_cache(&self) {
        self.cache.lock().entries.clear();
    }

    fn name(&self) -> &'static str {
        "ModuloHash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_shards(count: usize) -> Vec<ShardInfo> {
        (0..count)
            .map(|i| ShardInfo::new(format!("shard-{}", i), format!("memory://shard-{}", i)))
            .collect()
    }

    #[test]
    fn test_deterministic() {
        let strategy = ModuloHashStrategy::with_shards(StrategyConfig::default(), create_test_shards(4));

        let result1 = strategy.get_shard_key("tenant-alpha");
        strategy.clear_cache();
        let result2 = strategy.get_shard_key("tenant-alpha");

        assert_eq!(result1, result2, "Same tenant should resolve to same shard");
        assert_eq!(result1.total_shards, 4);
        assert_eq!(result1.shard_key, murmur3_32(b"tenant-alpha", 0));
    }

    #[test]
    fn test_registration_order_irrelevant() {
        let mut reversed = create_test_shards(5);
        reversed.reverse();

        let forward = ModuloHashStrategy::with_shards(StrategyConfig::default(), create_test_shards(5));
        let backward = ModuloHashStrategy::with_shards(StrategyConfig::default(), reversed);

        assert_eq!(forward.shard_ids(), backward.shard_ids());
        for i in 0..200 {
            let tenant = format!("tenant-{}", i);
            assert_eq!(
                forward.get_shard_key(&tenant).shard_id,
                backward.get_shard_key(&tenant).shard_id
            );
        }
    }

    #[test]
    fn test_index_selects_sorted_id() {
        let strategy = ModuloHashStrategy::with_shards(
            StrategyConfig::default(),
            vec![
                ShardInfo::new("zeta", "memory://zeta"),
                ShardInfo::new("alpha", "memory://alpha"),
                ShardInfo::new("mid", "memory://mid"),
            ],
        );
        assert_eq!(strategy.shard_ids(), vec!["alpha", "mid", "zeta"]);

        let result = strategy.get_shard_key("tenant-42");
        let expected = ["alpha", "mid", "zeta"][murmur3_32(b"tenant-42", 0) as usize % 3];
        assert_eq!(result.shard_id, expected);
    }

    #[test]
    fn test_no_shards_falls_back_to_default() {
        let strategy = ModuloHashStrategy::default();

        assert!(!strategy.can_handle("tenant-alpha"));
        let result = strategy.get_shard_key("tenant-alpha");
        assert_eq!(result.total_shards, 1);
        assert_eq!(result.shard_id, "default");
        // Degraded results are not cached
        assert_eq!(strategy.cache_size(), 0);
    }

    #[test]
    fn test_can_handle() {
        let strategy = ModuloHashStrategy::with_shards(StrategyConfig::default(), create_test_shards(1));
        assert!(strategy.can_handle("tenant-alpha"));
        assert!(!strategy.can_handle(""));
    }

    #[test]
    fn test_cache_cleared_on_topology_change() {
        let strategy = ModuloHashStrategy::with_shards(StrategyConfig::default(), create_test_shards(2));

        for i in 0..10 {
            strategy.get_shard_key(&format!("tenant-{}", i));
        }
        assert_eq!(strategy.cache_size(), 10);

        strategy.add_shard(ShardInfo::new("shard-2", "memory://shard-2"));
        assert_eq!(strategy.cache_size(), 0);

        strategy.get_shard_key("tenant-0");
        assert_eq!(strategy.cache_size(), 1);

        assert!(strategy.remove_shard("shard-2"));
        assert_eq!(strategy.cache_size(), 0);
    }

    #[test]
    fn test_remove_missing_shard() {
        let strategy = ModuloHashStrategy::with_shards(StrategyConfig::default(), create_test_shards(2));
        strategy.get_shard_key("tenant-0");

        assert!(!strategy.remove_shard("shard-9"));
        assert_eq!(strategy.shard_count(), 2);
        // A miss does not invalidate anything
        assert_eq!(strategy.cache_size(), 1);
    }

    #[test]
    fn test_cache_hard_eviction() {
        let config = StrategyConfig {
            max_cache_size: 5,
            ..StrategyConfig::default()
        };
        let strategy = ModuloHashStrategy::with_shards(config, create_test_shards(2));

        for i in 0..5 {
            strategy.get_shard_key(&format!("tenant-{}", i));
        }
        assert_eq!(strategy.cache_size(), 5);

        // Sixth entry clears everything before inserting
        strategy.get_shard_key("tenant-5");
        assert_eq!(strategy.cache_size(), 1);
    }

    #[test]
    fn test_cache_disabled() {
        let config = StrategyConfig {
            enable_cache: false,
            ..StrategyConfig::default()
        };
        let strategy = ModuloHashStrategy::with_shards(config, create_test_shards(2));
        strategy.get_shard_key("tenant-0");
        assert_eq!(strategy.cache_size(), 0);
    }

    #[test]
    fn test_seed_is_applied() {
        let config = StrategyConfig {
            hash_seed: 7,
            ..StrategyConfig::default()
        };
        let strategy = ModuloHashStrategy::with_shards(config, create_test_shards(3));
        assert_eq!(
            strategy.get_shard_key("tenant-alpha").shard_key,
            murmur3_32(b"tenant-alpha", 7)
        );
    }

    #[test]
    fn test_get_all_shards_sorted() {
        let strategy = ModuloHashStrategy::with_shards(
            StrategyConfig::default(),
            vec![
                ShardInfo::new("shard-b", "memory://b"),
                ShardInfo::new("shard-a", "memory://a").with_region("us-east-1"),
            ],
        );

        let all = strategy.get_all_shards();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].shard_id, "shard-a");
        assert_eq!(
            strategy.get_shard_info("shard-a").and_then(|s| s.region),
            Some("us-east-1".to_string())
        );
        assert!(strategy.get_shard_info("shard-z").is_none());
    }
}
