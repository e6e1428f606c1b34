//! Distribution and topology tests for the router core

use crate::{ModuloHashStrategy, ShardingStrategy};
use shard_core::StrategyConfig;
use shard_types::ShardInfo;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

fn create_strategy(count: usize) -> ModuloHashStrategy {
    ModuloHashStrategy::with_shards(
        StrategyConfig::default(),
        (0..count).map(|i| ShardInfo::new(format!("shard-{}", i), format!("memory://shard-{}", i))),
    )
}

fn distribution(strategy: &ModuloHashStrategy, tenants: &[String]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for tenant in tenants {
        *counts.entry(strategy.get_shard_key(tenant).shard_id).or_insert(0) += 1;
    }
    counts
}

#[test]
fn test_uniform_distribution_four_shards() {
    let strategy = create_strategy(4);
    let tenants: Vec<String> = (0..10_000)
        .map(|_| uuid::Uuid::new_v4().to_string())
        .collect();

    let counts = distribution(&strategy, &tenants);

    // Every shard is reachable
    assert_eq!(counts.len(), 4);

    let expected = 10_000.0 / 4.0;
    for (shard, count) in &counts {
        let ratio = *count as f64 / expected;
        assert!(
            (0.85..=1.15).contains(&ratio),
            "{} received {} tenants ({:.2}x expected)",
            shard,
            count,
            ratio
        );
    }
}

#[test]
fn test_small_sample_two_shards() {
    let strategy = create_strategy(2);
    let tenants: Vec<String> = (0..100).map(|i| format!("tenant-{}", i)).collect();

    let counts = distribution(&strategy, &tenants);
    for shard in ["shard-0", "shard-1"] {
        let count = counts.get(shard).copied().unwrap_or(0);
        assert!((30..=70).contains(&count), "{} received {} of 100 tenants", shard, count);
    }
}

#[test]
fn test_adding_shard_moves_most_tenants() {
    // Plain modulo placement: growing 4 -> 5 shards keeps a tenant in place
    // only when hash % 4 == hash % 5, roughly one time in five.
    let strategy = create_strategy(4);
    let tenants: Vec<String> = (0..1_000).map(|i| format!("tenant-{}", i)).collect();

    let before: Vec<String> = tenants
        .iter()
        .map(|t| strategy.get_shard_key(t).shard_id)
        .collect();

    strategy.add_shard(ShardInfo::new("shard-4", "memory://shard-4"));
    assert_eq!(strategy.cache_size(), 0);

    let moved = tenants
        .iter()
        .zip(&before)
        .filter(|(t, old)| strategy.get_shard_key(t).shard_id != **old)
        .count();

    assert!(moved > 500, "only {} of 1000 tenants moved", moved);
}

#[test]
fn test_removing_shard_reassigns_cached_tenants() {
    let strategy = create_strategy(3);
    let tenants: Vec<String> = (0..300).map(|i| format!("tenant-{}", i)).collect();

    for tenant in &tenants {
        strategy.get_shard_key(tenant);
    }

    assert!(strategy.remove_shard("shard-1"));
    assert_eq!(strategy.cache_size(), 0);

    for tenant in &tenants {
        let result = strategy.get_shard_key(tenant);
        assert_ne!(result.shard_id, "shard-1");
        assert_eq!(result.total_shards, 2);
    }
}

#[test]
fn test_readers_never_observe_partial_topology() {
    let strategy = create_strategy(3);
    let small: HashSet<String> = (0..3).map(|i| format!("shard-{}", i)).collect();
    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for reader in 0..4 {
            let strategy = &strategy;
            let small = &small;
            let stop = &stop;
            scope.spawn(move || {
                let mut i = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let tenant = format!("tenant-{}-{}", reader, i % 500);
                    let result = strategy.get_shard_key(&tenant);
                    match result.total_shards {
                        3 => assert!(small.contains(&result.shard_id), "{:?}", result),
                        4 => assert!(
                            small.contains(&result.shard_id) || result.shard_id == "shard-3",
                            "{:?}",
                            result
                        ),
                        other => panic!("unexpected shard count {}", other),
                    }
                    i += 1;
                }
            });
        }

        for _ in 0..200 {
            strategy.add_shard(ShardInfo::new("shard-3", "memory://shard-3"));
            strategy.remove_shard("shard-3");
        }
        stop.store(true, Ordering::Relaxed);
    });

    assert_eq!(strategy.shard_count(), 3);
}

#[test]
fn test_stale_resolution_not_cached_after_topology_change() {
    let strategy = create_strategy(2);
    strategy.get_shard_key("tenant-alpha");

    strategy.add_shard(ShardInfo::new("shard-2", "memory://shard-2"));
    let fresh = strategy.get_shard_key("tenant-alpha");

    assert_eq!(fresh.total_shards, 3);
    assert_eq!(strategy.get_shard_key("tenant-alpha"), fresh);
}
