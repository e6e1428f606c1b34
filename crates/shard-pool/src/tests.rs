//! Manager tests against the in-memory backend

use crate::{
    ConnectionPool, MemoryPool, MemoryPoolFactory, PoolError, PoolFactory, ShardError,
    ShardedPoolManager,
};
use futures::future::join_all;
use serde_json::json;
use shard_core::{HealthCheckConfig, ManagerConfig, PoolConfig, PoolOverrides};
use shard_router_core::{RouterError, ShardResolver};
use shard_types::{ShardHealth, ShardInfo};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

fn test_config() -> ManagerConfig {
    ManagerConfig {
        pool: PoolConfig {
            max_connections: 4,
            connection_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        },
        health_check: HealthCheckConfig {
            enabled: false,
            ..HealthCheckConfig::default()
        },
        ..ManagerConfig::default()
    }
}

fn shards(count: usize) -> Vec<ShardInfo> {
    (0..count)
        .map(|i| ShardInfo::new(format!("shard-{}", i), format!("memory://shard-{}", i)))
        .collect()
}

async fn create_manager(
    config: ManagerConfig,
    count: usize,
) -> (Arc<ShardedPoolManager>, Arc<MemoryPoolFactory>) {
    let factory = Arc::new(MemoryPoolFactory::new());
    let manager = Arc::new(ShardedPoolManager::new(
        config,
        Arc::clone(&factory) as Arc<dyn PoolFactory>,
    ));
    manager.initialize(Some(shards(count))).await;
    (manager, factory)
}

fn memory_pool(factory: &MemoryPoolFactory, shard_id: &str) -> Arc<MemoryPool> {
    factory.pool(shard_id).expect("pool should exist")
}

fn status_of(manager: &ShardedPoolManager, shard_id: &str) -> ShardHealth {
    manager
        .get_shard_statuses()
        .into_iter()
        .find(|s| s.shard_id == shard_id)
        .map(|s| s.status)
        .expect("shard should be registered")
}

// ============================================
// Routing
// ============================================

#[tokio::test]
async fn test_tenant_queries_stick_to_one_shard() {
    let (manager, factory) = create_manager(test_config(), 2).await;

    let shard = manager.get_shard_for_tenant("tenant-alpha").unwrap();
    assert_eq!(shard.total_shards, 2);

    for _ in 0..10 {
        manager
            .query_for_tenant("tenant-alpha", "SELECT * FROM sheets", &[json!(1)])
            .await
            .unwrap();
    }

    let pool = memory_pool(&factory, &shard.shard_id);
    assert_eq!(pool.statement_count("SELECT * FROM sheets"), 10);

    let other = if shard.shard_id == "shard-0" { "shard-1" } else { "shard-0" };
    assert_eq!(memory_pool(&factory, other).statement_count("SELECT * FROM sheets"), 0);

    let metrics = manager.get_metrics_snapshot();
    assert_eq!(metrics.shard(&shard.shard_id).unwrap().query_count, 10);
    assert_eq!(metrics.shard(&shard.shard_id).unwrap().latency.count, 10);
}

#[tokio::test]
async fn test_pool_for_tenant_matches_shard_pool() {
    let (manager, _factory) = create_manager(test_config(), 3).await;

    let shard = manager.get_shard_for_tenant("tenant-beta").unwrap();
    let by_tenant = manager.get_pool_for_tenant("tenant-beta").unwrap();
    let by_id = manager.get_pool_by_shard_id(&shard.shard_id).unwrap();

    assert!(Arc::ptr_eq(&by_tenant, &by_id));
}

#[tokio::test]
async fn test_resolver_agrees_with_manager() {
    let (manager, _factory) = create_manager(test_config(), 4).await;
    let resolver: &dyn ShardResolver = &*manager;

    for i in 0..50 {
        let tenant = format!("tenant-{}", i);
        assert_eq!(
            resolver.resolve_shard(&tenant).unwrap(),
            manager.get_shard_for_tenant(&tenant).unwrap()
        );
    }
    assert_eq!(resolver.healthy_shard_count(), 4);
}

#[tokio::test]
async fn test_no_shards_fails_routing() {
    let (manager, _factory) = create_manager(test_config(), 0).await;

    assert!(manager.is_initialized());
    assert!(matches!(
        manager.get_shard_for_tenant("tenant-alpha"),
        Err(ShardError::Routing(RouterError::NoShardsAvailable { .. }))
    ));
    assert!(matches!(
        manager.query_for_tenant("tenant-alpha", "SELECT 1", &[]).await,
        Err(ShardError::Routing(RouterError::NoShardsAvailable { .. }))
    ));
}

#[tokio::test]
async fn test_empty_tenant_rejected() {
    let (manager, _factory) = create_manager(test_config(), 2).await;

    assert!(matches!(
        manager.get_shard_for_tenant(""),
        Err(ShardError::Routing(RouterError::InvalidTenantId))
    ));
}

#[tokio::test]
async fn test_concurrent_tenant_queries() {
    let (manager, _factory) = create_manager(test_config(), 3).await;

    let results = join_all((0..50).map(|i| {
        let manager = Arc::clone(&manager);
        async move {
            manager
                .query_for_tenant(&format!("tenant-{}", i), "SELECT 2", &[])
                .await
        }
    }))
    .await;
    assert!(results.iter().all(|r| r.is_ok()));

    let total: u64 = manager
        .get_metrics_snapshot()
        .shards
        .iter()
        .map(|s| s.query_count)
        .sum();
    assert_eq!(total, 50);
}

// ============================================
// Topology
// ============================================

#[tokio::test]
async fn test_duplicate_shard_ignored() {
    let (manager, _factory) = create_manager(test_config(), 2).await;

    let added = manager
        .add_shard(ShardInfo::new("shard-0", "memory://elsewhere"))
        .await
        .unwrap();

    assert!(!added);
    assert_eq!(manager.get_shard_ids(), vec!["shard-0", "shard-1"]);
    assert_eq!(
        manager.get_shard_info("shard-0").unwrap().connection_url,
        "memory://shard-0"
    );
}

#[tokio::test]
async fn test_add_shard_extends_routing() {
    let (manager, _factory) = create_manager(test_config(), 2).await;

    assert!(manager
        .add_shard(ShardInfo::new("shard-2", "memory://shard-2"))
        .await
        .unwrap());

    assert_eq!(manager.get_shard_for_tenant("tenant-alpha").unwrap().total_shards, 3);
    assert_eq!(manager.strategy().shard_count(), 3);
}

#[tokio::test]
async fn test_remove_shard_closes_pool() {
    let (manager, factory) = create_manager(test_config(), 2).await;

    assert!(manager.remove_shard("shard-1").await);
    assert!(!manager.remove_shard("shard-1").await);

    assert!(memory_pool(&factory, "shard-1").is_closed());
    assert!(matches!(
        manager.get_pool_by_shard_id("shard-1"),
        Err(ShardError::ShardNotFound(id)) if id == "shard-1"
    ));

    for i in 0..20 {
        let shard = manager.get_shard_for_tenant(&format!("tenant-{}", i)).unwrap();
        assert_eq!(shard.shard_id, "shard-0");
        assert_eq!(shard.total_shards, 1);
    }
}

#[tokio::test]
async fn test_failed_pool_creation_skips_shard() {
    let factory = Arc::new(MemoryPoolFactory::new());
    factory.fail_creation("shard-1");
    let manager = Arc::new(ShardedPoolManager::new(
        test_config(),
        Arc::clone(&factory) as Arc<dyn PoolFactory>,
    ));

    manager.initialize(Some(shards(3))).await;

    assert_eq!(manager.get_shard_ids(), vec!["shard-0", "shard-2"]);
    assert_eq!(manager.strategy().shard_count(), 2);
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let (manager, _factory) = create_manager(test_config(), 2).await;

    manager.initialize(Some(shards(5))).await;
    assert_eq!(manager.shard_count(), 2);
}

#[tokio::test]
async fn test_shard_overrides_applied() {
    let mut config = test_config();
    config.shard_overrides.insert(
        "shard-1".to_string(),
        PoolOverrides {
            max_connections: Some(2),
            ..PoolOverrides::default()
        },
    );
    let (_manager, factory) = create_manager(config, 2).await;

    assert_eq!(memory_pool(&factory, "shard-0").config().max_connections, 4);
    assert_eq!(memory_pool(&factory, "shard-1").config().max_connections, 2);
}

// ============================================
// Health
// ============================================

#[tokio::test]
async fn test_unreachable_shard_starts_unhealthy_and_recovers() {
    let factory = Arc::new(MemoryPoolFactory::new());
    factory.mark_unreachable("shard-1");
    let manager = Arc::new(ShardedPoolManager::new(
        test_config(),
        Arc::clone(&factory) as Arc<dyn PoolFactory>,
    ));
    manager.initialize(Some(shards(2))).await;

    // Still registered and routable
    assert_eq!(manager.shard_count(), 2);
    assert_eq!(status_of(&manager, "shard-0"), ShardHealth::Healthy);
    assert_eq!(status_of(&manager, "shard-1"), ShardHealth::Unhealthy);
    assert_eq!(manager.healthy_shard_count(), 1);

    let status = manager
        .get_shard_statuses()
        .into_iter()
        .find(|s| s.shard_id == "shard-1")
        .unwrap();
    assert!(status.error.is_some());
    assert!(status.last_health_check.is_some());

    memory_pool(&factory, "shard-1").set_healthy(true);
    manager.run_health_checks().await;

    assert_eq!(status_of(&manager, "shard-1"), ShardHealth::Healthy);
    assert_eq!(manager.healthy_shard_count(), 2);
}

#[tokio::test]
async fn test_pool_error_event_marks_unhealthy() {
    let (manager, factory) = create_manager(test_config(), 2).await;

    memory_pool(&factory, "shard-0").emit_error(PoolError::Connection("reset by peer".into()));

    assert_eq!(status_of(&manager, "shard-0"), ShardHealth::Unhealthy);
    assert_eq!(status_of(&manager, "shard-1"), ShardHealth::Healthy);
    assert_eq!(
        manager.get_metrics_snapshot().shard("shard-0").unwrap().error_count,
        1
    );

    manager.run_health_checks().await;
    assert_eq!(status_of(&manager, "shard-0"), ShardHealth::Healthy);
}

#[tokio::test]
async fn test_statement_error_keeps_shard_healthy() {
    let (manager, factory) = create_manager(test_config(), 1).await;
    memory_pool(&factory, "shard-0").fail_statement("SELEC 1", "syntax error");

    let err = assert_err!(manager.query_for_tenant("tenant-alpha", "SELEC 1", &[]).await);

    assert!(matches!(
        err,
        ShardError::Pool { ref shard_id, source: PoolError::Query(_) } if shard_id == "shard-0"
    ));
    assert_eq!(status_of(&manager, "shard-0"), ShardHealth::Healthy);

    let metrics = manager.get_metrics_snapshot();
    assert_eq!(metrics.shard("shard-0").unwrap().error_count, 1);
}

#[tokio::test]
async fn test_unhealthy_shard_still_receives_traffic() {
    let (manager, factory) = create_manager(test_config(), 1).await;
    let pool = memory_pool(&factory, "shard-0");
    pool.set_healthy(false);

    let err = manager
        .query_for_tenant("tenant-alpha", "SELECT 1", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::Pool { source: PoolError::Connection(_), .. }));
    assert_eq!(status_of(&manager, "shard-0"), ShardHealth::Unhealthy);

    // Routed again while unhealthy: attempted, logged and counted
    let _ = manager.query_for_tenant("tenant-alpha", "SELECT 1", &[]).await;

    let metrics = manager.get_metrics_snapshot();
    let shard = metrics.shard("shard-0").unwrap();
    assert_eq!(shard.unhealthy_route_count, 1);
    assert_eq!(shard.error_count, 2);
    assert_eq!(metrics.unhealthy_shards, 1);
}

#[tokio::test]
async fn test_hanging_shard_does_not_delay_other_health_checks() {
    // connection_timeout is 100ms in test_config
    let (manager, factory) = create_manager(test_config(), 2).await;

    memory_pool(&factory, "shard-0").set_latency(Some(Duration::from_secs(5)));
    memory_pool(&factory, "shard-1").emit_error(PoolError::Connection("reset by peer".into()));
    assert_eq!(status_of(&manager, "shard-1"), ShardHealth::Unhealthy);

    let started = Instant::now();
    manager.run_health_checks().await;
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "health pass took {:?}",
        started.elapsed()
    );

    assert_eq!(status_of(&manager, "shard-1"), ShardHealth::Healthy);

    let hung = manager
        .get_shard_statuses()
        .into_iter()
        .find(|s| s.shard_id == "shard-0")
        .unwrap();
    assert_eq!(hung.status, ShardHealth::Unhealthy);
    assert_eq!(
        hung.error.as_deref(),
        Some(PoolError::Timeout(Duration::from_millis(100)).to_string().as_str())
    );
}

#[tokio::test]
async fn test_background_health_checks() {
    let mut config = test_config();
    config.health_check = HealthCheckConfig {
        enabled: true,
        interval: Duration::from_millis(20),
    };
    let (manager, factory) = create_manager(config, 1).await;

    memory_pool(&factory, "shard-0").emit_error(PoolError::Connection("reset by peer".into()));
    assert_eq!(status_of(&manager, "shard-0"), ShardHealth::Unhealthy);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(status_of(&manager, "shard-0"), ShardHealth::Healthy);

    manager.close().await;
}

// ============================================
// Query timing
// ============================================

#[tokio::test]
async fn test_slow_query_counted() {
    let mut config = test_config();
    config.pool.slow_query_threshold = Duration::from_millis(10);
    let (manager, factory) = create_manager(config, 1).await;
    memory_pool(&factory, "shard-0").set_latency(Some(Duration::from_millis(25)));

    assert_ok!(
        manager
            .query_for_tenant("tenant-alpha", "SELECT * FROM cells", &[])
            .await
    );

    let metrics = manager.get_metrics_snapshot();
    let shard = metrics.shard("shard-0").unwrap();
    assert_eq!(shard.slow_query_count, 1);
    assert_eq!(shard.query_count, 1);
}

#[tokio::test]
async fn test_query_timeout_marks_unhealthy() {
    let mut config = test_config();
    config.pool.query_timeout = Some(Duration::from_millis(20));
    let (manager, factory) = create_manager(config, 1).await;
    memory_pool(&factory, "shard-0").set_latency(Some(Duration::from_millis(200)));

    let err = manager
        .query_for_tenant("tenant-alpha", "SELECT * FROM cells", &[])
        .await
        .unwrap_err();

    assert!(matches!(err, ShardError::Pool { source: PoolError::Timeout(_), .. }));
    assert_eq!(status_of(&manager, "shard-0"), ShardHealth::Unhealthy);
}

// ============================================
// Transactions
// ============================================

#[tokio::test]
async fn test_transaction_commits() {
    let (manager, factory) = create_manager(test_config(), 1).await;

    let value = manager
        .transaction_for_tenant("tenant-alpha", |conn| {
            Box::pin(async move {
                conn.execute("INSERT INTO views VALUES ($1)", &[json!("grid")]).await?;
                conn.execute("UPDATE sheets SET touched = true", &[]).await?;
                Ok::<_, anyhow::Error>(42)
            })
        })
        .await
        .unwrap();

    assert_eq!(value, 42);

    let pool = memory_pool(&factory, "shard-0");
    let statements = pool.statements();
    assert_eq!(
        &statements[statements.len() - 4..],
        &[
            "BEGIN",
            "INSERT INTO views VALUES ($1)",
            "UPDATE sheets SET touched = true",
            "COMMIT"
        ]
    );
    assert_eq!(pool.stats().idle, pool.stats().total);
}

#[tokio::test]
async fn test_transaction_rolls_back_on_handler_error() {
    let (manager, factory) = create_manager(test_config(), 1).await;

    let err = manager
        .transaction_for_tenant("tenant-alpha", |conn| {
            Box::pin(async move {
                conn.execute("DELETE FROM sheets", &[]).await?;
                Err::<(), _>(anyhow::anyhow!("sheet is locked"))
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ShardError::Handler(_)));
    assert_eq!(err.to_string(), "sheet is locked");

    let pool = memory_pool(&factory, "shard-0");
    assert_eq!(pool.statement_count("ROLLBACK"), 1);
    assert_eq!(pool.statement_count("COMMIT"), 0);
    assert_eq!(pool.stats().idle, pool.stats().total);
}

#[tokio::test]
async fn test_transaction_connection_loss_marks_unhealthy() {
    let (manager, factory) = create_manager(test_config(), 2).await;
    let shard_id = manager.get_shard_for_tenant("tenant-alpha").unwrap().shard_id;
    let pool = memory_pool(&factory, &shard_id);

    let lost = Arc::clone(&pool);
    let err = manager
        .transaction_for_tenant("tenant-alpha", move |conn| {
            Box::pin(async move {
                conn.execute("DELETE FROM cells WHERE sheet_id = 7", &[]).await?;
                lost.set_healthy(false);
                conn.execute("UPDATE sheets SET dirty = true", &[]).await?;
                Ok::<_, anyhow::Error>(())
            })
        })
        .await
        .unwrap_err();

    let ShardError::Handler(inner) = &err else {
        panic!("expected handler error, got {:?}", err);
    };
    assert!(matches!(inner.downcast_ref::<PoolError>(), Some(PoolError::Connection(_))));

    assert_eq!(status_of(&manager, &shard_id), ShardHealth::Unhealthy);
    let other = if shard_id == "shard-0" { "shard-1" } else { "shard-0" };
    assert_eq!(status_of(&manager, other), ShardHealth::Healthy);

    let metrics = manager.get_metrics_snapshot();
    assert_eq!(metrics.shard(&shard_id).unwrap().error_count, 1);
    assert_eq!(pool.stats().idle, pool.stats().total);
}

#[tokio::test]
async fn test_transaction_wrapped_connection_loss_marks_unhealthy() {
    use anyhow::Context as _;

    let (manager, factory) = create_manager(test_config(), 1).await;
    let pool = memory_pool(&factory, "shard-0");

    let lost = Arc::clone(&pool);
    let err = assert_err!(
        manager
            .transaction_for_tenant("tenant-alpha", move |conn| {
                Box::pin(async move {
                    lost.set_healthy(false);
                    conn.execute("UPDATE sheets SET dirty = true", &[])
                        .await
                        .context("marking sheet dirty")?;
                    Ok::<_, anyhow::Error>(())
                })
            })
            .await
    );

    assert_eq!(err.to_string(), "marking sheet dirty");
    assert_eq!(status_of(&manager, "shard-0"), ShardHealth::Unhealthy);
}

#[tokio::test]
async fn test_transaction_statement_error_keeps_shard_healthy() {
    let (manager, factory) = create_manager(test_config(), 1).await;
    let pool = memory_pool(&factory, "shard-0");
    pool.fail_statement("INSERT INTO views VALUES (NULL)", "null value in column \"name\"");

    assert_err!(
        manager
            .transaction_for_tenant("tenant-alpha", |conn| {
                Box::pin(async move {
                    conn.execute("INSERT INTO views VALUES (NULL)", &[]).await?;
                    Ok::<_, anyhow::Error>(())
                })
            })
            .await
    );

    assert_eq!(status_of(&manager, "shard-0"), ShardHealth::Healthy);
    assert_eq!(pool.statement_count("ROLLBACK"), 1);
}

#[tokio::test]
async fn test_abandoned_transaction_rolled_back() {
    let mut config = test_config();
    config.pool.max_connections = 1;
    let (manager, factory) = create_manager(config, 1).await;

    let pending = manager.transaction_for_tenant("tenant-alpha", |conn| {
        Box::pin(async move {
            conn.execute("UPDATE sheets SET locked = true", &[]).await?;
            futures::future::pending::<()>().await;
            Ok::<_, anyhow::Error>(())
        })
    });
    assert_err!(tokio::time::timeout(Duration::from_millis(20), pending).await);

    // The rollback holds the only connection, so this waits for it
    assert_ok!(manager.query_for_tenant("tenant-alpha", "SELECT 1", &[]).await);

    let statements = memory_pool(&factory, "shard-0").statements();
    assert_eq!(
        &statements[statements.len() - 4..],
        &["BEGIN", "UPDATE sheets SET locked = true", "ROLLBACK", "SELECT 1"]
    );
    assert_eq!(memory_pool(&factory, "shard-0").statement_count("COMMIT"), 0);
}

#[tokio::test]
async fn test_transaction_releases_connection_for_next_caller() {
    let mut config = test_config();
    config.pool.max_connections = 1;
    let (manager, factory) = create_manager(config, 1).await;

    for _ in 0..3 {
        let _ = manager
            .transaction_for_tenant("tenant-alpha", |_conn| {
                Box::pin(async move { Err::<(), _>(anyhow::anyhow!("abort")) })
            })
            .await;
    }

    // A leaked connection would make this time out
    manager
        .query_for_tenant("tenant-alpha", "SELECT 1", &[])
        .await
        .unwrap();
    assert_eq!(memory_pool(&factory, "shard-0").statement_count("ROLLBACK"), 3);
}

// ============================================
// Shutdown
// ============================================

#[tokio::test]
async fn test_close_attempts_every_pool() {
    let (manager, factory) = create_manager(test_config(), 3).await;
    memory_pool(&factory, "shard-1").set_fail_close(true);

    manager.close().await;

    assert!(manager.get_shard_ids().is_empty());
    assert!(!manager.is_initialized());
    for id in ["shard-0", "shard-1", "shard-2"] {
        assert_eq!(memory_pool(&factory, id).close_attempts(), 1, "{}", id);
    }
    assert!(memory_pool(&factory, "shard-0").is_closed());
    assert!(!memory_pool(&factory, "shard-1").is_closed());

    assert!(matches!(
        manager.get_shard_for_tenant("tenant-alpha"),
        Err(ShardError::Routing(RouterError::NoShardsAvailable { .. }))
    ));
}

#[tokio::test]
async fn test_close_pool_directly_then_query_fails() {
    let (manager, factory) = create_manager(test_config(), 1).await;
    memory_pool(&factory, "shard-0").close().await.unwrap();

    let err = manager
        .query_for_tenant("tenant-alpha", "SELECT 1", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::Pool { source: PoolError::Closed, .. }));
}
