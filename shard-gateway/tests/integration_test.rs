//! Integration tests for Gateway failure paths

use serde_json::json;
use shard_core::{HealthCheckConfig, InterceptorConfig, ManagerConfig};
use shard_gateway::{DispatchOutcome, Gateway, GatewayConfig};
use shard_pool::{MemoryPoolFactory, PoolFactory};
use shard_types::{ShardHealth, ShardInfo};
use std::sync::Arc;
use tenant_context::InboundMessage;
use tokio::sync::mpsc;

fn create_gateway_config(count: usize, interceptor: InterceptorConfig) -> GatewayConfig {
    GatewayConfig {
        manager: ManagerConfig {
            health_check: HealthCheckConfig {
                enabled: false,
                ..HealthCheckConfig::default()
            },
            ..ManagerConfig::default()
        },
        interceptor,
        shards: (0..count)
            .map(|i| ShardInfo::new(format!("shard-{}", i), format!("memory://shard-{}", i)))
            .collect(),
    }
}

/// Run `messages` through a fresh gateway and return the outcomes in order
/// of completion
async fn run_messages(
    config: GatewayConfig,
    factory: Arc<MemoryPoolFactory>,
    messages: Vec<InboundMessage>,
) -> Vec<DispatchOutcome> {
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

    let gateway = Gateway::new(config, factory as Arc<dyn PoolFactory>, message_rx)
        .await
        .with_outcomes(outcome_tx);

    for message in messages {
        message_tx.send(message).unwrap();
    }
    drop(message_tx);
    gateway.run().await;

    let mut outcomes = Vec::new();
    while let Some(outcome) = outcome_rx.recv().await {
        outcomes.push(outcome);
    }
    outcomes
}

fn query(topic: &str) -> InboundMessage {
    InboundMessage::new(topic).with_payload(json!({ "sql": "SELECT 1" }))
}

#[tokio::test]
async fn test_strict_mode_rejects_tenantless_message() {
    let config = create_gateway_config(
        2,
        InterceptorConfig {
            require_tenant: true,
            ..InterceptorConfig::default()
        },
    );
    let factory = Arc::new(MemoryPoolFactory::new());

    let outcomes = run_messages(config, Arc::clone(&factory), vec![query("sheet.query")]).await;

    assert_eq!(outcomes.len(), 1);
    let error = outcomes[0].error.as_deref().unwrap();
    assert!(error.contains("x-tenant-id"), "{}", error);
    assert!(error.contains("sheet.query"), "{}", error);

    // Nothing beyond the startup probes reached a pool
    for shard in ["shard-0", "shard-1"] {
        assert_eq!(factory.pool(shard).unwrap().statements(), vec!["SELECT 1"]);
    }
}

#[tokio::test]
async fn test_excluded_topic_has_no_tenant() {
    let factory = Arc::new(MemoryPoolFactory::new());
    let outcomes = run_messages(
        create_gateway_config(1, InterceptorConfig::default()),
        factory,
        vec![query("system.health").with_header("x-tenant-id", "tenant-alpha")],
    )
    .await;

    let error = outcomes[0].error.as_deref().unwrap();
    assert!(error.contains("No tenant context"), "{}", error);
}

#[tokio::test]
async fn test_invalid_payload_reported() {
    let factory = Arc::new(MemoryPoolFactory::new());
    let outcomes = run_messages(
        create_gateway_config(1, InterceptorConfig::default()),
        factory,
        vec![InboundMessage::new("sheet.query")
            .with_header("x-tenant-id", "tenant-alpha")
            .with_payload(json!({ "statement": "SELECT 1" }))],
    )
    .await;

    let error = outcomes[0].error.as_deref().unwrap();
    assert!(error.contains("invalid query payload"), "{}", error);
}

#[tokio::test]
async fn test_no_shards_fails_routing() {
    let factory = Arc::new(MemoryPoolFactory::new());
    let outcomes = run_messages(
        create_gateway_config(0, InterceptorConfig::default()),
        factory,
        vec![query("sheet.query").with_header("x-tenant-id", "tenant-alpha")],
    )
    .await;

    let error = outcomes[0].error.as_deref().unwrap();
    assert!(error.contains("tenant-alpha"), "{}", error);
}

#[tokio::test]
async fn test_unreachable_shard_degrades_only_its_tenants() {
    let factory = Arc::new(MemoryPoolFactory::new());
    factory.mark_unreachable("shard-1");

    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let gateway = Gateway::new(
        create_gateway_config(2, InterceptorConfig::default()),
        Arc::clone(&factory) as Arc<dyn PoolFactory>,
        message_rx,
    )
    .await;
    let manager = Arc::clone(gateway.manager());

    let tenants: Vec<String> = (0..40).map(|i| format!("tenant-{}", i)).collect();
    for tenant in &tenants {
        message_tx
            .send(query("sheet.query").with_header("x-tenant-id", tenant.as_str()))
            .unwrap();
    }
    drop(message_tx);

    let summary = gateway.run().await;
    assert_eq!(summary.received, 40);

    let on_broken = tenants
        .iter()
        .filter(|t| manager.get_shard_for_tenant(t).unwrap().shard_id == "shard-1")
        .count() as u64;
    assert_eq!(summary.failed, on_broken);
    assert_eq!(summary.succeeded, 40 - on_broken);

    let statuses = manager.get_shard_statuses();
    assert_eq!(statuses[0].status, ShardHealth::Healthy);
    assert_eq!(statuses[1].status, ShardHealth::Unhealthy);

    let metrics = manager.get_metrics_snapshot();
    assert_eq!(metrics.shard("shard-1").unwrap().unhealthy_route_count, on_broken);
}
