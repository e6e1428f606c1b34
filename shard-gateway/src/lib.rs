//! Shard Gateway - tenant message dispatch
//!
//! The gateway is responsible for:
//! - Building the sharded pool manager from configuration
//! - Wiring the message interceptor to the manager
//! - Receiving inbound messages and handling each one concurrently
//! - Running each message's query on its tenant's shard
//! - Picking each shard's pool backend from its connection URL

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shard_core::{discover_shards, InterceptorConfig, ManagerConfig};
use shard_core::PoolConfig;
use shard_pool::{
    ConnectionPool, MemoryPoolFactory, PgPoolFactory, PoolError, PoolFactory, ShardedPoolManager,
};
use shard_types::{ShardInfo, TenantId};
use std::sync::Arc;
use tenant_context::{
    InboundMessage, MessageHandler, MessageShardInterceptor, ShardAwareHandler, TenantContext,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Everything needed to start a gateway
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub manager: ManagerConfig,
    pub interceptor: InterceptorConfig,
    pub shards: Vec<ShardInfo>,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        Self {
            manager: ManagerConfig::from_lookup(lookup),
            interceptor: InterceptorConfig::from_lookup(lookup),
            shards: discover_shards(lookup),
        }
    }
}

/// Pool factory that picks a backend per shard from the URL scheme:
/// `postgres://` / `postgresql://` get a sqlx pool, `memory://` the
/// in-memory backend.
#[derive(Default)]
pub struct GatewayPoolFactory {
    memory: MemoryPoolFactory,
    postgres: PgPoolFactory,
}

impl GatewayPoolFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory pools created so far, for dry runs
    pub fn memory(&self) -> &MemoryPoolFactory {
        &self.memory
    }
}

impl PoolFactory for GatewayPoolFactory {
    fn create_pool(
        &self,
        shard: &ShardInfo,
        config: &PoolConfig,
    ) -> Result<Arc<dyn ConnectionPool>, PoolError> {
        let scheme = shard
            .connection_url
            .split_once("://")
            .map_or("", |(scheme, _)| scheme);

        match scheme {
            "postgres" | "postgresql" => self.postgres.create_pool(shard, config),
            "memory" => self.memory.create_pool(shard, config),
            other => Err(PoolError::Creation(format!(
                "unsupported connection url scheme '{}' for {}",
                other, shard.shard_id
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "UrlScheme"
    }
}

/// Result of handling one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub topic: String,

    /// Tenant the message was routed by, if any
    pub tenant_id: Option<TenantId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchOutcome {
    fn new(topic: String, tenant_id: Option<TenantId>, result: &anyhow::Result<Value>) -> Self {
        let (value, error) = match result {
            Ok(value) => (Some(value.clone()), None),
            Err(err) => (None, Some(format!("{:#}", err))),
        };
        Self {
            topic,
            tenant_id,
            value,
            error,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Totals reported when the gateway stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewaySummary {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Query payload: `{ "sql": "...", "params": [...] }`
#[derive(Debug, Deserialize)]
struct QueryRequest {
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
}

/// Runs the payload's statement on the ambient tenant's shard
pub struct QueryHandler {
    manager: Arc<ShardedPoolManager>,
}

impl QueryHandler {
    pub fn new(manager: Arc<ShardedPoolManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl MessageHandler for QueryHandler {
    async fn handle(&self, message: InboundMessage) -> anyhow::Result<Value> {
        let tenant_id = TenantContext::require_tenant_id()?;
        let request: QueryRequest = serde_json::from_value(message.payload)
            .with_context(|| format!("invalid query payload on topic '{}'", message.topic))?;

        let result = self
            .manager
            .query_for_tenant(&tenant_id, &request.sql, &request.params)
            .await?;

        Ok(serde_json::to_value(result)?)
    }
}

/// Gateway node
pub struct Gateway {
    manager: Arc<ShardedPoolManager>,
    interceptor: MessageShardInterceptor,
    handler: Arc<ShardAwareHandler<QueryHandler>>,
    message_rx: mpsc::UnboundedReceiver<InboundMessage>,
    outcome_tx: Option<mpsc::UnboundedSender<DispatchOutcome>>,
}

impl Gateway {
    /// Create a gateway and bring its shards up
    pub async fn new(
        config: GatewayConfig,
        factory: Arc<dyn PoolFactory>,
        message_rx: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> Self {
        info!(
            shards = config.shards.len(),
            factory = factory.name(),
            tenant_header = %config.interceptor.tenant_header_name,
            "Creating shard gateway"
        );

        let manager = Arc::new(ShardedPoolManager::new(config.manager, factory));
        manager.initialize(Some(config.shards)).await;

        let interceptor =
            MessageShardInterceptor::with_context(config.interceptor, Arc::new(TenantContext::new()));
        interceptor.set_pool_manager(Arc::clone(&manager));

        let handler = Arc::new(interceptor.wrap(QueryHandler::new(Arc::clone(&manager))));

        Self {
            manager,
            interceptor,
            handler,
            message_rx,
            outcome_tx: None,
        }
    }

    /// Report every handled message on `outcome_tx`
    pub fn with_outcomes(mut self, outcome_tx: mpsc::UnboundedSender<DispatchOutcome>) -> Self {
        self.outcome_tx = Some(outcome_tx);
        self
    }

    pub fn manager(&self) -> &Arc<ShardedPoolManager> {
        &self.manager
    }

    pub fn interceptor(&self) -> &MessageShardInterceptor {
        &self.interceptor
    }

    /// Handle messages until the inbound channel closes and every in-flight
    /// message has finished.
    ///
    /// The manager is left open; call [`ShardedPoolManager::close`] when done.
    pub async fn run(mut self) -> GatewaySummary {
        info!(
            shards = self.manager.shard_count(),
            healthy = self.manager.healthy_shard_count(),
            "Shard gateway started"
        );

        let mut summary = GatewaySummary::default();
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    record(&mut summary, joined);
                }
                message = self.message_rx.recv() => match message {
                    Some(message) => {
                        summary.received += 1;
                        in_flight.spawn(dispatch(
                            Arc::clone(&self.handler),
                            self.interceptor.clone(),
                            message,
                            self.outcome_tx.clone(),
                        ));
                    }
                    None => break,
                },
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            record(&mut summary, joined);
        }

        info!(
            received = summary.received,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Shard gateway stopped"
        );
        summary
    }
}

async fn dispatch(
    handler: Arc<ShardAwareHandler<QueryHandler>>,
    interceptor: MessageShardInterceptor,
    message: InboundMessage,
    outcome_tx: Option<mpsc::UnboundedSender<DispatchOutcome>>,
) -> bool {
    let topic = message.topic.clone();
    let tenant_id = interceptor.tenant_id_of(&message);

    let result = handler.handle(message).await;
    if let Err(err) = &result {
        warn!(topic = %topic, tenant_id = ?tenant_id, error = %format!("{:#}", err), "Message failed");
    }

    let outcome = DispatchOutcome::new(topic, tenant_id, &result);
    let ok = outcome.is_ok();
    if let Some(tx) = outcome_tx {
        if tx.send(outcome).is_err() {
            debug!("Outcome receiver dropped");
        }
    }
    ok
}

fn record(summary: &mut GatewaySummary, joined: Result<bool, tokio::task::JoinError>) {
    match joined {
        Ok(true) => summary.succeeded += 1,
        Ok(false) => summary.failed += 1,
        Err(err) => {
            summary.failed += 1;
            error!(error = %err, "Dispatch task panicked");
        }
    }
}
