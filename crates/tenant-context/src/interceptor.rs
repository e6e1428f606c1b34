//! Message shard interceptor
//!
//! Bridges inbound message headers to [`TenantContext`]: the wrapped handler
//! runs inside a tenant scope opened from the tenant header, or with no
//! scope at all for excluded topics and tenant-less messages.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shard_core::InterceptorConfig;
use shard_router_core::ShardResolver;
use shard_types::{ContextMetadata, ShardId, TenantId};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::context::TenantContext;
use crate::error::InterceptorError;
use crate::handler::{InboundMessage, MessageHandler};
use crate::metrics::{InterceptorMetrics, InterceptorMetricsSnapshot};

/// Header carrying the caller's correlation id
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Metrics label for tenant scopes with no shard binding
pub const UNRESOLVED_SHARD: &str = "unresolved";

/// Context metadata key holding the message topic
pub const TOPIC_METADATA_KEY: &str = "topic";

#[derive(Debug, Clone, PartialEq, Eq)]
enum TopicPattern {
    Exact(String),
    Prefix(String),
}

impl TopicPattern {
    fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => TopicPattern::Prefix(prefix.to_string()),
            None => TopicPattern::Exact(pattern.to_string()),
        }
    }

    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::Exact(exact) => topic == exact,
            TopicPattern::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }
}

/// Shard placement of a tenant, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRoute {
    pub shard_id: ShardId,
    pub total_shards: usize,
}

struct Inner {
    config: InterceptorConfig,
    exclusions: Vec<TopicPattern>,
    context: Arc<TenantContext>,
    resolver: RwLock<Option<Arc<dyn ShardResolver>>>,
    metrics: InterceptorMetrics,
}

/// Wraps message handlers so they run in the tenant scope named by the
/// message's tenant header.
///
/// Cheap to clone; clones share configuration, resolver and metrics.
#[derive(Clone)]
pub struct MessageShardInterceptor {
    inner: Arc<Inner>,
}

impl MessageShardInterceptor {
    /// Interceptor bound to the process-wide [`TenantContext::shared`]
    pub fn new(config: InterceptorConfig) -> Self {
        Self::with_context(config, TenantContext::shared())
    }

    pub fn with_context(config: InterceptorConfig, context: Arc<TenantContext>) -> Self {
        let exclusions = config
            .excluded_topics()
            .iter()
            .map(|pattern| TopicPattern::parse(pattern))
            .collect();

        Self {
            inner: Arc::new(Inner {
                config,
                exclusions,
                context,
                resolver: RwLock::new(None),
                metrics: InterceptorMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &Arc<TenantContext> {
        &self.inner.context
    }

    /// Wire the pool manager for both shard lookups here and eager
    /// resolution in the tenant context
    pub fn set_pool_manager<R: ShardResolver + 'static>(&self, manager: Arc<R>) {
        let resolver: Arc<dyn ShardResolver> = manager;
        *self.inner.resolver.write() = Some(Arc::clone(&resolver));
        self.inner.context.set_resolver(resolver);
    }

    /// Attached and reporting at least one healthy shard
    pub fn is_configured(&self) -> bool {
        self.inner
            .resolver
            .read()
            .as_ref()
            .is_some_and(|resolver| resolver.healthy_shard_count() > 0)
    }

    /// Where a tenant would be routed; `None` when unconfigured or unroutable
    pub fn get_shard_info(&self, tenant_id: &str) -> Option<ShardRoute> {
        let resolver = self.inner.resolver.read().clone()?;
        resolver
            .resolve_shard(tenant_id)
            .ok()
            .map(|result| ShardRoute {
                shard_id: result.shard_id,
                total_shards: result.total_shards,
            })
    }

    pub fn is_excluded(&self, topic: &str) -> bool {
        self.inner.exclusions.iter().any(|pattern| pattern.matches(topic))
    }

    pub fn metrics(&self) -> InterceptorMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn wrap<H: MessageHandler>(&self, handler: H) -> ShardAwareHandler<H> {
        ShardAwareHandler {
            interceptor: self.clone(),
            inner: handler,
        }
    }

    /// Tenant id this interceptor routes `message` by: the configured
    /// header, trimmed. Blank counts as missing.
    pub fn tenant_id_of(&self, message: &InboundMessage) -> Option<TenantId> {
        message
            .header(&self.inner.config.tenant_header_name)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    async fn dispatch<H>(&self, handler: &H, message: InboundMessage) -> anyhow::Result<Value>
    where
        H: MessageHandler + ?Sized,
    {
        let inner = &self.inner;

        if self.is_excluded(&message.topic) {
            inner.metrics.record_excluded();
            trace!(topic = %message.topic, "Topic excluded from tenant routing");
            return TenantContext::without_context(handler.handle(message)).await;
        }

        let Some(tenant_id) = self.tenant_id_of(&message) else {
            inner.metrics.record_missing_tenant();
            let header = inner.config.tenant_header_name.clone();

            if inner.config.require_tenant {
                warn!(topic = %message.topic, header = %header, "Rejecting message without tenant header");
                return Err(InterceptorError::MissingTenant {
                    header,
                    topic: message.topic,
                }
                .into());
            }

            debug!(topic = %message.topic, header = %header, "No tenant header, handling without tenant context");
            return TenantContext::without_context(handler.handle(message)).await;
        };

        let correlation_id = message
            .header(CORRELATION_HEADER)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let topic = message.topic.clone();
        let metadata = ContextMetadata::default()
            .with_correlation_id(correlation_id)
            .with_value(TOPIC_METADATA_KEY, topic.clone());

        let started = Instant::now();
        let (result, shard_id) = inner
            .context
            .run_async_with_metadata(&tenant_id, metadata, scoped(handler, message))
            .await;
        let elapsed = started.elapsed();
        let shard_id = shard_id.unwrap_or_else(|| UNRESOLVED_SHARD.to_string());

        match result {
            Ok(value) => {
                inner.metrics.record_routed(&shard_id, elapsed);
                debug!(
                    tenant_id = %tenant_id,
                    shard_id = %shard_id,
                    topic = %topic,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Message routed"
                );
                Ok(value)
            }
            Err(err) => {
                inner.metrics.record_error(&shard_id);
                warn!(
                    tenant_id = %tenant_id,
                    shard_id = %shard_id,
                    topic = %topic,
                    error = %err,
                    "Message handler failed"
                );
                Err(err)
            }
        }
    }
}

/// Run the handler and report the shard bound to the enclosing scope
fn scoped<'a, H>(
    handler: &'a H,
    message: InboundMessage,
) -> impl Future<Output = (anyhow::Result<Value>, Option<ShardId>)> + Send + 'a
where
    H: MessageHandler + ?Sized,
{
    async move {
        let shard_id = TenantContext::shard_id();
        (handler.handle(message).await, shard_id)
    }
}

impl std::fmt::Debug for MessageShardInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageShardInterceptor")
            .field("config", &self.inner.config)
            .field("configured", &self.is_configured())
            .finish()
    }
}

/// Handler produced by [`MessageShardInterceptor::wrap`]
pub struct ShardAwareHandler<H> {
    interceptor: MessageShardInterceptor,
    inner: H,
}

impl<H> ShardAwareHandler<H> {
    pub fn interceptor(&self) -> &MessageShardInterceptor {
        &self.interceptor
    }

    pub fn into_inner(self) -> H {
        self.inner
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for ShardAwareHandler<H> {
    async fn handle(&self, message: InboundMessage) -> anyhow::Result<Value> {
        self.interceptor.dispatch(&self.inner, message).await
    }
}

/// The tenant and shard a tenant-aware handler runs for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantShardBinding {
    pub tenant_id: TenantId,
    pub shard_id: ShardId,
}

/// Handler that receives its tenant binding as an argument, see
/// [`create_tenant_aware_handler`]
pub struct TenantAwareHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for TenantAwareHandler<F>
where
    F: Fn(InboundMessage, TenantShardBinding) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, message: InboundMessage) -> anyhow::Result<Value> {
        let binding = TenantContext::current().and_then(|data| {
            let shard_id = data.shard_id()?.clone();
            Some(TenantShardBinding {
                tenant_id: data.tenant_id,
                shard_id,
            })
        });

        match binding {
            Some(binding) => (self.f)(message, binding).await,
            None => Err(InterceptorError::TenantContextUnavailable.into()),
        }
    }
}

/// Wrap `f` with `interceptor`, handing it `{tenant_id, shard_id}` explicitly.
///
/// Fails with [`InterceptorError::TenantContextUnavailable`] when a message
/// reaches it without a resolved tenant scope (excluded topic, missing
/// header, or no shard binding).
pub fn create_tenant_aware_handler<F, Fut>(
    f: F,
    interceptor: &MessageShardInterceptor,
) -> ShardAwareHandler<TenantAwareHandler<F>>
where
    F: Fn(InboundMessage, TenantShardBinding) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    interceptor.wrap(TenantAwareHandler { f })
}
