//! Tenant Context - ambient tenant binding for message handling
//!
//! # Architecture
//!
//! ```text
//! InboundMessage { topic, headers["x-tenant-id"], payload }
//!     │
//!     ▼
//! ┌──────────────────────────────┐
//! │  MessageShardInterceptor     │  excluded topic / missing tenant → no scope
//! └──────────────┬───────────────┘
//!                │ run_async(tenant_id, ...)
//!                ▼
//! ┌──────────────────────────────┐
//! │  TenantContext               │  task-local { tenant_id, shard_result }
//! │  (ShardResolver on entry)    │
//! └──────────────┬───────────────┘
//!                │
//!                ▼
//!        wrapped MessageHandler
//!   (reads TenantContext::tenant_id() / shard_id())
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let interceptor = MessageShardInterceptor::new(InterceptorConfig::from_env());
//! interceptor.set_pool_manager(Arc::clone(&manager));
//!
//! let handler = interceptor.wrap(handler_fn(|message: InboundMessage| async move {
//!     let tenant = TenantContext::require_tenant_id()?;
//!     Ok(json!({ "tenant": tenant, "topic": message.topic }))
//! }));
//! ```

// Core modules
mod context;
mod error;
mod handler;

// Interceptor
mod interceptor;
mod metrics;


// Re-exports: Error types
pub use error::{ContextError, InterceptorError};

// Re-exports: Context
pub use context::TenantContext;

// Re-exports: Handler seam
pub use handler::{handler_fn, HandlerFn, InboundMessage, MessageHandler};

// Re-exports: Interceptor
pub use interceptor::{
    create_tenant_aware_handler, MessageShardInterceptor, ShardAwareHandler, ShardRoute,
    TenantAwareHandler, TenantShardBinding, CORRELATION_HEADER, TOPIC_METADATA_KEY,
    UNRESOLVED_SHARD,
};
pub use metrics::InterceptorMetricsSnapshot;
