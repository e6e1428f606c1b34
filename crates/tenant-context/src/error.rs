//! Error types for the tenant context and interceptor

use shard_types::TenantId;
use thiserror::Error;

/// Raised when code that needs a tenant binding runs without one
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("No tenant context is active; run this inside TenantContext::run or run_async")]
    MissingContext,

    #[error("Tenant {tenant_id} has no shard binding; is a pool manager attached?")]
    MissingShard { tenant_id: TenantId },
}

/// Raised per message by the interceptor and tenant-aware handlers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterceptorError {
    #[error("Missing required tenant header '{header}' on message topic '{topic}'")]
    MissingTenant { header: String, topic: String },

    #[error("Tenant context unavailable: handler invoked outside a resolved tenant scope")]
    TenantContextUnavailable,
}
