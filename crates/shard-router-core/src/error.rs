//! Error types for the router core

use thiserror::Error;

/// Router error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// No shard is registered
    #[error("No shards available to route tenant {tenant_id}")]
    NoShardsAvailable { tenant_id: String },

    /// Tenant id is empty
    #[error("Invalid tenant id: tenant id must be a non-empty string")]
    InvalidTenantId,
}
