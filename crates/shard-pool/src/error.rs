//! Error types for pools and the sharded pool manager

use shard_router_core::RouterError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a connection pool backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Could not reach the database or the connection broke
    #[error("Connection error: {0}")]
    Connection(String),

    /// The statement itself failed
    #[error("Query error: {0}")]
    Query(String),

    /// Acquire or query did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Pool has been closed
    #[error("Pool is closed")]
    Closed,

    /// Pool could not be created from its configuration
    #[error("Pool creation failed: {0}")]
    Creation(String),
}

impl PoolError {
    /// Whether this error says something about the shard's reachability
    /// (as opposed to a bad statement)
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            PoolError::Connection(_) | PoolError::Timeout(_) | PoolError::Closed
        )
    }
}

/// Errors raised by the sharded pool manager
#[derive(Debug, Error)]
pub enum ShardError {
    /// Tenant cannot be routed (no shards, empty tenant id)
    #[error(transparent)]
    Routing(#[from] RouterError),

    /// No pool registered under this shard id
    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    /// Strategy resolved to a shard the manager has no pool for
    #[error("Shard registry out of sync: strategy resolved tenant {tenant_id} to unknown shard {shard_id}")]
    RegistryOutOfSync { tenant_id: String, shard_id: String },

    /// Pool-level failure, attributed to a shard
    #[error("Shard {shard_id}: {source}")]
    Pool {
        shard_id: String,
        #[source]
        source: PoolError,
    },

    /// Error returned by a transaction body, passed through untouched
    #[error(transparent)]
    Handler(anyhow::Error),
}

impl ShardError {
    pub fn pool(shard_id: impl Into<String>, source: PoolError) -> Self {
        ShardError::Pool {
            shard_id: shard_id.into(),
            source,
        }
    }
}
