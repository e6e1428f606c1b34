//! Connection pool backend seam
//!
//! The manager never talks to a database driver directly. A [`PoolFactory`]
//! turns a shard definition plus merged [`PoolConfig`] into a
//! [`ConnectionPool`]; the manager only needs query/acquire/stats/close and
//! an error callback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shard_core::PoolConfig;
use shard_types::ShardInfo;
use std::sync::Arc;

use crate::error::PoolError;

/// One result row, column name -> value
pub type Row = serde_json::Map<String, Value>;

/// Rows returned by a statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub row_count: usize,
}

impl QueryResult {
    pub fn new(rows: Vec<Row>) -> Self {
        let row_count = rows.len();
        Self { rows, row_count }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Live pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Connections open (idle + in use)
    pub total: usize,
    /// Connections open and not checked out
    pub idle: usize,
    /// Callers waiting for a connection
    pub waiting: usize,
}

/// Callback invoked when the pool observes an error outside of a query
/// (for example a dropped idle connection)
pub type PoolErrorHandler = Arc<dyn Fn(&PoolError) + Send + Sync>;

/// A checked-out connection.
///
/// Dropping it returns the connection to its pool, so release happens on
/// every exit path, including errors and panics.
#[async_trait]
pub trait PoolConnection: Send {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, PoolError>;
}

/// A bounded pool of connections to one shard
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Run one statement on any free connection
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, PoolError>;

    /// Check out a connection, waiting up to the configured connection timeout
    async fn acquire(&self) -> Result<Box<dyn PoolConnection>, PoolError>;

    fn stats(&self) -> PoolStats;

    /// Register a handler for background pool errors
    fn on_error(&self, handler: PoolErrorHandler);

    /// Close every connection; later calls fail with [`PoolError::Closed`]
    async fn close(&self) -> Result<(), PoolError>;
}

/// Builds pools for shards
pub trait PoolFactory: Send + Sync {
    fn create_pool(
        &self,
        shard: &ShardInfo,
        config: &PoolConfig,
    ) -> Result<Arc<dyn ConnectionPool>, PoolError>;

    /// Factory name for logging
    fn name(&self) -> &'static str;
}
