//! Shard Pool - one connection pool per shard, routed by tenant
//!
//! # Architecture
//!
//! ```text
//! query_for_tenant("tenant-alpha", sql, params)
//!     │
//!     ▼
//! ┌─────────────────────────┐
//! │   ShardingStrategy      │  tenant → shard id
//! └───────────┬─────────────┘
//!             │
//!             ▼
//! ┌─────────────────────────┐
//! │   ShardedPoolManager    │  shard id → ShardPool (pool + health + counters)
//! └───────────┬─────────────┘
//!             │
//!             ▼
//! ┌─────────────────────────┐
//! │   ConnectionPool        │  backend supplied by a PoolFactory
//! └─────────────────────────┘
//! ```
//!
//! Backends: [`MemoryPool`] for tests and dry runs, and a sqlx `PgPool`
//! per shard behind the `postgres` feature.
//!
//! A tenant's data lives on exactly one shard, so there is no failover:
//! an unhealthy shard still receives its tenants' traffic, and the routing
//! is logged and counted.

// Core modules
mod error;
pub mod pool;
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

// Manager
mod manager;
mod metrics;

#[cfg(test)]
mod tests;

// Re-exports: Error types
pub use error::{PoolError, ShardError};

// Re-exports: Pool backend seam
pub use pool::{
    ConnectionPool, PoolConnection, PoolErrorHandler, PoolFactory, PoolStats, QueryResult, Row,
};
pub use memory::{MemoryPool, MemoryPoolFactory};

#[cfg(feature = "postgres")]
pub use postgres::{PgConnectionPool, PgPoolFactory};

// Re-exports: Manager
pub use manager::ShardedPoolManager;
pub use metrics::{ManagerMetricsSnapshot, ShardMetricsSnapshot};
