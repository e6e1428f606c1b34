//! Shard Core - shared library for the routing, pool and context crates
//!
//! Provides the strongly-typed configuration surface (including the
//! `SHARD_<n>_*` discovery adapter) and the latency histogram behind every
//! metrics snapshot.

pub mod config;
pub mod metrics;

pub use config::{
    discover_shards, discover_shards_from_env, HealthCheckConfig, InterceptorConfig,
    ManagerConfig, PoolConfig, PoolOverrides, StrategyConfig, DEFAULT_EXCLUDED_TOPICS, DEFAULT_SHARD_ID,
    DEFAULT_TENANT_HEADER,
};
pub use metrics::{HistogramSnapshot, LatencyHistogram};
