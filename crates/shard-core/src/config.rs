//! Configuration module for shard routing
//!
//! Every struct has a `Default` matching production defaults and a
//! `from_env()` constructor. The `from_lookup` variants take the variable
//! source as a closure so the environment adapter stays at the boundary and
//! tests never touch process state.

use serde::{Deserialize, Serialize};
use shard_types::{ShardId, ShardInfo};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Header carrying the tenant id when none is configured
pub const DEFAULT_TENANT_HEADER: &str = "x-tenant-id";

/// Topics that never carry tenant data (replies, system and health traffic)
pub const DEFAULT_EXCLUDED_TOPICS: &[&str] = &["reply.*", "system.*", "health.*"];

/// Shard id used for resolution results when no shard is registered
pub const DEFAULT_SHARD_ID: &str = "default";

/// Concrete pool settings for one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on open connections
    pub max_connections: u32,

    /// Connections kept open even when idle
    pub min_connections: u32,

    /// Idle connections older than this are closed
    pub idle_timeout: Duration,

    /// Maximum wait when acquiring a connection
    pub connection_timeout: Duration,

    /// Per-query timeout (none = rely on the pool)
    pub query_timeout: Option<Duration>,

    /// Queries at or above this duration are logged and counted as slow
    pub slow_query_threshold: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            idle_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            query_timeout: None,
            slow_query_threshold: Duration::from_millis(500),
        }
    }
}

impl PoolConfig {
    /// Load pool defaults from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let mut config = PoolConfig::default();

        if let Some(max) = parse_var(lookup, "SHARD_POOL_MAX") {
            config.max_connections = max;
        }
        if let Some(min) = parse_var(lookup, "SHARD_POOL_MIN") {
            config.min_connections = min;
        }
        if let Some(idle) = parse_millis(lookup, "SHARD_POOL_IDLE_TIMEOUT_MS") {
            config.idle_timeout = idle;
        }
        if let Some(timeout) = parse_millis(lookup, "SHARD_POOL_CONNECTION_TIMEOUT_MS") {
            config.connection_timeout = timeout;
        }
        if let Some(timeout) = parse_millis(lookup, "SHARD_QUERY_TIMEOUT_MS") {
            config.query_timeout = Some(timeout);
        }
        if let Some(slow) = parse_millis(lookup, "SHARD_SLOW_QUERY_MS") {
            config.slow_query_threshold = slow;
        }

        config
    }

    /// Apply per-shard overrides on top of these defaults
    pub fn merged(&self, overrides: Option<&PoolOverrides>) -> PoolConfig {
        let mut merged = self.clone();
        if let Some(overrides) = overrides {
            if let Some(max) = overrides.max_connections {
                merged.max_connections = max;
            }
            if let Some(min) = overrides.min_connections {
                merged.min_connections = min;
            }
            if let Some(idle) = overrides.idle_timeout {
                merged.idle_timeout = idle;
            }
            if let Some(timeout) = overrides.connection_timeout {
                merged.connection_timeout = timeout;
            }
        }
        if merged.min_connections > merged.max_connections {
            merged.min_connections = merged.max_connections;
        }
        merged
    }
}

/// Per-shard pool settings; unset fields fall back to [`PoolConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOverrides {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub idle_timeout: Option<Duration>,
    pub connection_timeout: Option<Duration>,
}

impl PoolOverrides {
    fn is_empty(&self) -> bool {
        self == &PoolOverrides::default()
    }
}

/// Periodic shard probing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

/// Tenant -> shard mapping settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Seed for the tenant hash
    pub hash_seed: u32,

    /// Cache resolution results per tenant
    pub enable_cache: bool,

    /// The cache is cleared outright once it reaches this many entries
    pub max_cache_size: usize,

    /// Reported shard id while no shard is registered
    pub default_shard_id: ShardId,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            hash_seed: 0,
            enable_cache: true,
            max_cache_size: 10_000,
            default_shard_id: DEFAULT_SHARD_ID.to_string(),
        }
    }
}

/// Sharded pool manager configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Defaults for every shard's pool
    pub pool: PoolConfig,

    pub health_check: HealthCheckConfig,

    pub strategy: StrategyConfig,

    /// Pool overrides keyed by shard id
    pub shard_overrides: HashMap<ShardId, PoolOverrides>,
}

impl ManagerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let mut config = ManagerConfig {
            pool: PoolConfig::from_lookup(lookup),
            ..ManagerConfig::default()
        };

        // Health checks
        if let Some(enabled) = parse_bool(lookup, "SHARD_HEALTH_CHECK_ENABLED") {
            config.health_check.enabled = enabled;
        }
        if let Some(interval) = parse_millis(lookup, "SHARD_HEALTH_CHECK_INTERVAL_MS") {
            config.health_check.interval = interval;
        }

        // Strategy
        if let Some(seed) = parse_var(lookup, "SHARD_HASH_SEED") {
            config.strategy.hash_seed = seed;
        }
        if let Some(enabled) = parse_bool(lookup, "SHARD_CACHE_ENABLED") {
            config.strategy.enable_cache = enabled;
        }

        // Per-shard overrides, same numbering as discovery
        let mut n = 0;
        while lookup(&format!("SHARD_{n}_URL")).is_some() {
            let overrides = PoolOverrides {
                max_connections: parse_var(lookup, &format!("SHARD_{n}_POOL_MAX")),
                min_connections: parse_var(lookup, &format!("SHARD_{n}_POOL_MIN")),
                ..PoolOverrides::default()
            };
            if !overrides.is_empty() {
                config.shard_overrides.insert(format!("shard-{n}"), overrides);
            }
            n += 1;
        }

        config
    }

    /// Merged pool settings for one shard
    pub fn pool_for(&self, shard_id: &str) -> PoolConfig {
        self.pool.merged(self.shard_overrides.get(shard_id))
    }
}

/// Message interceptor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptorConfig {
    /// Header carrying the tenant id (matched case-insensitively)
    pub tenant_header_name: String,

    /// Reject tenant-less messages instead of running them uncontextualized
    pub require_tenant: bool,

    /// Extra exclusions on top of [`DEFAULT_EXCLUDED_TOPICS`]; exact or `prefix*`
    pub exclude_topics: Vec<String>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            tenant_header_name: DEFAULT_TENANT_HEADER.to_string(),
            require_tenant: false,
            exclude_topics: vec![],
        }
    }
}

impl InterceptorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let mut config = InterceptorConfig::default();

        if let Some(header) = lookup("TENANT_HEADER_NAME") {
            let header = header.trim();
            if !header.is_empty() {
                config.tenant_header_name = header.to_string();
            }
        }
        if let Some(required) = parse_bool(lookup, "TENANT_REQUIRED") {
            config.require_tenant = required;
        }
        if let Some(topics) = lookup("TENANT_EXCLUDE_TOPICS") {
            config.exclude_topics = topics
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config
    }

    /// Built-in exclusions followed by the configured ones
    pub fn excluded_topics(&self) -> Vec<String> {
        DEFAULT_EXCLUDED_TOPICS
            .iter()
            .map(|s| s.to_string())
            .chain(self.exclude_topics.iter().cloned())
            .collect()
    }
}

/// Discover shard definitions from the process environment
pub fn discover_shards_from_env() -> Vec<ShardInfo> {
    discover_shards(&env_lookup)
}

/// Read `SHARD_<n>_URL` (plus optional `_REGION`, `_READONLY`, `_WEIGHT`)
/// for n = 0, 1, 2, ... until the first missing URL.
pub fn discover_shards(lookup: &dyn Fn(&str) -> Option<String>) -> Vec<ShardInfo> {
    let mut shards = Vec::new();
    let mut n = 0;

    while let Some(url) = lookup(&format!("SHARD_{n}_URL")) {
        let mut info = ShardInfo::new(format!("shard-{n}"), url.trim());
        info.region = lookup(&format!("SHARD_{n}_REGION"))
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        info.read_only = parse_bool(lookup, &format!("SHARD_{n}_READONLY")).unwrap_or(false);
        info.weight = parse_var(lookup, &format!("SHARD_{n}_WEIGHT"));
        shards.push(info);
        n += 1;
    }

    shards
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_var<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = %key, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}

fn parse_millis(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    parse_var::<u64>(lookup, key).map(Duration::from_millis)
}

fn parse_bool(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key = %key, value = %raw, "Ignoring unparseable boolean value");
            None
        }
    }
}
