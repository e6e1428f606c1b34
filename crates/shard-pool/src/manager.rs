//! Sharded pool manager
//!
//! Owns one [`ConnectionPool`] per shard and routes tenant-scoped queries and
//! transactions to the pool the [`ShardingStrategy`] picks.
//!
//! Registry and strategy are kept in step by ordering: a shard enters the
//! registry before the strategy can resolve to it, and leaves the strategy
//! before its pool is dropped from the registry.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use shard_core::{discover_shards_from_env, ManagerConfig};
use shard_router_core::{ModuloHashStrategy, RouterError, ShardResolver, ShardingStrategy};
use shard_types::{ShardHealth, ShardId, ShardInfo, ShardKeyResult, ShardStatus};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, ShardError};
use crate::metrics::{ManagerMetricsSnapshot, ShardCounters};
use crate::pool::{ConnectionPool, PoolConnection, PoolFactory, QueryResult};

/// Liveness probe statement
const HEALTH_CHECK_SQL: &str = "SELECT 1";

/// Longest SQL prefix included in log lines
const SQL_LOG_PREVIEW: usize = 200;

#[derive(Debug)]
struct HealthState {
    status: ShardHealth,
    last_health_check: Option<SystemTime>,
    last_error: Option<String>,
}

/// Health and counters for one shard.
///
/// Shared with the pool's error handler, which is why it lives apart from
/// the pool handle itself.
#[derive(Debug)]
struct ShardState {
    health: RwLock<HealthState>,
    counters: ShardCounters,
}

impl ShardState {
    fn new() -> Self {
        Self {
            health: RwLock::new(HealthState {
                status: ShardHealth::Initializing,
                last_health_check: None,
                last_error: None,
            }),
            counters: ShardCounters::default(),
        }
    }

    fn status(&self) -> ShardHealth {
        self.health.read().status
    }

    fn mark_unhealthy(&self, shard_id: &str, err: &PoolError) {
        let mut health = self.health.write();
        if health.status != ShardHealth::Unhealthy {
            warn!(shard_id = %shard_id, error = %err, "Shard marked unhealthy");
        }
        health.status = ShardHealth::Unhealthy;
        health.last_error = Some(err.to_string());
    }

    fn apply_probe(&self, shard_id: &str, result: Result<(), PoolError>) {
        let mut health = self.health.write();
        let previous = health.status;
        health.last_health_check = Some(SystemTime::now());

        match result {
            Ok(()) => {
                if previous == ShardHealth::Unhealthy {
                    info!(shard_id = %shard_id, "Shard recovered");
                }
                health.status = ShardHealth::Healthy;
                health.last_error = None;
            }
            Err(err) => {
                if previous != ShardHealth::Unhealthy {
                    warn!(shard_id = %shard_id, error = %err, "Shard health check failed");
                }
                health.status = ShardHealth::Unhealthy;
                health.last_error = Some(err.to_string());
            }
        }
    }
}

/// A shard's definition, live pool and state
struct ShardPool {
    info: ShardInfo,
    pool: Arc<dyn ConnectionPool>,
    state: Arc<ShardState>,
}

impl ShardPool {
    fn id(&self) -> &str {
        &self.info.shard_id
    }

    fn status(&self) -> ShardStatus {
        let stats = self.pool.stats();
        let health = self.state.health.read();
        ShardStatus {
            shard_id: self.info.shard_id.clone(),
            status: health.status,
            total_connections: stats.total,
            idle_connections: stats.idle,
            waiting_requests: stats.waiting,
            last_health_check: health.last_health_check,
            error: health.last_error.clone(),
        }
    }
}

/// Routes tenant operations to per-shard connection pools
pub struct ShardedPoolManager {
    config: ManagerConfig,
    factory: Arc<dyn PoolFactory>,
    strategy: Arc<dyn ShardingStrategy>,
    pools: RwLock<HashMap<ShardId, Arc<ShardPool>>>,
    initialized: AtomicBool,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ShardedPoolManager {
    /// Create with the modulo hash strategy configured from `config.strategy`
    pub fn new(config: ManagerConfig, factory: Arc<dyn PoolFactory>) -> Self {
        let strategy = Arc::new(ModuloHashStrategy::with_config(config.strategy.clone()));
        Self::with_strategy(config, factory, strategy)
    }

    /// Create with a custom strategy
    pub fn with_strategy(
        config: ManagerConfig,
        factory: Arc<dyn PoolFactory>,
        strategy: Arc<dyn ShardingStrategy>,
    ) -> Self {
        Self {
            config,
            factory,
            strategy,
            pools: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            health_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn strategy(&self) -> &Arc<dyn ShardingStrategy> {
        &self.strategy
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Register the given shards, or the ones discovered from `SHARD_<n>_*`
    /// environment variables when `shards` is `None`, then start health
    /// checks if enabled.
    ///
    /// A second call is a logged no-op. An empty shard set is allowed: the
    /// manager runs degraded and every routing call fails until a shard is
    /// added.
    pub async fn initialize(self: &Arc<Self>, shards: Option<Vec<ShardInfo>>) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            info!("Sharded pool manager already initialized, skipping");
            return;
        }

        let shards = shards.unwrap_or_else(discover_shards_from_env);
        if shards.is_empty() {
            warn!("No shards configured, sharded pool manager running in degraded mode");
        }

        for shard in shards {
            let shard_id = shard.shard_id.clone();
            if let Err(err) = self.add_shard(shard).await {
                error!(shard_id = %shard_id, error = %err, "Failed to add shard during initialization");
            }
        }

        if self.config.health_check.enabled {
            self.start_health_checks();
        }

        info!(
            shards = self.shard_count(),
            healthy = self.healthy_shard_count(),
            factory = self.factory.name(),
            strategy = self.strategy.name(),
            "Sharded pool manager initialized"
        );
    }

    /// Create a pool for the shard, register it, and probe it once.
    ///
    /// Returns `Ok(false)` (with a warning) when the shard id is already
    /// registered; errors only when the pool cannot be created.
    pub async fn add_shard(&self, info: ShardInfo) -> Result<bool, ShardError> {
        if self.pools.read().contains_key(&info.shard_id) {
            warn!(shard_id = %info.shard_id, "Shard already registered, ignoring duplicate");
            return Ok(false);
        }

        let pool_config = self.config.pool_for(&info.shard_id);
        let pool = self
            .factory
            .create_pool(&info, &pool_config)
            .map_err(|err| ShardError::pool(info.shard_id.clone(), err))?;

        let state = Arc::new(ShardState::new());
        let handler_state = Arc::clone(&state);
        let handler_shard = info.shard_id.clone();
        pool.on_error(Arc::new(move |err: &PoolError| {
            handler_state.counters.record_error();
            handler_state.mark_unhealthy(&handler_shard, err);
        }));

        let shard = Arc::new(ShardPool {
            info: info.clone(),
            pool,
            state,
        });

        let inserted = {
            let mut pools = self.pools.write();
            if pools.contains_key(&info.shard_id) {
                false
            } else {
                pools.insert(info.shard_id.clone(), Arc::clone(&shard));
                true
            }
        };
        if !inserted {
            warn!(shard_id = %info.shard_id, "Shard registered concurrently, discarding new pool");
            if let Err(err) = shard.pool.close().await {
                warn!(shard_id = %info.shard_id, error = %err, "Failed to close discarded pool");
            }
            return Ok(false);
        }

        self.strategy.add_shard(info);

        let probe = self.probe(&shard).await;
        shard.state.apply_probe(shard.id(), probe);

        info!(
            shard_id = %shard.id(),
            status = %shard.state.status(),
            region = ?shard.info.region,
            read_only = shard.info.read_only,
            max_connections = pool_config.max_connections,
            "Shard added"
        );
        Ok(true)
    }

    /// Stop routing to a shard and close its pool; `false` if unknown
    pub async fn remove_shard(&self, shard_id: &str) -> bool {
        if !self.pools.read().contains_key(shard_id) {
            return false;
        }

        self.strategy.remove_shard(shard_id);
        let Some(shard) = self.pools.write().remove(shard_id) else {
            return false;
        };

        if let Err(err) = shard.pool.close().await {
            warn!(shard_id = %shard_id, error = %err, "Failed to close pool for removed shard");
        }
        info!(shard_id = %shard_id, remaining = self.shard_count(), "Shard removed");
        true
    }

    /// Resolve a tenant to its shard; fails when the tenant cannot be routed
    pub fn get_shard_for_tenant(&self, tenant_id: &str) -> Result<ShardKeyResult, ShardError> {
        Ok(self.resolve(tenant_id)?)
    }

    /// Live pool for a tenant's shard
    pub fn get_pool_for_tenant(&self, tenant_id: &str) -> Result<Arc<dyn ConnectionPool>, ShardError> {
        let shard = self.route(tenant_id)?;
        Ok(Arc::clone(&shard.pool))
    }

    pub fn get_pool_by_shard_id(&self, shard_id: &str) -> Result<Arc<dyn ConnectionPool>, ShardError> {
        self.pools
            .read()
            .get(shard_id)
            .map(|shard| Arc::clone(&shard.pool))
            .ok_or_else(|| ShardError::ShardNotFound(shard_id.to_string()))
    }

    pub fn get_shard_info(&self, shard_id: &str) -> Option<ShardInfo> {
        self.pools.read().get(shard_id).map(|shard| shard.info.clone())
    }

    /// Registered shard ids, sorted
    pub fn get_shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.pools.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn shard_count(&self) -> usize {
        self.pools.read().len()
    }

    pub fn healthy_shard_count(&self) -> usize {
        self.pools
            .read()
            .values()
            .filter(|shard| shard.state.status() == ShardHealth::Healthy)
            .count()
    }

    /// Run one statement on the tenant's shard
    pub async fn query_for_tenant(
        &self,
        tenant_id: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult, ShardError> {
        let shard = self.route(tenant_id)?;

        let started = Instant::now();
        let result = self.with_query_timeout(shard.pool.query(sql, params)).await;
        self.record_timing(tenant_id, &shard, sql, started.elapsed());

        result.map_err(|err| self.record_failure(tenant_id, &shard, err))
    }

    /// Run `handler` inside `BEGIN`/`COMMIT` on one connection of the
    /// tenant's shard.
    ///
    /// Any handler error triggers `ROLLBACK` and is returned unchanged as
    /// [`ShardError::Handler`]. A connectivity [`PoolError`] anywhere in the
    /// handler's error chain marks the shard unhealthy, as it would for
    /// [`query_for_tenant`](Self::query_for_tenant). The connection goes back
    /// to the pool on every path; if this future is dropped mid-transaction
    /// the rollback is issued on a spawned task first.
    ///
    /// ```rust,ignore
    /// manager.transaction_for_tenant("tenant-alpha", |conn| Box::pin(async move {
    ///     conn.execute("INSERT INTO views VALUES ($1)", &[json!("grid")]).await?;
    ///     Ok(())
    /// })).await?;
    /// ```
    pub async fn transaction_for_tenant<T, F>(&self, tenant_id: &str, handler: F) -> Result<T, ShardError>
    where
        F: for<'c> FnOnce(&'c mut Box<dyn PoolConnection>) -> BoxFuture<'c, anyhow::Result<T>>,
    {
        let shard = self.route(tenant_id)?;
        let started = Instant::now();

        let conn = shard
            .pool
            .acquire()
            .await
            .map_err(|err| self.record_failure(tenant_id, &shard, err))?;
        let mut tx = OpenTransaction::new(shard.id(), conn);

        if let Err(err) = tx.conn.execute("BEGIN", &[]).await {
            tx.open = false;
            return Err(self.record_failure(tenant_id, &shard, err));
        }

        let result = match handler(&mut tx.conn).await {
            Ok(value) => {
                let committed = tx.conn.execute("COMMIT", &[]).await;
                tx.open = false;
                match committed {
                    Ok(_) => Ok(value),
                    Err(err) => Err(self.record_failure(tenant_id, &shard, err)),
                }
            }
            Err(err) => {
                let rolled_back = tx.conn.execute("ROLLBACK", &[]).await;
                tx.open = false;
                if let Err(rollback_err) = rolled_back {
                    warn!(
                        shard_id = %shard.id(),
                        tenant_id = %tenant_id,
                        error = %rollback_err,
                        "Rollback failed"
                    );
                    if rollback_err.is_connectivity() {
                        shard.state.mark_unhealthy(shard.id(), &rollback_err);
                    }
                }
                if let Some(pool_err) = connectivity_cause(&err) {
                    shard.state.mark_unhealthy(shard.id(), pool_err);
                }

                shard.state.counters.record_error();
                error!(
                    shard_id = %shard.id(),
                    tenant_id = %tenant_id,
                    error = %err,
                    "Transaction rolled back"
                );
                Err(ShardError::Handler(err))
            }
        };
        drop(tx);

        self.record_timing(tenant_id, &shard, "TRANSACTION", started.elapsed());
        result
    }

    /// Probe every shard once, concurrently.
    ///
    /// Each probe is isolated: a failing or hanging shard only affects its
    /// own status.
    pub async fn run_health_checks(&self) {
        let shards: Vec<Arc<ShardPool>> = self.pools.read().values().cloned().collect();

        join_all(shards.iter().map(|shard| async move {
            let result = self.probe(shard).await;
            shard.state.apply_probe(shard.id(), result);
        }))
        .await;

        debug!(
            shards = shards.len(),
            healthy = self.healthy_shard_count(),
            "Health check pass complete"
        );
    }

    /// Spawn the periodic health check task.
    ///
    /// The task only holds a weak reference and stops once the manager is
    /// dropped or closed. Calling this twice has no effect.
    pub fn start_health_checks(self: &Arc<Self>) {
        let mut slot = self.health_task.lock();
        if slot.is_some() {
            return;
        }

        let manager = Arc::downgrade(self);
        let period = self.config.health_check.interval.max(Duration::from_millis(1));

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; shards were just probed on add
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.run_health_checks().await;
            }
            debug!("Health check task stopped");
        }));

        debug!(interval_ms = period.as_millis() as u64, "Health checks started");
    }

    /// Per-shard status snapshots, ordered by shard id
    pub fn get_shard_statuses(&self) -> Vec<ShardStatus> {
        let mut statuses: Vec<ShardStatus> =
            self.pools.read().values().map(|shard| shard.status()).collect();
        statuses.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        statuses
    }

    pub fn get_metrics_snapshot(&self) -> ManagerMetricsSnapshot {
        let pools = self.pools.read();
        let mut snapshot = ManagerMetricsSnapshot {
            total_shards: pools.len(),
            ..ManagerMetricsSnapshot::default()
        };

        for shard in pools.values() {
            match shard.state.status() {
                ShardHealth::Healthy => snapshot.healthy_shards += 1,
                ShardHealth::Unhealthy => snapshot.unhealthy_shards += 1,
                ShardHealth::Initializing => snapshot.initializing_shards += 1,
            }
            snapshot.shards.push(shard.state.counters.snapshot(shard.id()));
        }
        snapshot.shards.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        snapshot
    }

    /// Stop health checks and close every pool.
    ///
    /// Close failures are logged and do not stop the remaining pools from
    /// being closed. The registry is empty afterwards.
    pub async fn close(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }

        for shard_id in self.get_shard_ids() {
            self.strategy.remove_shard(&shard_id);
        }
        let shards: Vec<Arc<ShardPool>> = self.pools.write().drain().map(|(_, shard)| shard).collect();

        let results = join_all(shards.iter().map(|shard| shard.pool.close())).await;

        let mut failures = 0;
        for (shard, result) in shards.iter().zip(results) {
            if let Err(err) = result {
                failures += 1;
                warn!(shard_id = %shard.id(), error = %err, "Failed to close shard pool");
            }
        }

        self.initialized.store(false, Ordering::SeqCst);
        info!(closed = shards.len(), failures = failures, "Sharded pool manager closed");
    }

    fn resolve(&self, tenant_id: &str) -> Result<ShardKeyResult, RouterError> {
        if tenant_id.is_empty() {
            return Err(RouterError::InvalidTenantId);
        }
        if !self.strategy.can_handle(tenant_id) {
            return Err(RouterError::NoShardsAvailable {
                tenant_id: tenant_id.to_string(),
            });
        }
        Ok(self.strategy.get_shard_key(tenant_id))
    }

    /// Resolve and look up the shard's pool, noting routes to unhealthy shards
    fn route(&self, tenant_id: &str) -> Result<Arc<ShardPool>, ShardError> {
        let key = self.resolve(tenant_id)?;

        let Some(shard) = self.pools.read().get(&key.shard_id).cloned() else {
            error!(
                tenant_id = %tenant_id,
                shard_id = %key.shard_id,
                "Strategy resolved to a shard with no pool"
            );
            return Err(ShardError::RegistryOutOfSync {
                tenant_id: tenant_id.to_string(),
                shard_id: key.shard_id,
            });
        };

        if shard.state.status() == ShardHealth::Unhealthy {
            shard.state.counters.record_unhealthy_route();
            warn!(tenant_id = %tenant_id, shard_id = %shard.id(), "Routing to unhealthy shard");
        }
        Ok(shard)
    }

    async fn probe(&self, shard: &ShardPool) -> Result<(), PoolError> {
        let limit = self.config.pool_for(shard.id()).connection_timeout;
        match tokio::time::timeout(limit, shard.pool.query(HEALTH_CHECK_SQL, &[])).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PoolError::Timeout(limit)),
        }
    }

    async fn with_query_timeout<T>(
        &self,
        operation: impl Future<Output = Result<T, PoolError>>,
    ) -> Result<T, PoolError> {
        match self.config.pool.query_timeout {
            Some(limit) => tokio::time::timeout(limit, operation)
                .await
                .unwrap_or_else(|_| Err(PoolError::Timeout(limit))),
            None => operation.await,
        }
    }

    fn record_timing(&self, tenant_id: &str, shard: &ShardPool, sql: &str, elapsed: Duration) {
        shard.state.counters.record_query(elapsed);

        if elapsed >= self.config.pool.slow_query_threshold {
            shard.state.counters.record_slow_query();
            warn!(
                shard_id = %shard.id(),
                tenant_id = %tenant_id,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.config.pool.slow_query_threshold.as_millis() as u64,
                sql = %sql_preview(sql),
                "Slow query"
            );
        }
    }

    fn record_failure(&self, tenant_id: &str, shard: &ShardPool, err: PoolError) -> ShardError {
        shard.state.counters.record_error();
        if err.is_connectivity() {
            shard.state.mark_unhealthy(shard.id(), &err);
        }
        error!(
            shard_id = %shard.id(),
            tenant_id = %tenant_id,
            error = %err,
            "Shard operation failed"
        );
        ShardError::pool(shard.id(), err)
    }
}

impl ShardResolver for ShardedPoolManager {
    fn resolve_shard(&self, tenant_id: &str) -> Result<ShardKeyResult, RouterError> {
        self.resolve(tenant_id)
    }

    fn healthy_shard_count(&self) -> usize {
        ShardedPoolManager::healthy_shard_count(self)
    }
}

impl Drop for ShardedPoolManager {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Connection with a transaction open on it.
///
/// Dropped while `open` (the caller's future was cancelled, or the handler
/// panicked) it rolls back on a spawned task, then releases the connection.
struct OpenTransaction {
    shard_id: ShardId,
    conn: Box<dyn PoolConnection>,
    open: bool,
}

impl OpenTransaction {
    fn new(shard_id: &str, conn: Box<dyn PoolConnection>) -> Self {
        Self {
            shard_id: shard_id.to_string(),
            conn,
            open: true,
        }
    }
}

impl Drop for OpenTransaction {
    fn drop(&mut self) {
        if !self.open {
            return;
        }

        let shard_id = std::mem::take(&mut self.shard_id);
        let mut conn = std::mem::replace(&mut self.conn, Box::new(Released));
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(shard_id = %shard_id, "Transaction abandoned, rolling back");
                runtime.spawn(async move {
                    if let Err(err) = conn.execute("ROLLBACK", &[]).await {
                        warn!(shard_id = %shard_id, error = %err, "Rollback of abandoned transaction failed");
                    }
                });
            }
            Err(_) => {
                error!(shard_id = %shard_id, "Transaction abandoned outside a runtime, connection released without rollback");
            }
        }
    }
}

/// Stand-in left behind once a transaction's connection has been handed off
struct Released;

#[async_trait]
impl PoolConnection for Released {
    async fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<QueryResult, PoolError> {
        Err(PoolError::Closed)
    }
}

/// First connectivity [`PoolError`] in a handler's error chain.
///
/// The search stops at a nested [`ShardError`]: the manager already
/// attributed that failure to whichever shard raised it.
fn connectivity_cause(err: &anyhow::Error) -> Option<&PoolError> {
    err.chain()
        .take_while(|cause| !cause.is::<ShardError>())
        .filter_map(|cause| cause.downcast_ref::<PoolError>())
        .find(|pool_err| pool_err.is_connectivity())
}

fn sql_preview(sql: &str) -> String {
    if sql.chars().count() <= SQL_LOG_PREVIEW {
        sql.to_string()
    } else {
        let mut preview: String = sql.chars().take(SQL_LOG_PREVIEW).collect();
        preview.push_str("...");
        preview
    }
}
