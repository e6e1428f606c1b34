//! In-memory pool backend
//!
//! Behaves like a real bounded pool (semaphore-limited connections,
//! acquisition timeout, lazy connection opening, release on drop) but keeps
//! no data: statements are logged and answered from scripted responses.
//! Failures, latency and background errors can be injected, which is what
//! the test suites and the gateway's dry-run mode rely on.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use shard_core::PoolConfig;
use shard_types::{ShardId, ShardInfo};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::PoolError;
use crate::pool::{
    ConnectionPool, PoolConnection, PoolErrorHandler, PoolFactory, PoolStats, QueryResult, Row,
};

#[derive(Debug)]
struct MemoryState {
    healthy: bool,
    closed: bool,
    fail_close: bool,
    close_attempts: usize,
    latency: Option<Duration>,
    opened: usize,
    in_use: usize,
    statements: Vec<String>,
    responses: HashMap<String, Vec<Row>>,
    failing_statements: HashMap<String, String>,
}

/// Bounded in-memory connection pool for one shard
pub struct MemoryPool {
    shard_id: ShardId,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    state: Arc<Mutex<MemoryState>>,
    waiting: AtomicUsize,
    error_handlers: RwLock<Vec<PoolErrorHandler>>,
}

impl MemoryPool {
    pub fn new(shard_id: impl Into<ShardId>, config: PoolConfig) -> Self {
        let max = config.max_connections.max(1) as usize;
        let opened = (config.min_connections as usize).min(max);
        Self {
            shard_id: shard_id.into(),
            semaphore: Arc::new(Semaphore::new(max)),
            state: Arc::new(Mutex::new(MemoryState {
                healthy: true,
                closed: false,
                fail_close: false,
                close_attempts: 0,
                latency: None,
                opened,
                in_use: 0,
                statements: vec![],
                responses: HashMap::new(),
                failing_statements: HashMap::new(),
            })),
            config,
            waiting: AtomicUsize::new(0),
            error_handlers: RwLock::new(vec![]),
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Unhealthy pools refuse connections and fail in-flight statements
    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().healthy = healthy;
    }

    /// Delay applied to every statement
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Make `close()` fail
    pub fn set_fail_close(&self, fail: bool) {
        self.state.lock().fail_close = fail;
    }

    /// Answer `sql` with these rows
    pub fn respond_with(&self, sql: impl Into<String>, rows: Vec<Row>) {
        self.state.lock().responses.insert(sql.into(), rows);
    }

    /// Make `sql` fail with a statement-level error
    pub fn fail_statement(&self, sql: impl Into<String>, message: impl Into<String>) {
        self.state
            .lock()
            .failing_statements
            .insert(sql.into(), message.into());
    }

    /// Every statement executed so far, in order
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    pub fn statement_count(&self, sql: &str) -> usize {
        self.state
            .lock()
            .statements
            .iter()
            .filter(|s| s.as_str() == sql)
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn close_attempts(&self) -> usize {
        self.state.lock().close_attempts
    }

    /// Deliver a background error to the registered handlers
    pub fn emit_error(&self, error: PoolError) {
        debug!(shard_id = %self.shard_id, error = %error, "Memory pool emitting error");
        let handlers = self.error_handlers.read().clone();
        for handler in handlers {
            handler(&error);
        }
    }

    fn unavailable(&self, state: &MemoryState) -> Option<PoolError> {
        if state.closed {
            Some(PoolError::Closed)
        } else if !state.healthy {
            Some(PoolError::Connection(format!(
                "connection refused by {}",
                self.shard_id
            )))
        } else {
            None
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(permit);
        }

        self.waiting.fetch_add(1, Ordering::Relaxed);
        let acquired = tokio::time::timeout(
            self.config.connection_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await;
        self.waiting.fetch_sub(1, Ordering::Relaxed);

        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => Err(PoolError::Timeout(self.config.connection_timeout)),
        }
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, PoolError> {
        let mut conn = self.acquire().await?;
        conn.execute(sql, params).await
    }

    async fn acquire(&self) -> Result<Box<dyn PoolConnection>, PoolError> {
        if let Some(err) = self.unavailable(&self.state.lock()) {
            return Err(err);
        }

        let permit = self.acquire_permit().await?;

        let mut state = self.state.lock();
        if let Some(err) = self.unavailable(&state) {
            return Err(err);
        }
        if state.opened == state.in_use {
            state.opened += 1;
        }
        state.in_use += 1;

        Ok(Box::new(MemoryConnection {
            shard_id: self.shard_id.clone(),
            state: Arc::clone(&self.state),
            _permit: permit,
        }))
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            total: state.opened,
            idle: state.opened.saturating_sub(state.in_use),
            waiting: self.waiting.load(Ordering::Relaxed),
        }
    }

    fn on_error(&self, handler: PoolErrorHandler) {
        self.error_handlers.write().push(handler);
    }

    async fn close(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        state.close_attempts += 1;
        if state.fail_close {
            return Err(PoolError::Connection(format!(
                "failed to close pool for {}",
                self.shard_id
            )));
        }
        state.closed = true;
        state.opened = state.in_use;
        self.semaphore.close();
        Ok(())
    }
}

/// Connection handed out by [`MemoryPool`]
struct MemoryConnection {
    shard_id: ShardId,
    state: Arc<Mutex<MemoryState>>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl PoolConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<QueryResult, PoolError> {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if !state.healthy {
            return Err(PoolError::Connection(format!(
                "connection to {} lost",
                self.shard_id
            )));
        }
        if let Some(message) = state.failing_statements.get(sql) {
            return Err(PoolError::Query(message.clone()));
        }

        state.statements.push(sql.to_string());
        let rows = state.responses.get(sql).cloned().unwrap_or_default();
        Ok(QueryResult::new(rows))
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
    }
}

/// Factory producing [`MemoryPool`]s and keeping a handle to each
#[derive(Default)]
pub struct MemoryPoolFactory {
    pools: RwLock<HashMap<ShardId, Arc<MemoryPool>>>,
    unreachable: RwLock<HashSet<ShardId>>,
    failing_creation: RwLock<HashSet<ShardId>>,
}

impl MemoryPoolFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent pool created for a shard
    pub fn pool(&self, shard_id: &str) -> Option<Arc<MemoryPool>> {
        self.pools.read().get(shard_id).cloned()
    }

    /// Pools created for this shard from now on start unhealthy
    pub fn mark_unreachable(&self, shard_id: impl Into<ShardId>) {
        self.unreachable.write().insert(shard_id.into());
    }

    /// Pool creation for this shard fails
    pub fn fail_creation(&self, shard_id: impl Into<ShardId>) {
        self.failing_creation.write().insert(shard_id.into());
    }
}

impl PoolFactory for MemoryPoolFactory {
    fn create_pool(
        &self,
        shard: &ShardInfo,
        config: &PoolConfig,
    ) -> Result<Arc<dyn ConnectionPool>, PoolError> {
        if self.failing_creation.read().contains(&shard.shard_id) {
            return Err(PoolError::Creation(format!(
                "cannot build pool for {}",
                shard.connection_url
            )));
        }

        let pool = Arc::new(MemoryPool::new(shard.shard_id.clone(), config.clone()));
        if self.unreachable.read().contains(&shard.shard_id) {
            pool.set_healthy(false);
        }

        self.pools
            .write()
            .insert(shard.shard_id.clone(), Arc::clone(&pool));
        Ok(pool)
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
