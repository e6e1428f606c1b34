//! PostgreSQL pool backend on sqlx
//!
//! Each shard gets its own [`PgPool`], sized and timed from the shard's
//! merged [`PoolConfig`]. Pools connect lazily: an unreachable shard is still
//! created and registered, and its first health probe reports it.
//!
//! Parameters bind from JSON (`null`, bool, integer, float, string; arrays
//! and objects as `jsonb`). Result columns decode to JSON for the bool,
//! integer, float, text and json types; anything else comes back as `null`
//! and should be cast in SQL (`created_at::text`).

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde_json::{Number, Value};
use shard_core::PoolConfig;
use shard_types::{ShardId, ShardInfo};
use sqlx::pool::PoolConnection as SqlxConnection;
use sqlx::postgres::{
    PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgQueryResult, PgRow,
};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Column, Either, Postgres, Row as _, TypeInfo, ValueRef};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::PoolError;
use crate::pool::{
    ConnectionPool, PoolConnection, PoolErrorHandler, PoolFactory, PoolStats, QueryResult, Row,
};

/// sqlx pool options for one shard
pub fn pool_options(config: &PoolConfig) -> PgPoolOptions {
    let max = config.max_connections.max(1);
    PgPoolOptions::new()
        .max_connections(max)
        .min_connections(config.min_connections.min(max))
        .idle_timeout(config.idle_timeout)
        .acquire_timeout(config.connection_timeout)
}

/// Connection pool for one PostgreSQL shard
pub struct PgConnectionPool {
    shard_id: ShardId,
    pool: PgPool,
    acquire_timeout: Duration,
}

impl PgConnectionPool {
    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Underlying sqlx pool
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionPool for PgConnectionPool {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, PoolError> {
        collect(bind_params(sql, params).fetch_many(&self.pool))
            .await
            .map_err(|err| map_error(&err, self.acquire_timeout))
    }

    async fn acquire(&self) -> Result<Box<dyn PoolConnection>, PoolError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| map_error(&err, self.acquire_timeout))?;
        Ok(Box::new(PgPooledConnection {
            conn,
            acquire_timeout: self.acquire_timeout,
        }))
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.pool.size() as usize,
            idle: self.pool.num_idle(),
            waiting: 0,
        }
    }

    fn on_error(&self, _handler: PoolErrorHandler) {
        // sqlx reports a broken connection on the call that hit it, and the
        // manager records it there; there is no background error stream.
        debug!(shard_id = %self.shard_id, "Postgres pool has no background error events");
    }

    async fn close(&self) -> Result<(), PoolError> {
        self.pool.close().await;
        Ok(())
    }
}

struct PgPooledConnection {
    conn: SqlxConnection<Postgres>,
    acquire_timeout: Duration,
}

#[async_trait]
impl PoolConnection for PgPooledConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, PoolError> {
        collect(bind_params(sql, params).fetch_many(&mut *self.conn))
            .await
            .map_err(|err| map_error(&err, self.acquire_timeout))
    }
}

/// Factory for `postgres://` and `postgresql://` shards
#[derive(Debug, Clone, Copy, Default)]
pub struct PgPoolFactory;

impl PgPoolFactory {
    pub fn new() -> Self {
        Self
    }
}

impl PoolFactory for PgPoolFactory {
    fn create_pool(
        &self,
        shard: &ShardInfo,
        config: &PoolConfig,
    ) -> Result<Arc<dyn ConnectionPool>, PoolError> {
        let options: PgConnectOptions = shard.connection_url.parse().map_err(|err| {
            PoolError::Creation(format!("invalid connection url for {}: {}", shard.shard_id, err))
        })?;

        // sqlx spawns its pool maintenance task on creation
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PoolError::Creation(format!(
                "pool for {} must be created inside a tokio runtime",
                shard.shard_id
            )));
        }

        let pool = pool_options(config).connect_lazy_with(options);
        debug!(
            shard_id = %shard.shard_id,
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Postgres pool created"
        );

        Ok(Arc::new(PgConnectionPool {
            shard_id: shard.shard_id.clone(),
            pool,
            acquire_timeout: config.connection_timeout,
        }))
    }

    fn name(&self) -> &'static str {
        "Postgres"
    }
}

fn bind_params<'q>(sql: &'q str, params: &[Value]) -> Query<'q, Postgres, PgArguments> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(value) => query.bind(*value),
        Value::Number(number) => match number.as_i64() {
            Some(value) => query.bind(value),
            None => query.bind(number.as_f64()),
        },
        Value::String(value) => query.bind(value.clone()),
        other => query.bind(Json(other.clone())),
    })
}

/// Drain a statement's results. `row_count` is the number of rows returned,
/// or the number affected for statements that return none.
async fn collect(
    mut results: BoxStream<'_, Result<Either<PgQueryResult, PgRow>, sqlx::Error>>,
) -> Result<QueryResult, sqlx::Error> {
    let mut rows = Vec::new();
    let mut affected = 0u64;

    while let Some(item) = results.try_next().await? {
        match item {
            Either::Left(done) => affected += done.rows_affected(),
            Either::Right(row) => rows.push(row_to_json(&row)),
        }
    }

    let row_count = if rows.is_empty() {
        affected as usize
    } else {
        rows.len()
    };
    Ok(QueryResult { rows, row_count })
}

fn row_to_json(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|column| {
            let value = decode_column(row, column.ordinal(), column.type_info().name());
            (column.name().to_string(), value)
        })
        .collect()
}

fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if !raw.is_null() => {}
        _ => return Value::Null,
    }

    let decoded = match type_name {
        "BOOL" => row.try_get::<bool, _>(index).map(Value::Bool),
        "INT2" => row.try_get::<i16, _>(index).map(Value::from),
        "INT4" => row.try_get::<i32, _>(index).map(Value::from),
        "INT8" => row.try_get::<i64, _>(index).map(Value::from),
        "FLOAT4" => row.try_get::<f32, _>(index).map(|v| float(f64::from(v))),
        "FLOAT8" => row.try_get::<f64, _>(index).map(float),
        "JSON" | "JSONB" => row.try_get::<Json<Value>, _>(index).map(|json| json.0),
        _ => row.try_get::<String, _>(index).map(Value::String),
    };
    decoded.unwrap_or(Value::Null)
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Map a sqlx error onto the pool error the manager acts on.
///
/// Transport failures and the SQLSTATE classes for lost connections (`08`)
/// and server shutdown (`57P`) count as connectivity; everything else is a
/// statement error.
fn map_error(err: &sqlx::Error, acquire_timeout: Duration) -> PoolError {
    match err {
        sqlx::Error::PoolTimedOut => PoolError::Timeout(acquire_timeout),
        sqlx::Error::PoolClosed => PoolError::Closed,
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => PoolError::Connection(err.to_string()),
        sqlx::Error::Configuration(_) => PoolError::Creation(err.to_string()),
        sqlx::Error::Database(db)
            if db
                .code()
                .is_some_and(|code| code.starts_with("08") || code.starts_with("57P")) =>
        {
            PoolError::Connection(err.to_string())
        }
        _ => PoolError::Query(err.to_string()),
    }
}
