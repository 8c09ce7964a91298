//! PostgreSQL connection pool.
//!
//! The pool bounds the number of live connections with a semaphore and keeps
//! idle connections in a list. It implements [`ConnectionProvider`], which is
//! how sessions and queries reach the database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::connection::{CommandTag, PgConfig, PgConnection, QueryResult, QueryStart};
use super::error::{PgError, PgResult};
use super::transaction::{PgRows, PgTransaction, RowsConn};
use super::types::{Oid, PgValue, TypeInfo, TypeRegistry};
use crate::context::Context;
use crate::provider::{ConnectionProvider, RowCursor, TxHandle, TxOptions};

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PgPoolConfig {
    /// Database connection URL
    pub url: String,
    /// Connections opened eagerly by [`PgPool::connect`]
    pub min_connections: u32,
    /// Maximum number of live connections
    pub max_connections: u32,
    /// How long `acquire` waits for a free slot, in milliseconds; unbounded
    /// when unset
    pub acquire_timeout_ms: Option<u64>,
    /// Overrides the application name of the URL
    pub application_name: Option<String>,
}

impl Default for PgPoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            min_connections: 1,
            max_connections: 10,
            acquire_timeout_ms: None,
            application_name: None,
        }
    }
}

impl PgPoolConfig {
    /// Create a new pool configuration.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    /// Read `DATABASE_URL`, `PG_POOL_MIN`, `PG_POOL_MAX` and
    /// `PG_ACQUIRE_TIMEOUT_MS` (or whole seconds in `PG_ACQUIRE_TIMEOUT_SECS`).
    pub fn from_env() -> PgResult<Self> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| PgError::Config("DATABASE_URL is not set".to_string()))?;

        let defaults = Self::default();
        Ok(Self {
            url,
            min_connections: env_parse_or_default("PG_POOL_MIN", defaults.min_connections),
            max_connections: env_parse_or_default("PG_POOL_MAX", defaults.max_connections),
            acquire_timeout_ms: env_parse::<u64>("PG_ACQUIRE_TIMEOUT_MS").or_else(|| {
                env_parse::<u64>("PG_ACQUIRE_TIMEOUT_SECS").map(|secs| secs.saturating_mul(1000))
            }),
            application_name: None,
        })
    }

    /// Set the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Bound the time spent waiting for a free connection slot.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// The acquire timeout, if any.
    pub fn acquire_timeout_duration(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    /// Set the application name reported to the server.
    pub fn application_name(mut self, name: &str) -> Self {
        self.application_name = Some(name.to_string());
        self
    }

    fn validate(&self) -> PgResult<()> {
        if self.max_connections == 0 {
            return Err(PgError::Config("max_connections must be at least 1".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(PgError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    fn connection_config(&self) -> PgResult<PgConfig> {
        let mut config = PgConfig::from_url(&self.url)?;
        if let Some(name) = &self.application_name {
            config.application_name = Some(name.clone());
        }
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_parse_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_parse(key).unwrap_or(default)
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is returned to the pool if it is still
/// reusable and discarded otherwise.
pub struct PooledConnection {
    /// The actual connection (None once returned to the pool)
    conn: Option<PgConnection>,
    pool: Arc<PgPoolInner>,
    /// Semaphore permit (controls pool size)
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Borrow the underlying connection.
    pub fn get(&mut self) -> PgResult<&mut PgConnection> {
        self.conn.as_mut().ok_or(PgError::ConnectionClosed)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.is_reusable() && !self.pool.semaphore.is_closed() {
                self.pool.idle_connections.lock().push(conn);
            } else if !conn.is_closed() {
                warn!(
                    status = ?conn.transaction_status(),
                    in_flight = conn.is_in_flight(),
                    "discarding connection that is not reusable"
                );
            }
        }
    }
}

/// Mark `conn` broken when `result` is an abort that left it mid-exchange.
pub(crate) fn discard_if_aborted<T>(conn: &mut PgConnection, result: &PgResult<T>) {
    if let Err(e) = result {
        if e.is_cancellation() && conn.is_in_flight() {
            warn!(error = %e, "connection aborted mid-exchange");
            conn.mark_broken();
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct PgPoolInner {
    config: PgPoolConfig,
    connection_config: PgConfig,
    /// Idle connections waiting to be used
    idle_connections: Mutex<Vec<PgConnection>>,
    /// Semaphore to limit total connections
    semaphore: Arc<Semaphore>,
    types: TypeRegistry,
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PgPoolInner>,
}

impl PgPool {
    /// Create a new connection pool, opening `min_connections` eagerly.
    pub async fn connect(config: PgPoolConfig) -> PgResult<Self> {
        config.validate()?;
        let connection_config = config.connection_config()?;

        let inner = Arc::new(PgPoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            config,
            connection_config,
            idle_connections: Mutex::new(Vec::new()),
            types: TypeRegistry::new(),
        });

        let pool = Self { inner };

        for _ in 0..pool.inner.config.min_connections {
            let conn = pool.create_connection().await?;
            pool.inner.idle_connections.lock().push(conn);
        }

        info!(
            host = %pool.inner.connection_config.host,
            database = %pool.inner.connection_config.database,
            min = pool.inner.config.min_connections,
            max = pool.inner.config.max_connections,
            "connection pool started"
        );

        Ok(pool)
    }

    /// Get a connection from the pool.
    pub async fn acquire(&self, ctx: &Context) -> PgResult<PooledConnection> {
        let ctx = match self.inner.config.acquire_timeout_duration() {
            Some(timeout) => ctx.child_with_deadline(tokio::time::Instant::now() + timeout),
            None => ctx.clone(),
        };

        let permit = ctx
            .run(async {
                Arc::clone(&self.inner.semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| PgError::PoolClosed)
            })
            .await?;

        let idle = {
            let mut idle = self.inner.idle_connections.lock();
            idle.pop()
        };

        let conn = match idle {
            Some(c) if c.is_reusable() => c,
            _ => ctx.run(self.create_connection()).await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Execute a simple query on a pooled connection, buffering all rows.
    pub async fn simple_query(&self, ctx: &Context, query: &str) -> PgResult<Vec<QueryResult>> {
        let mut pooled = self.acquire(ctx).await?;
        let conn = pooled.get()?;
        let result = ctx.run(conn.simple_query(query)).await;
        discard_if_aborted(conn, &result);
        result
    }

    /// Register the server's non-builtin types (enums, domains, extensions).
    ///
    /// Returns the number of types registered.
    pub async fn load_types(&self, ctx: &Context) -> PgResult<usize> {
        let results = self
            .simple_query(ctx, "SELECT oid, typname FROM pg_catalog.pg_type")
            .await?;

        let mut count = 0;
        for row in results.iter().flat_map(|r| r.rows.iter()) {
            if let [PgValue::Oid(oid), PgValue::Text(name)] = row.as_slice() {
                self.inner.types.register(Oid(*oid), name.clone());
                count += 1;
            }
        }
        debug!(count, "loaded server types");
        Ok(count)
    }

    /// Close the pool and all idle connections.
    ///
    /// Waiting and future `acquire` calls fail with [`PgError::PoolClosed`].
    pub async fn close(&self) {
        self.inner.semaphore.close();

        let connections = std::mem::take(&mut *self.inner.idle_connections.lock());
        for mut conn in connections {
            let _ = conn.close().await;
        }
        info!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }

    /// Get the current number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.idle_connections.lock().len()
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PgPoolConfig {
        &self.inner.config
    }

    async fn create_connection(&self) -> PgResult<PgConnection> {
        PgConnection::connect_with_config(self.inner.connection_config.clone()).await
    }
}

#[async_trait]
impl ConnectionProvider for PgPool {
    async fn begin(&self, ctx: &Context, options: TxOptions) -> PgResult<Box<dyn TxHandle>> {
        let mut pooled = self.acquire(ctx).await?;
        let conn = pooled.get()?;

        let sql = options.begin_sql();
        let result = ctx.run(conn.execute(&sql)).await;
        discard_if_aborted(conn, &result);
        result?;

        debug!(?options, "transaction started");
        Ok(Box::new(PgTransaction::new(pooled)))
    }

    async fn execute(&self, ctx: &Context, sql: &str) -> PgResult<CommandTag> {
        let mut pooled = self.acquire(ctx).await?;
        let conn = pooled.get()?;
        let result = ctx.run(conn.execute(sql)).await;
        discard_if_aborted(conn, &result);
        result
    }

    async fn query(&self, ctx: &Context, sql: &str) -> PgResult<Box<dyn RowCursor>> {
        let mut pooled = self.acquire(ctx).await?;
        let conn = pooled.get()?;
        let result = ctx.run(conn.start_query(sql)).await;
        discard_if_aborted(conn, &result);

        let rows = match result? {
            QueryStart::Rows(columns) => PgRows::streaming(RowsConn::Pooled(pooled), columns),
            QueryStart::Command(tag) => PgRows::completed(tag),
        };
        Ok(Box::new(rows))
    }

    fn type_info(&self, oid: Oid) -> Option<TypeInfo> {
        self.inner.types.lookup(oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builder() {
        let config = PgPoolConfig::new("postgresql://localhost/test")
            .min_connections(2)
            .max_connections(20)
            .acquire_timeout(Duration::from_millis(2500))
            .application_name("billing");

        assert_eq!(config.min_connections, 2);
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.acquire_timeout_ms, Some(2500));
        assert_eq!(
            config.acquire_timeout_duration(),
            Some(Duration::from_millis(2500))
        );

        let conn = config.connection_config().unwrap();
        assert_eq!(conn.application_name.as_deref(), Some("billing"));
        assert_eq!(conn.database, "test");
    }

    #[test]
    fn test_pool_config_validation() {
        assert!(PgPoolConfig::new("postgres://h/db")
            .max_connections(0)
            .validate()
            .is_err());
        assert!(PgPoolConfig::new("postgres://h/db")
            .min_connections(5)
            .max_connections(2)
            .validate()
            .is_err());
        assert!(PgPoolConfig::new("postgres://h/db").validate().is_ok());
    }

    #[test]
    fn test_pool_config_deserialize_with_defaults() {
        let config: PgPoolConfig =
            serde_json::from_str(r#"{"url": "postgres://h/db", "max_connections": 4}"#).unwrap();
        assert_eq!(config.url, "postgres://h/db");
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.acquire_timeout_ms, None);
    }

    #[test]
    fn test_sub_second_acquire_timeout_is_kept() {
        let config = PgPoolConfig::new("postgres://h/db").acquire_timeout(Duration::from_millis(250));
        assert_eq!(config.acquire_timeout_ms, Some(250));

        let config: PgPoolConfig =
            serde_json::from_str(r#"{"url": "postgres://h/db", "acquire_timeout_ms": 40}"#).unwrap();
        assert_eq!(config.acquire_timeout_duration(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_env_parse_or_default_falls_back() {
        assert_eq!(env_parse_or_default("PGSESSION_TEST_UNSET_VAR", 7u32), 7);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let pool = PgPool {
            inner: Arc::new(PgPoolInner {
                config: PgPoolConfig::new("postgres://localhost/db").min_connections(0),
                connection_config: PgConfig::from_url("postgres://localhost/db").unwrap(),
                idle_connections: Mutex::new(Vec::new()),
                semaphore: Arc::new(Semaphore::new(1)),
                types: TypeRegistry::new(),
            }),
        };
        assert_eq!(pool.config().max_connections, 10);
        assert_eq!(pool.idle_count(), 0);

        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(
            pool.acquire(&Context::background()).await,
            Err(PgError::PoolClosed)
        ));
    }
}
