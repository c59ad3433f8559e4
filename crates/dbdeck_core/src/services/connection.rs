//! Pooled connection cache.
//!
//! Handles are keyed by `(connection_id, session_id)`. An empty session id is
//! the shared handle for a connection; a non-empty one gets its own
//! single-connection pool so session state (`USE`, `SET search_path`, open
//! transactions) stays with the tab that created it.

use crate::config::{PoolLimits, RetryPolicy};
use crate::error::{CoreError, CoreResult};
use crate::models::EngineKind;
use crate::services::dialect::redact_dsn;

use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Connection;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Cache key of a pooled handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub connection_id: String,
    pub session_id: String,
}

impl HandleKey {
    pub fn new(connection_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self { connection_id: connection_id.into(), session_id: session_id.into() }
    }

    /// Whether this is the shared handle for its connection.
    pub fn is_shared(&self) -> bool {
        self.session_id.is_empty()
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.session_id.is_empty() {
            write!(f, "{}", self.connection_id)
        } else {
            write!(f, "{}#{}", self.connection_id, self.session_id)
        }
    }
}

/// Engine-specific sqlx pool.
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    pub fn engine(&self) -> EngineKind {
        match self {
            Self::MySql(_) => EngineKind::MySql,
            Self::Postgres(_) => EngineKind::Postgres,
            Self::Sqlite(_) => EngineKind::Sqlite,
        }
    }

    /// Verify the DSN with a one-shot connection, then build the pool.
    ///
    /// The direct connect surfaces the driver's own error (refused, bad
    /// credentials, missing file) where an eager pool connect would only
    /// report an acquire timeout.
    async fn connect(engine: EngineKind, dsn: &str, max_connections: u32, limits: &PoolLimits) -> CoreResult<Self> {
        tokio::time::timeout(limits.acquire_timeout(), ping_once(engine, dsn))
            .await
            .map_err(|e| CoreError::connection_with_source(format!("timed out connecting to {engine} server"), e))??;

        let min_connections = limits.min_connections.min(max_connections);
        let pool = match engine {
            EngineKind::MySql => Self::MySql(
                MySqlPoolOptions::new()
                    .max_connections(max_connections)
                    .min_connections(min_connections)
                    .acquire_timeout(limits.acquire_timeout())
                    .idle_timeout(limits.idle_timeout())
                    .max_lifetime(limits.max_lifetime())
                    .test_before_acquire(true)
                    .connect_lazy(dsn)?,
            ),
            EngineKind::Postgres => Self::Postgres(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .min_connections(min_connections)
                    .acquire_timeout(limits.acquire_timeout())
                    .idle_timeout(limits.idle_timeout())
                    .max_lifetime(limits.max_lifetime())
                    .test_before_acquire(true)
                    .connect_lazy(dsn)?,
            ),
            EngineKind::Sqlite => Self::Sqlite(
                SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .min_connections(min_connections)
                    .acquire_timeout(limits.acquire_timeout())
                    .idle_timeout(limits.idle_timeout())
                    .max_lifetime(limits.max_lifetime())
                    .test_before_acquire(true)
                    .connect_lazy(dsn)?,
            ),
        };
        Ok(pool)
    }

    /// Ping an idle connection.
    ///
    /// When every connection is checked out the pool is busy, not dead; a
    /// session pool running a long statement must stay cached.
    async fn probe(&self) -> CoreResult<()> {
        match self {
            Self::MySql(pool) => match pool.try_acquire() {
                Some(mut conn) => conn.ping().await?,
                None if pool.size() > 0 => {}
                None => pool.acquire().await?.ping().await?,
            },
            Self::Postgres(pool) => match pool.try_acquire() {
                Some(mut conn) => conn.ping().await?,
                None if pool.size() > 0 => {}
                None => pool.acquire().await?.ping().await?,
            },
            Self::Sqlite(pool) => match pool.try_acquire() {
                Some(mut conn) => conn.ping().await?,
                None if pool.size() > 0 => {}
                None => pool.acquire().await?.ping().await?,
            },
        }
        Ok(())
    }

    async fn close(&self) {
        match self {
            Self::MySql(pool) => pool.close().await,
            Self::Postgres(pool) => pool.close().await,
            Self::Sqlite(pool) => pool.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::MySql(pool) => pool.is_closed(),
            Self::Postgres(pool) => pool.is_closed(),
            Self::Sqlite(pool) => pool.is_closed(),
        }
    }

}

/// A live, cached database handle.
///
/// Cloning the inner pool is cheap; callers share the handle through `Arc`.
#[derive(Debug)]
pub struct PooledHandle {
    key: HandleKey,
    pool: DbPool,
    opened_at: DateTime<Utc>,
}

impl PooledHandle {
    pub fn key(&self) -> &HandleKey {
        &self.key
    }

    pub fn engine(&self) -> EngineKind {
        self.pool.engine()
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close the pool, waiting for checked-out connections to come back.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!(key = %self.key, engine = %self.engine(), "Connection pool closed");
    }
}

/// Registry of pooled handles.
///
/// Liveness probes run under no lock. Mutations hold the write lock for the
/// whole re-check-and-create so two concurrent opens of one key never
/// produce two pools.
pub struct ConnectionManager {
    handles: RwLock<HashMap<HandleKey, Arc<PooledHandle>>>,
    limits: PoolLimits,
    retry: RetryPolicy,
}

impl ConnectionManager {
    pub fn new(limits: PoolLimits, retry: RetryPolicy) -> Self {
        Self { handles: RwLock::new(HashMap::new()), limits, retry }
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.limits
    }

    /// Return the cached handle for the key if it is alive, otherwise open,
    /// cache and return a new one.
    pub async fn open(
        &self,
        connection_id: &str,
        session_id: &str,
        engine: EngineKind,
        dsn: &str,
    ) -> CoreResult<Arc<PooledHandle>> {
        let key = HandleKey::new(connection_id, session_id);

        // Probe outside the lock so a slow server never stalls other keys.
        let stale = self.handles.read().await.get(&key).cloned();
        if let Some(existing) = &stale {
            if self.is_alive(existing).await {
                return Ok(Arc::clone(existing));
            }
        }

        let mut handles = self.handles.write().await;
        if let Some(current) = handles.get(&key) {
            let is_stale = stale.as_ref().is_some_and(|s| Arc::ptr_eq(s, current));
            if !is_stale && !current.is_closed() {
                // Another task reopened this key while we were probing.
                return Ok(Arc::clone(current));
            }
            tracing::info!(key = %key, "Cached handle failed liveness check, reopening");
            if let Some(dead) = handles.remove(&key) {
                tokio::spawn(async move { dead.close().await });
            }
        }

        let max_connections = if key.is_shared() && engine != EngineKind::Sqlite {
            self.limits.max_connections.max(1)
        } else {
            1
        };
        let pool = self.connect_with_retry(&key, engine, dsn, max_connections).await?;
        let handle = Arc::new(PooledHandle { key: key.clone(), pool, opened_at: Utc::now() });

        tracing::info!(key = %key, engine = %engine, max_connections, "Connection pool created");
        handles.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Look up a cached handle without probing it.
    pub async fn get(&self, connection_id: &str, session_id: &str) -> Option<Arc<PooledHandle>> {
        let handles = self.handles.read().await;
        handles.get(&HandleKey::new(connection_id, session_id)).cloned()
    }

    /// Like [`get`](Self::get) but fails with `ConnectionNotFound`.
    pub async fn require(&self, connection_id: &str, session_id: &str) -> CoreResult<Arc<PooledHandle>> {
        self.get(connection_id, session_id)
            .await
            .ok_or_else(|| CoreError::connection_not_found(connection_id, session_id))
    }

    /// Close and forget one handle. Unknown keys are ignored.
    pub async fn close(&self, connection_id: &str, session_id: &str) {
        let removed = {
            let mut handles = self.handles.write().await;
            handles.remove(&HandleKey::new(connection_id, session_id))
        };
        if let Some(handle) = removed {
            handle.close().await;
        }
    }

    /// Close every session handle of a connection, including the shared one.
    pub async fn close_connection(&self, connection_id: &str) {
        let removed: Vec<Arc<PooledHandle>> = {
            let mut handles = self.handles.write().await;
            let keys: Vec<HandleKey> =
                handles.keys().filter(|k| k.connection_id == connection_id).cloned().collect();
            keys.iter().filter_map(|k| handles.remove(k)).collect()
        };
        for handle in removed {
            handle.close().await;
        }
    }

    /// Close everything. Used at process teardown.
    pub async fn close_all(&self) {
        let removed: Vec<Arc<PooledHandle>> = {
            let mut handles = self.handles.write().await;
            handles.drain().map(|(_, h)| h).collect()
        };
        let count = removed.len();
        for handle in removed {
            handle.close().await;
        }
        tracing::info!(count, "All connection pools closed");
    }

    /// Cached keys, for diagnostics.
    pub async fn keys(&self) -> Vec<HandleKey> {
        self.handles.read().await.keys().cloned().collect()
    }

    /// One-shot connectivity test. Never touches the cache.
    pub async fn ping(&self, engine: EngineKind, dsn: &str) -> CoreResult<()> {
        let start = Instant::now();
        let result = tokio::time::timeout(self.limits.acquire_timeout(), ping_once(engine, dsn))
            .await
            .map_err(|e| CoreError::connection_with_source("connection test timed out", e))?;
        match &result {
            Ok(()) => tracing::debug!(
                engine = %engine,
                dsn = %redact_dsn(dsn),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Connection test succeeded"
            ),
            Err(e) => tracing::debug!(engine = %engine, dsn = %redact_dsn(dsn), error = %e, "Connection test failed"),
        }
        result
    }

    async fn is_alive(&self, handle: &PooledHandle) -> bool {
        if handle.is_closed() {
            return false;
        }
        match tokio::time::timeout(self.limits.ping_timeout(), handle.pool().probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(key = %handle.key(), error = %e, "Liveness probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(key = %handle.key(), "Liveness probe timed out");
                false
            }
        }
    }

    async fn connect_with_retry(
        &self,
        key: &HandleKey,
        engine: EngineKind,
        dsn: &str,
        max_connections: u32,
    ) -> CoreResult<DbPool> {
        // A failing SQLite open is a bad path, not a network blip.
        let attempts = if engine.is_networked() { self.retry.max_attempts.max(1) } else { 1 };

        let mut attempt = 1;
        loop {
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match DbPool::connect(engine, dsn, max_connections, &self.limits).await {
                Ok(pool) => return Ok(pool),
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        key = %key,
                        engine = %engine,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Failed to open connection, retrying"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        engine = %engine,
                        dsn = %redact_dsn(dsn),
                        attempts,
                        error = %e,
                        "Failed to open connection"
                    );
                    return Err(e);
                }
            }
            attempt += 1;
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(PoolLimits::default(), RetryPolicy::default())
    }
}

async fn ping_once(engine: EngineKind, dsn: &str) -> CoreResult<()> {
    match engine {
        EngineKind::MySql => {
            let mut conn = MySqlConnection::connect(dsn).await?;
            conn.ping().await?;
            conn.close().await?;
        }
        EngineKind::Postgres => {
            let mut conn = PgConnection::connect(dsn).await?;
            conn.ping().await?;
            conn.close().await?;
        }
        EngineKind::Sqlite => {
            let mut conn = SqliteConnection::connect(dsn).await?;
            conn.ping().await?;
            conn.close().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sqlite_dsn(dir: &tempfile::TempDir, name: &str) -> String {
        let path = dir.path().join(name);
        std::fs::File::create(&path).unwrap();
        format!("sqlite:{}", path.display())
    }

    fn fast_limits() -> PoolLimits {
        PoolLimits { acquire_timeout_secs: 1, ping_timeout_secs: 1, ..PoolLimits::default() }
    }

    #[tokio::test]
    async fn test_open_twice_returns_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = sqlite_dsn(&dir, "a.db");
        let manager = ConnectionManager::default();

        let first = manager.open("c1", "", EngineKind::Sqlite, &dsn).await.unwrap();
        let second = manager.open("c1", "", EngineKind::Sqlite, &dsn).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.keys().await.len(), 1);

        manager.close("c1", "").await;
        assert!(first.is_closed());
        assert!(manager.get("c1", "").await.is_none());

        let third = manager.open("c1", "", EngineKind::Sqlite, &dsn).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = sqlite_dsn(&dir, "s.db");
        let manager = ConnectionManager::default();

        let shared = manager.open("c1", "", EngineKind::Sqlite, &dsn).await.unwrap();
        let tab = manager.open("c1", "tab-1", EngineKind::Sqlite, &dsn).await.unwrap();
        let other = manager.open("c2", "", EngineKind::Sqlite, &dsn).await.unwrap();
        assert!(!Arc::ptr_eq(&shared, &tab));
        assert_eq!(tab.key().session_id, "tab-1");

        manager.close_connection("c1").await;
        assert!(manager.get("c1", "").await.is_none());
        assert!(manager.get("c1", "tab-1").await.is_none());
        assert!(manager.get("c2", "").await.is_some());
        assert!(shared.is_closed() && tab.is_closed());
        assert!(!other.is_closed());

        manager.close_all().await;
        assert!(manager.keys().await.is_empty());
        assert!(other.is_closed());
    }

    #[tokio::test]
    async fn test_closed_handle_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = sqlite_dsn(&dir, "r.db");
        let manager = ConnectionManager::default();

        let first = manager.open("c1", "", EngineKind::Sqlite, &dsn).await.unwrap();
        first.close().await;
        let second = manager.open("c1", "", EngineKind::Sqlite, &dsn).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_busy_session_handle_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = sqlite_dsn(&dir, "busy.db");
        let manager = ConnectionManager::new(fast_limits(), RetryPolicy::no_retry());

        let tab = manager.open("c1", "tab-1", EngineKind::Sqlite, &dsn).await.unwrap();
        let DbPool::Sqlite(pool) = tab.pool() else { panic!("expected a SQLite pool") };
        let mut conn = pool.acquire().await.unwrap();
        sqlx::query("CREATE TEMP TABLE scratch (x INTEGER)").execute(&mut *conn).await.unwrap();

        // The only session connection is checked out, as during a long query.
        let start = Instant::now();
        let again = manager.open("c1", "tab-1", EngineKind::Sqlite, &dsn).await.unwrap();
        let other = manager.open("c2", "", EngineKind::Sqlite, &dsn).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(Arc::ptr_eq(&tab, &again));
        assert!(!tab.is_closed());
        assert!(!other.is_closed());

        drop(conn);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scratch").fetch_one(pool).await.unwrap();
        assert_eq!(count, 0);

        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_require_missing_handle() {
        let manager = ConnectionManager::default();
        let err = manager.require("nope", "").await.unwrap_err();
        assert!(matches!(err, CoreError::ConnectionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_sqlite_open_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("sqlite:{}", dir.path().join("missing/none.db").display());
        let manager = ConnectionManager::new(fast_limits(), RetryPolicy::default());

        let start = Instant::now();
        assert!(manager.open("c1", "", EngineKind::Sqlite, &dsn).await.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(manager.get("c1", "").await.is_none());
    }

    #[tokio::test]
    async fn test_refused_network_open_fails() {
        let manager = ConnectionManager::new(fast_limits(), RetryPolicy { max_attempts: 2, initial_delay_ms: 10 });
        let result = manager.open("c1", "", EngineKind::MySql, "mysql://u:p@127.0.0.1:1/db").await;
        assert!(result.is_err());
        assert!(manager.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_silent_server_times_out_with_source() {
        // Accepts sockets and never sends the MySQL greeting.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let manager = ConnectionManager::new(fast_limits(), RetryPolicy { max_attempts: 1, initial_delay_ms: 10 });
        let dsn = format!("mysql://u:p@127.0.0.1:{port}/db");
        let err = manager.open("c1", "", EngineKind::MySql, &dsn).await.unwrap_err();

        assert_eq!(err.category(), "Connection");
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(std::error::Error::source(&err).is_some());
        assert!(manager.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_ping_does_not_cache() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = sqlite_dsn(&dir, "p.db");
        let manager = ConnectionManager::default();

        manager.ping(EngineKind::Sqlite, &dsn).await.unwrap();
        manager.ping(EngineKind::Sqlite, &dsn).await.unwrap();
        assert!(manager.keys().await.is_empty());

        let bad = format!("sqlite:{}", dir.path().join("nope/x.db").display());
        assert!(manager.ping(EngineKind::Sqlite, &bad).await.is_err());
    }

    #[test]
    fn test_handle_key_display() {
        assert_eq!(HandleKey::new("c1", "").to_string(), "c1");
        assert_eq!(HandleKey::new("c1", "t2").to_string(), "c1#t2");
        assert!(HandleKey::new("c1", "").is_shared());
    }
}
