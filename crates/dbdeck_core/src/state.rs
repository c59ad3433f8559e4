//! Core state facade.
//!
//! `DeckState` is the single object the UI layer holds. It owns the
//! connection cache, the tunnel cache and the backup job registry, turns a
//! caller-owned [`ConnectionSpec`] into a live handle (tunnel, then DSN, then
//! pool), and converts every failure into a [`ClassifiedError`] after logging
//! the raw error.

use crate::classifier::ClassifiedError;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::{BackupRecord, ConnectionSpec, ExplainPlan, IndexInfo, QueryResult, SchemaInfo};
use crate::services::{BackupService, ConnectionManager, Dialect, PooledHandle, QueryService, SchemaService, TunnelManager};

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Loopback address tunnels listen on.
const TUNNEL_BIND_HOST: &str = "127.0.0.1";

/// Session id of the shared handle used for catalog browsing.
const SHARED_SESSION: &str = "";

/// Central registry of live connections, tunnels and backup jobs.
///
/// Safe to share across tasks behind an `Arc`; every cache carries its own
/// lock.
pub struct DeckState {
    config: CoreConfig,
    connections: ConnectionManager,
    tunnels: TunnelManager,
    backups: BackupService,
}

impl DeckState {
    pub fn new(config: CoreConfig) -> Self {
        let connections = ConnectionManager::new(config.pool.clone(), config.retry.clone());
        let tunnels = TunnelManager::new(config.tunnel.clone());
        let backups = BackupService::new(config.backup_tools.clone());

        tracing::info!(
            max_connections = config.pool.max_connections,
            retry_attempts = config.retry.max_attempts,
            "DeckState initialized"
        );

        Self { config, connections, tunnels, backups }
    }

    // ========== Accessors ==========

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn backups(&self) -> &BackupService {
        &self.backups
    }

    // ========== Connection lifecycle ==========

    /// Open (or reuse) the handle for `(spec.id, session_id)`.
    pub async fn connect(&self, spec: &ConnectionSpec, session_id: &str) -> Result<Arc<PooledHandle>, ClassifiedError> {
        let handle = boundary("connect", &spec.id, self.handle(spec, session_id).await)?;
        tracing::debug!(connection_id = %spec.id, session_id, target = %spec.display_url(), "Connected");
        Ok(handle)
    }

    /// Check that a spec can reach its server without caching anything.
    ///
    /// A tunnel started only for the test is stopped afterwards; one that
    /// was already running is left alone.
    pub async fn test_connection(&self, spec: &ConnectionSpec) -> Result<(), ClassifiedError> {
        boundary("test_connection", &spec.id, self.ping_spec(spec).await)
    }

    /// Close every handle of a connection and stop its tunnel.
    pub async fn disconnect(&self, connection_id: &str) {
        self.connections.close_connection(connection_id).await;
        self.tunnels.stop(connection_id).await;
        tracing::info!(connection_id = %connection_id, "Disconnected");
    }

    /// Close one session handle, keeping the rest of the connection open.
    pub async fn close_session(&self, connection_id: &str, session_id: &str) {
        self.connections.close(connection_id, session_id).await;
    }

    /// Close all pools and tunnels. Called once at process teardown.
    pub async fn shutdown(&self) {
        self.connections.close_all().await;
        self.tunnels.stop_all().await;
        tracing::info!("DeckState shut down");
    }

    // ========== Queries ==========

    /// Run one statement on a session handle.
    pub async fn run_query(
        &self,
        spec: &ConnectionSpec,
        session_id: &str,
        sql: &str,
    ) -> Result<QueryResult, ClassifiedError> {
        let result = async {
            let handle = self.handle(spec, session_id).await?;
            QueryService::execute(&handle, sql).await
        }
        .await;
        boundary("run_query", &spec.id, result)
    }

    /// Like [`run_query`](Self::run_query), but a failure is reported in
    /// [`QueryResult::error`] so the result grid can render it in place.
    pub async fn run_query_capturing(&self, spec: &ConnectionSpec, session_id: &str, sql: &str) -> QueryResult {
        match self.run_query(spec, session_id, sql).await {
            Ok(result) => result,
            Err(classified) => QueryResult { error: Some(classified.to_string()), ..QueryResult::default() },
        }
    }

    pub async fn explain(&self, spec: &ConnectionSpec, session_id: &str, sql: &str) -> Result<ExplainPlan, ClassifiedError> {
        let result = async {
            let handle = self.handle(spec, session_id).await?;
            QueryService::explain(&handle, sql).await
        }
        .await;
        boundary("explain", &spec.id, result)
    }

    /// Server session list for the monitor view.
    pub async fn process_list(&self, spec: &ConnectionSpec) -> Result<QueryResult, ClassifiedError> {
        let result = async {
            let handle = self.handle(spec, SHARED_SESSION).await?;
            QueryService::process_list(&handle).await
        }
        .await;
        boundary("process_list", &spec.id, result)
    }

    // ========== Catalog ==========

    pub async fn database_names(&self, spec: &ConnectionSpec) -> Result<Vec<String>, ClassifiedError> {
        let result = async {
            let handle = self.handle(spec, SHARED_SESSION).await?;
            SchemaService::database_names(&handle).await
        }
        .await;
        boundary("database_names", &spec.id, result)
    }

    pub async fn schema_names(&self, spec: &ConnectionSpec) -> Result<Vec<String>, ClassifiedError> {
        let result = async {
            let handle = self.handle(spec, SHARED_SESSION).await?;
            SchemaService::schema_names(&handle).await
        }
        .await;
        boundary("schema_names", &spec.id, result)
    }

    pub async fn table_names(&self, spec: &ConnectionSpec, database: &str) -> Result<Vec<String>, ClassifiedError> {
        let result = async {
            let handle = self.handle(spec, SHARED_SESSION).await?;
            SchemaService::table_names(&handle, database).await
        }
        .await;
        boundary("table_names", &spec.id, result)
    }

    pub async fn table_schema(
        &self,
        spec: &ConnectionSpec,
        database: &str,
        table: &str,
    ) -> Result<SchemaInfo, ClassifiedError> {
        let result = async {
            let handle = self.handle(spec, SHARED_SESSION).await?;
            SchemaService::table_schema(&handle, database, table).await
        }
        .await;
        boundary("table_schema", &spec.id, result)
    }

    pub async fn table_indexes(
        &self,
        spec: &ConnectionSpec,
        database: &str,
        table: &str,
    ) -> Result<Vec<IndexInfo>, ClassifiedError> {
        let result = async {
            let handle = self.handle(spec, SHARED_SESSION).await?;
            SchemaService::table_indexes(&handle, database, table).await
        }
        .await;
        boundary("table_indexes", &spec.id, result)
    }

    /// One page of table rows with the table's total row count.
    pub async fn table_data(
        &self,
        spec: &ConnectionSpec,
        session_id: &str,
        database: &str,
        table: &str,
        limit: u64,
        offset: u64,
    ) -> Result<QueryResult, ClassifiedError> {
        let result = async {
            let handle = self.handle(spec, session_id).await?;
            SchemaService::table_data(&handle, database, table, limit, offset).await
        }
        .await;
        boundary("table_data", &spec.id, result)
    }

    // ========== Backup / restore ==========

    pub async fn backup(
        &self,
        cancel: &CancellationToken,
        spec: &ConnectionSpec,
        output_path: &Path,
    ) -> Result<BackupRecord, ClassifiedError> {
        boundary("backup", &spec.id, self.backups.run_backup(cancel, spec, output_path).await)
    }

    pub async fn restore(
        &self,
        cancel: &CancellationToken,
        spec: &ConnectionSpec,
        input_path: &Path,
    ) -> Result<(), ClassifiedError> {
        boundary("restore", &spec.id, self.backups.run_restore(cancel, spec, input_path).await)
    }

    /// Cancel the running backup or restore of a connection.
    pub fn cancel_backup(&self, connection_id: &str) -> bool {
        self.backups.cancel(connection_id)
    }

    // ========== Internals ==========

    async fn handle(&self, spec: &ConnectionSpec, session_id: &str) -> CoreResult<Arc<PooledHandle>> {
        spec.validate()?;
        let dsn = self.resolve_dsn(spec).await?;
        self.connections.open(&spec.id, session_id, spec.engine, &dsn).await
    }

    /// DSN to dial, starting the connection's tunnel when it has one.
    async fn resolve_dsn(&self, spec: &ConnectionSpec) -> CoreResult<String> {
        let dialect = Dialect::new(spec.engine);
        match spec.active_tunnel() {
            Some(tunnel) if spec.engine.is_networked() => {
                let local_port =
                    self.tunnels.get_or_start(&spec.id, tunnel, spec.host.trim(), spec.effective_port()).await?;
                Ok(dialect.dsn(spec, TUNNEL_BIND_HOST, local_port))
            }
            _ => Ok(dialect.direct_dsn(spec)),
        }
    }

    async fn ping_spec(&self, spec: &ConnectionSpec) -> CoreResult<()> {
        spec.validate()?;
        let tunneled = spec.active_tunnel().is_some() && spec.engine.is_networked();
        let had_tunnel = tunneled && self.tunnels.active_port(&spec.id).await.is_some();

        let result = match self.resolve_dsn(spec).await {
            Ok(dsn) => self.connections.ping(spec.engine, &dsn).await,
            Err(e) => Err(e),
        };

        if tunneled && !had_tunnel {
            self.tunnels.stop(&spec.id).await;
        }
        result
    }
}

impl Default for DeckState {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

/// Log a failed operation with its raw error and classify it for the UI.
fn boundary<T>(operation: &'static str, connection_id: &str, result: CoreResult<T>) -> Result<T, ClassifiedError> {
    result.map_err(|e: CoreError| {
        tracing::warn!(
            operation,
            connection_id = %connection_id,
            category = e.category(),
            db_code = e.db_code().unwrap_or_default(),
            error = %e,
            "Operation failed"
        );
        e.classify()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorCode;
    use crate::config::{PoolLimits, RetryPolicy};
    use crate::models::{EngineKind, PlanNodeKind, SshTunnelSpec};
    use std::path::PathBuf;

    fn sqlite_spec(dir: &tempfile::TempDir, id: &str) -> ConnectionSpec {
        let path = dir.path().join(format!("{id}.db"));
        std::fs::File::create(&path).unwrap();
        ConnectionSpec::sqlite(id, path.display().to_string())
    }

    fn fast_config() -> CoreConfig {
        CoreConfig {
            pool: PoolLimits { acquire_timeout_secs: 1, ping_timeout_secs: 1, ..PoolLimits::default() },
            retry: RetryPolicy::no_retry(),
            ..CoreConfig::default()
        }
    }

    async fn seeded(state: &DeckState, spec: &ConnectionSpec) {
        state
            .run_query(spec, "", "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)")
            .await
            .unwrap();
        state
            .run_query(spec, "", "INSERT INTO items (name) VALUES ('a'), ('b'), ('c')")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_reuses_handle() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sqlite_spec(&dir, "c1");
        let state = DeckState::default();

        let first = state.connect(&spec, "").await.unwrap();
        let second = state.connect(&spec, "").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.engine(), EngineKind::Sqlite);

        let tab = state.connect(&spec, "tab-1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &tab));

        state.disconnect("c1").await;
        assert!(first.is_closed() && tab.is_closed());
        assert!(state.connections().keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_query_and_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sqlite_spec(&dir, "c1");
        let state = DeckState::default();
        seeded(&state, &spec).await;

        let result = state.run_query(&spec, "", "SELECT name FROM items ORDER BY id").await.unwrap();
        assert_eq!(result.row_count(), 3);
        assert_eq!(result.value(0, "name"), Some(&serde_json::json!("a")));

        let update = state.run_query(&spec, "", "UPDATE items SET name = name || '!'").await.unwrap();
        assert_eq!(update.rows_affected, Some(3));

        assert_eq!(state.database_names(&spec).await.unwrap(), vec!["main".to_string()]);
        assert_eq!(state.table_names(&spec, "main").await.unwrap(), vec!["items".to_string()]);

        let schema = state.table_schema(&spec, "main", "items").await.unwrap();
        assert_eq!(schema.primary_key(), vec!["id"]);
        assert!(schema.column("name").unwrap().is_unique);

        let page = state.table_data(&spec, "", "main", "items", 2, 0).await.unwrap();
        assert_eq!(page.total, Some(3));
        assert_eq!(page.row_count(), 2);

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_errors_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sqlite_spec(&dir, "c1");
        let state = DeckState::default();
        seeded(&state, &spec).await;

        let err = state.run_query(&spec, "", "SELECT * FROM missing").await.unwrap_err();
        assert_eq!(err.code, Some(ErrorCode::NotFound));

        let err = state.run_query(&spec, "", "SELEC 1").await.unwrap_err();
        assert_eq!(err.code, Some(ErrorCode::SyntaxError));

        let err = state.run_query(&spec, "", "INSERT INTO items (name) VALUES ('a')").await.unwrap_err();
        assert_eq!(err.code, Some(ErrorCode::DuplicateKey));

        let err = state.process_list(&spec).await.unwrap_err();
        assert_eq!(err.code, None);
        assert!(!err.message.is_empty());

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_query_capturing_reports_error_in_result() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sqlite_spec(&dir, "c1");
        let state = DeckState::default();

        let result = state.run_query_capturing(&spec, "", "SELECT * FROM missing").await;
        assert!(result.rows.is_empty());
        let message = result.error.unwrap();
        assert!(message.contains("NOT_FOUND"), "{message}");

        let ok = state.run_query_capturing(&spec, "", "SELECT 1 AS one").await;
        assert!(ok.error.is_none());
        assert_eq!(ok.row_count(), 1);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_explain_flags_full_scan() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sqlite_spec(&dir, "c1");
        let state = DeckState::default();
        state.run_query(&spec, "", "CREATE TABLE logs (msg TEXT)").await.unwrap();

        let plan = state.explain(&spec, "", "SELECT * FROM logs WHERE msg = 'x'").await.unwrap();
        let scan = plan.nodes.iter().find(|n| n.node_type == PlanNodeKind::Scan).unwrap();
        assert!(scan.full_table_scan);
        assert_eq!(plan.warnings.len(), 1);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected_before_connecting() {
        let state = DeckState::default();
        let spec = ConnectionSpec::sqlite("c1", "  ");

        let err = state.connect(&spec, "").await.unwrap_err();
        assert_eq!(err.code, None);
        assert_eq!(err.message, "SQLite database path is required");
        assert!(state.connections().keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_test_connection_does_not_cache() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sqlite_spec(&dir, "c1");
        let state = DeckState::new(fast_config());

        state.test_connection(&spec).await.unwrap();
        assert!(state.connections().keys().await.is_empty());

        let missing = ConnectionSpec::sqlite("c2", dir.path().join("nope/x.db").display().to_string());
        assert!(state.test_connection(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_refused_server_is_classified() {
        let state = DeckState::new(fast_config());
        let spec = ConnectionSpec::network("c1", EngineKind::MySql, "127.0.0.1", "root", "secret", "app").with_port(1);

        let err = state.connect(&spec, "").await.unwrap_err();
        assert_eq!(err.code, Some(ErrorCode::ConnectionRefused));
        assert!(state.connections().keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_tunnel_leaves_nothing_behind() {
        let state = DeckState::new(CoreConfig {
            tunnel: crate::config::TunnelSettings { connect_timeout_secs: 2, ..Default::default() },
            ..fast_config()
        });
        let spec = ConnectionSpec::network("c1", EngineKind::Postgres, "db.internal", "app", "secret", "app")
            .with_ssh_tunnel(SshTunnelSpec::with_password("127.0.0.1", "jump", "pw").port(1));

        assert!(state.connect(&spec, "").await.is_err());
        assert!(state.test_connection(&spec).await.is_err());
        assert!(state.tunnels().active_port("c1").await.is_none());
        assert!(state.connections().keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_backup_with_missing_tool() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sqlite_spec(&dir, "c1");
        let mut config = CoreConfig::default();
        config.backup_tools.sqlite3 = PathBuf::from("/nonexistent/dbdeck-sqlite3");
        let state = DeckState::new(config);

        let output = dir.path().join("out.sql");
        let err = state.backup(&CancellationToken::new(), &spec, &output).await.unwrap_err();
        assert!(err.message.contains("executable file not found"), "{}", err.message);
        assert!(!output.exists());
        assert!(!state.cancel_backup("c1"));
    }
}
