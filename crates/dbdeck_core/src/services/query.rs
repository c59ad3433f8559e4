//! Raw statement execution.
//!
//! Results come back as [`QueryResult`]s whose values are already
//! normalized to JSON: binary payloads become (lossy) UTF-8 text, JSON
//! columns become pretty-printed text, numbers and booleans stay typed, and
//! everything else is rendered as a string. The UI never sees driver types.

use crate::error::{CoreError, CoreResult};
use crate::models::{ColumnInfo, EngineKind, ExplainPlan, QueryResult, Row};
use crate::services::connection::{DbPool, PooledHandle};
use crate::services::explain::{self, QueryPlanRow};

use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Executor, Row as _, TypeInfo};
use std::time::Instant;
use uuid::Uuid;

/// Leading keywords routed to the read path.
const SELECT_KEYWORDS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "PRAGMA"];

/// Return the first matching decode as a JSON value.
macro_rules! decode_as {
    ($row:expr, $idx:expr, $ty:ty, $map:expr) => {
        if let Ok(v) = $row.try_get::<Option<$ty>, _>($idx) {
            return v.map($map).unwrap_or(JsonValue::Null);
        }
    };
}

/// Service for running statements against a pooled handle.
pub struct QueryService;

impl QueryService {
    /// Run a read statement and return its normalized rows.
    pub async fn raw_select(handle: &PooledHandle, sql: &str) -> CoreResult<QueryResult> {
        let start = Instant::now();

        let (columns, rows) = match handle.pool() {
            DbPool::MySql(pool) => {
                let rows = sqlx::raw_sql(sql).fetch_all(pool).await?;
                let columns = match rows.first() {
                    Some(row) => column_list(row.columns()),
                    None => described_columns(pool.describe(sql).await.map(|d| column_list(d.columns()))),
                };
                (columns, rows.iter().map(mysql_row).collect::<Vec<Row>>())
            }
            DbPool::Postgres(pool) => {
                let rows = sqlx::raw_sql(sql).fetch_all(pool).await?;
                let columns = match rows.first() {
                    Some(row) => column_list(row.columns()),
                    None => described_columns(pool.describe(sql).await.map(|d| column_list(d.columns()))),
                };
                (columns, rows.iter().map(pg_row).collect())
            }
            DbPool::Sqlite(pool) => {
                let rows = sqlx::raw_sql(sql).fetch_all(pool).await?;
                let columns = match rows.first() {
                    Some(row) => column_list(row.columns()),
                    None => described_columns(pool.describe(sql).await.map(|d| column_list(d.columns()))),
                };
                (columns, rows.iter().map(sqlite_row).collect())
            }
        };

        let execution_time_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(
            key = %handle.key(),
            engine = %handle.engine(),
            execution_time_ms,
            row_count = rows.len(),
            "Query completed"
        );

        Ok(QueryResult { columns, rows, execution_time_ms, ..Default::default() })
    }

    /// Run a mutating statement and return the number of affected rows.
    pub async fn raw_exec(handle: &PooledHandle, sql: &str) -> CoreResult<u64> {
        let start = Instant::now();
        let rows_affected = match handle.pool() {
            DbPool::MySql(pool) => sqlx::raw_sql(sql).execute(pool).await?.rows_affected(),
            DbPool::Postgres(pool) => sqlx::raw_sql(sql).execute(pool).await?.rows_affected(),
            DbPool::Sqlite(pool) => sqlx::raw_sql(sql).execute(pool).await?.rows_affected(),
        };
        tracing::debug!(
            key = %handle.key(),
            engine = %handle.engine(),
            execution_time_ms = start.elapsed().as_millis() as u64,
            rows_affected,
            "Statement executed"
        );
        Ok(rows_affected)
    }

    /// Whether a statement should go through [`raw_select`](Self::raw_select).
    ///
    /// Leading whitespace and comments are skipped. Empty input and an
    /// unterminated comment are not selects.
    pub fn is_select(sql: &str) -> bool {
        let mut rest = sql;
        loop {
            rest = rest.trim_start();
            if let Some(after) = rest.strip_prefix("--") {
                match after.find('\n') {
                    Some(end) => rest = &after[end + 1..],
                    None => return false,
                }
            } else if let Some(after) = rest.strip_prefix("/*") {
                match after.find("*/") {
                    Some(end) => rest = &after[end + 2..],
                    None => return false,
                }
            } else {
                break;
            }
        }

        let keyword: String = rest.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
        let keyword = keyword.to_ascii_uppercase();
        SELECT_KEYWORDS.contains(&keyword.as_str())
    }

    /// Route a user-typed statement to the read or write path.
    pub async fn execute(handle: &PooledHandle, sql: &str) -> CoreResult<QueryResult> {
        if Self::is_select(sql) {
            return Self::raw_select(handle, sql).await;
        }
        let start = Instant::now();
        let rows_affected = Self::raw_exec(handle, sql).await?;
        Ok(QueryResult {
            rows_affected: Some(rows_affected),
            execution_time_ms: start.elapsed().as_millis() as u64,
            ..Default::default()
        })
    }

    /// Run the engine's EXPLAIN for a statement and parse the plan.
    pub async fn explain(handle: &PooledHandle, sql: &str) -> CoreResult<ExplainPlan> {
        let sql = sql.trim().trim_end_matches(';');
        match handle.pool() {
            DbPool::Postgres(pool) => {
                let statement = format!("EXPLAIN (FORMAT JSON) {sql}");
                let row = sqlx::raw_sql(&statement).fetch_one(pool).await?;
                let payload = match row.try_get::<JsonValue, _>(0) {
                    Ok(value) => value.to_string(),
                    Err(_) => row.try_get::<String, _>(0)?,
                };
                explain::parse_explain_json(&payload)
            }
            DbPool::MySql(pool) => {
                let statement = format!("EXPLAIN FORMAT=JSON {sql}");
                let row = sqlx::raw_sql(&statement).fetch_one(pool).await?;
                let payload = match row.try_get::<String, _>(0) {
                    Ok(text) => text,
                    Err(_) => String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(0)?).into_owned(),
                };
                explain::parse_mysql_explain_json(&payload)
            }
            DbPool::Sqlite(pool) => {
                let statement = format!("EXPLAIN QUERY PLAN {sql}");
                let rows = sqlx::raw_sql(&statement).fetch_all(pool).await?;
                let plan_rows = rows
                    .iter()
                    .map(|row| {
                        Ok(QueryPlanRow {
                            id: row.try_get("id")?,
                            parent: row.try_get("parent")?,
                            detail: row.try_get("detail")?,
                        })
                    })
                    .collect::<Result<Vec<_>, sqlx::Error>>()?;
                explain::parse_sqlite_query_plan(&plan_rows)
            }
        }
    }

    /// Current server sessions, for the activity monitor.
    pub async fn process_list(handle: &PooledHandle) -> CoreResult<QueryResult> {
        let sql = match handle.engine() {
            EngineKind::MySql => "SHOW FULL PROCESSLIST",
            EngineKind::Postgres => {
                "SELECT pid, usename::text AS user_name, datname::text AS database, \
                 application_name, client_addr::text AS client, state, \
                 query_start::text AS query_start, query \
                 FROM pg_stat_activity WHERE pid <> pg_backend_pid() ORDER BY query_start NULLS LAST"
            }
            EngineKind::Sqlite => {
                return Err(CoreError::invalid_input("process list is not available for SQLite"));
            }
        };
        Self::raw_select(handle, sql).await
    }
}

fn column_list<C: Column>(columns: &[C]) -> Vec<ColumnInfo> {
    columns
        .iter()
        .map(|col| ColumnInfo { name: col.name().to_string(), type_name: col.type_info().name().to_string() })
        .collect()
}

/// Columns of a result with no rows, taken from the prepared statement.
fn described_columns(described: Result<Vec<ColumnInfo>, sqlx::Error>) -> Vec<ColumnInfo> {
    described.unwrap_or_else(|e| {
        // Multi-statement scripts cannot be prepared.
        tracing::debug!(error = %e, "Could not describe statement, returning no columns");
        Vec::new()
    })
}

fn is_json_type(type_name: &str) -> bool {
    matches!(type_name, "JSON" | "JSONB")
}

fn is_binary_type(type_name: &str) -> bool {
    type_name == "BYTEA" || type_name.contains("BLOB") || type_name.contains("BINARY")
}

fn pretty_json(value: JsonValue) -> JsonValue {
    match serde_json::to_string_pretty(&value) {
        Ok(text) => JsonValue::String(text),
        Err(_) => value,
    }
}

/// Pretty-print JSON that arrived as text; other text passes through.
fn pretty_json_text(text: String) -> JsonValue {
    match serde_json::from_str::<JsonValue>(&text) {
        Ok(value) => pretty_json(value),
        Err(_) => JsonValue::String(text),
    }
}

fn lossy_text(bytes: Vec<u8>) -> JsonValue {
    JsonValue::String(String::from_utf8_lossy(&bytes).into_owned())
}

/// The server's own text rendering of a value no typed decode accepted.
///
/// Statements run over the text protocol, so this covers `inet`, `interval`,
/// arrays, enums and out-of-range `TIME` values alike. Only SQL NULL maps to
/// `null`.
fn raw_text<'r, R>(row: &'r R, idx: usize) -> JsonValue
where
    R: sqlx::Row,
    usize: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database>,
    Vec<u8>: sqlx::Decode<'r, R::Database>,
{
    if let Ok(text) = row.try_get_unchecked::<Option<String>, _>(idx) {
        return text.map(JsonValue::String).unwrap_or(JsonValue::Null);
    }
    match row.try_get_unchecked::<Option<Vec<u8>>, _>(idx) {
        Ok(bytes) => bytes.map(lossy_text).unwrap_or(JsonValue::Null),
        Err(e) => {
            tracing::trace!(column = idx, error = %e, "Undecodable column value, returning null");
            JsonValue::Null
        }
    }
}

fn mysql_row(row: &MySqlRow) -> Row {
    (0..row.columns().len()).map(|idx| mysql_value(row, idx)).collect()
}

fn mysql_value(row: &MySqlRow, idx: usize) -> JsonValue {
    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();
    if is_json_type(&type_name) {
        decode_as!(row, idx, JsonValue, pretty_json);
        decode_as!(row, idx, String, pretty_json_text);
    }
    if is_binary_type(&type_name) {
        decode_as!(row, idx, Vec<u8>, lossy_text);
    }

    decode_as!(row, idx, i64, JsonValue::from);
    decode_as!(row, idx, u64, JsonValue::from);
    decode_as!(row, idx, f64, JsonValue::from);
    decode_as!(row, idx, f32, JsonValue::from);
    decode_as!(row, idx, bool, JsonValue::from);
    decode_as!(row, idx, Decimal, |v: Decimal| JsonValue::String(v.to_string()));
    decode_as!(row, idx, String, JsonValue::String);
    decode_as!(row, idx, chrono::DateTime<chrono::Utc>, |v: chrono::DateTime<chrono::Utc>| {
        JsonValue::String(v.to_rfc3339())
    });
    decode_as!(row, idx, chrono::NaiveDateTime, |v: chrono::NaiveDateTime| JsonValue::String(v.to_string()));
    decode_as!(row, idx, chrono::NaiveDate, |v: chrono::NaiveDate| JsonValue::String(v.to_string()));
    decode_as!(row, idx, chrono::NaiveTime, |v: chrono::NaiveTime| JsonValue::String(v.to_string()));
    decode_as!(row, idx, Vec<u8>, lossy_text);
    raw_text(row, idx)
}

fn pg_row(row: &PgRow) -> Row {
    (0..row.columns().len()).map(|idx| pg_value(row, idx)).collect()
}

fn pg_value(row: &PgRow, idx: usize) -> JsonValue {
    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();
    if is_json_type(&type_name) {
        decode_as!(row, idx, JsonValue, pretty_json);
    }
    if is_binary_type(&type_name) {
        decode_as!(row, idx, Vec<u8>, lossy_text);
    }

    decode_as!(row, idx, i64, JsonValue::from);
    decode_as!(row, idx, i32, JsonValue::from);
    decode_as!(row, idx, i16, JsonValue::from);
    decode_as!(row, idx, f64, JsonValue::from);
    decode_as!(row, idx, f32, JsonValue::from);
    decode_as!(row, idx, bool, JsonValue::from);
    decode_as!(row, idx, Decimal, |v: Decimal| JsonValue::String(v.to_string()));
    decode_as!(row, idx, String, JsonValue::String);
    decode_as!(row, idx, Uuid, |v: Uuid| JsonValue::String(v.to_string()));
    decode_as!(row, idx, chrono::DateTime<chrono::Utc>, |v: chrono::DateTime<chrono::Utc>| {
        JsonValue::String(v.to_rfc3339())
    });
    decode_as!(row, idx, chrono::NaiveDateTime, |v: chrono::NaiveDateTime| JsonValue::String(v.to_string()));
    decode_as!(row, idx, chrono::NaiveDate, |v: chrono::NaiveDate| JsonValue::String(v.to_string()));
    decode_as!(row, idx, chrono::NaiveTime, |v: chrono::NaiveTime| JsonValue::String(v.to_string()));
    decode_as!(row, idx, Vec<u8>, lossy_text);
    raw_text(row, idx)
}

fn sqlite_row(row: &SqliteRow) -> Row {
    (0..row.columns().len()).map(|idx| sqlite_value(row, idx)).collect()
}

fn sqlite_value(row: &SqliteRow, idx: usize) -> JsonValue {
    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();
    if is_binary_type(&type_name) {
        decode_as!(row, idx, Vec<u8>, lossy_text);
    }

    decode_as!(row, idx, i64, JsonValue::from);
    decode_as!(row, idx, f64, JsonValue::from);
    decode_as!(row, idx, bool, JsonValue::from);
    decode_as!(row, idx, String, JsonValue::String);
    decode_as!(row, idx, Vec<u8>, lossy_text);
    raw_text(row, idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolLimits, RetryPolicy};
    use crate::services::connection::ConnectionManager;
    use serde_json::json;
    use std::sync::Arc;

    async fn sqlite_handle(dir: &tempfile::TempDir) -> (ConnectionManager, Arc<PooledHandle>) {
        let path = dir.path().join("q.db");
        std::fs::File::create(&path).unwrap();
        let manager = ConnectionManager::new(PoolLimits::default(), RetryPolicy::no_retry());
        let handle = manager
            .open("q", "", EngineKind::Sqlite, &format!("sqlite:{}", path.display()))
            .await
            .unwrap();
        (manager, handle)
    }

    #[test]
    fn test_is_select_accepts_reads() {
        assert!(QueryService::is_select("SELECT 1"));
        assert!(QueryService::is_select("  \n\tSHOW TABLES"));
        assert!(QueryService::is_select("-- note\nSELECT 1"));
        assert!(QueryService::is_select("/* c */ EXPLAIN SELECT 1"));
        assert!(QueryService::is_select("describe users"));
        assert!(QueryService::is_select("DESC users"));
        assert!(QueryService::is_select("pragma table_info('t')"));
        assert!(QueryService::is_select("select(1)"));
    }

    #[test]
    fn test_is_select_rejects_everything_else() {
        assert!(!QueryService::is_select("INSERT INTO t VALUES (1)"));
        assert!(!QueryService::is_select("CREATE TABLE t (id int)"));
        assert!(!QueryService::is_select(""));
        assert!(!QueryService::is_select("   "));
        assert!(!QueryService::is_select("-- SELECT 1"));
        assert!(!QueryService::is_select("/* SELECT 1"));
        assert!(!QueryService::is_select("/* a */ /* b"));
        assert!(!QueryService::is_select("WITH x AS (SELECT 1) DELETE FROM t"));
        assert!(!QueryService::is_select("SELECTED"));
    }

    #[tokio::test]
    async fn test_exec_then_select_normalizes_values() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, handle) = sqlite_handle(&dir).await;

        QueryService::raw_exec(
            &handle,
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price REAL, data BLOB, note TEXT)",
        )
        .await
        .unwrap();
        let inserted = QueryService::raw_exec(
            &handle,
            "INSERT INTO items (name, price, data, note) VALUES ('widget', 2.5, X'68656C6C6F', NULL), ('gadget', 4, NULL, 'x')",
        )
        .await
        .unwrap();
        assert_eq!(inserted, 2);

        let result = QueryService::raw_select(&handle, "SELECT id, name, price, data, note FROM items ORDER BY id")
            .await
            .unwrap();
        assert_eq!(result.column_names(), vec!["id", "name", "price", "data", "note"]);
        assert_eq!(result.rows[0], vec![json!(1), json!("widget"), json!(2.5), json!("hello"), JsonValue::Null]);
        assert_eq!(result.value(1, "note"), Some(&json!("x")));
        assert!(result.rows_affected.is_none());

        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_empty_result_keeps_columns() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, handle) = sqlite_handle(&dir).await;

        QueryService::raw_exec(&handle, "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)").await.unwrap();
        let result = QueryService::raw_select(&handle, "SELECT id, name FROM items WHERE 0").await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.column_names(), vec!["id", "name"]);

        let literal = QueryService::raw_select(&handle, "SELECT 1 AS a WHERE 0").await.unwrap();
        assert_eq!(literal.column_names(), vec!["a"]);

        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_raw_text_renders_values_and_keeps_null() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, handle) = sqlite_handle(&dir).await;
        let DbPool::Sqlite(pool) = handle.pool() else { panic!("expected a SQLite pool") };

        let row = sqlx::raw_sql("SELECT 42 AS n, NULL AS z, X'6869' AS b, 'x' AS t").fetch_one(pool).await.unwrap();
        assert_eq!(raw_text(&row, 0), json!("42"));
        assert_eq!(raw_text(&row, 1), JsonValue::Null);
        assert_eq!(raw_text(&row, 2), json!("hi"));
        assert_eq!(raw_text(&row, 3), json!("x"));

        manager.close_all().await;
    }

    /// Needs a live server: set `DBDECK_TEST_POSTGRES_URL` to run.
    #[tokio::test]
    async fn test_postgres_types_without_typed_decode_render_as_text() {
        let Ok(url) = std::env::var("DBDECK_TEST_POSTGRES_URL") else {
            return;
        };
        let manager = ConnectionManager::new(PoolLimits::default(), RetryPolicy::no_retry());
        let handle = manager.open("pg", "", EngineKind::Postgres, &url).await.unwrap();

        let result = QueryService::raw_select(
            &handle,
            "SELECT '10.0.0.1'::inet AS addr, interval '1 day' AS span, ARRAY[1,2] AS nums, \
             42::int4 AS n, 'x'::text AS t, NULL::inet AS missing",
        )
        .await
        .unwrap();
        assert_eq!(
            result.rows[0],
            vec![json!("10.0.0.1"), json!("1 day"), json!("{1,2}"), json!(42), json!("x"), JsonValue::Null]
        );

        let empty = QueryService::raw_select(&handle, "SELECT 1 AS a WHERE false").await.unwrap();
        assert_eq!(empty.column_names(), vec!["a"]);

        manager.close_all().await;
    }

    #[test]
    fn test_json_values_are_pretty_printed() {
        assert_eq!(pretty_json_text("{\"a\":1}".to_string()), json!("{\n  \"a\": 1\n}"));
        assert_eq!(pretty_json(json!({"a": [1, 2]})), json!("{\n  \"a\": [\n    1,\n    2\n  ]\n}"));
        assert_eq!(pretty_json_text("not json".to_string()), json!("not json"));
        assert_eq!(pretty_json_text("{\"open\": ".to_string()), json!("{\"open\": "));
    }

    #[tokio::test]
    async fn test_execute_routes_by_statement() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, handle) = sqlite_handle(&dir).await;

        let created = QueryService::execute(&handle, "CREATE TABLE t (id INTEGER)").await.unwrap();
        assert_eq!(created.rows_affected, Some(0));
        let inserted = QueryService::execute(&handle, "INSERT INTO t VALUES (1), (2), (3)").await.unwrap();
        assert_eq!(inserted.rows_affected, Some(3));

        let selected = QueryService::execute(&handle, "-- count\nSELECT COUNT(*) AS n FROM t").await.unwrap();
        assert_eq!(selected.value(0, "n"), Some(&json!(3)));

        let err = QueryService::execute(&handle, "SELEC nonsense").await.unwrap_err();
        assert_eq!(err.category(), "Query");

        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_sqlite_explain_flags_full_scan() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, handle) = sqlite_handle(&dir).await;

        QueryService::raw_exec(&handle, "CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL)").await.unwrap();
        let plan = QueryService::explain(&handle, "SELECT * FROM orders WHERE total > 10;").await.unwrap();
        assert!(!plan.nodes.is_empty());
        assert_eq!(plan.nodes[0].label, "orders");
        assert!(plan.nodes[0].full_table_scan);
        assert_eq!(plan.warnings.len(), 1);

        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_process_list_unsupported_on_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, handle) = sqlite_handle(&dir).await;
        let err = QueryService::process_list(&handle).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput { .. }));
        manager.close_all().await;
    }
}
