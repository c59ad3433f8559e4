//! Schema introspection service.
//!
//! Lists databases, schemas and tables, and reads column and index metadata
//! from each engine's catalog (information_schema / pg_catalog for the
//! network engines, PRAGMAs for SQLite). Also provides the two-query
//! pagination primitive used by the table data grid.

use crate::error::{CoreError, CoreResult};
use crate::models::{ColumnDetail, ColumnInfo, EngineKind, IndexInfo, QueryResult, SchemaInfo};
use crate::services::connection::{DbPool, PooledHandle};
use crate::services::dialect::{Dialect, SQLITE_MAIN_DATABASE};
use crate::services::query::QueryService;

use sqlx::mysql::MySqlRow;
use sqlx::Row;
use std::time::Instant;

/// Read a MySQL text column that some server versions report as binary.
fn mysql_text(row: &MySqlRow, idx: usize) -> CoreResult<String> {
    match row.try_get::<String, _>(idx) {
        Ok(text) => Ok(text),
        Err(_) => Ok(String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(idx)?).into_owned()),
    }
}

/// Group `(index, column, unique, primary)` rows, already ordered by index
/// name and key position, into [`IndexInfo`]s.
fn group_indexes(rows: Vec<(String, String, bool, bool)>) -> Vec<IndexInfo> {
    let mut indexes: Vec<IndexInfo> = Vec::new();
    for (name, column, is_unique, is_primary) in rows {
        match indexes.last_mut() {
            Some(last) if last.name == name => last.columns.push(column),
            _ => indexes.push(IndexInfo { name, columns: vec![column], is_unique, is_primary }),
        }
    }
    indexes
}

/// Schema introspection service.
pub struct SchemaService;

impl SchemaService {
    /// Databases visible to the connection. SQLite only has `main`.
    pub async fn database_names(handle: &PooledHandle) -> CoreResult<Vec<String>> {
        let dialect = Dialect::new(handle.engine());
        let Some(sql) = dialect.database_list_sql() else {
            return Ok(vec![SQLITE_MAIN_DATABASE.to_string()]);
        };

        match handle.pool() {
            DbPool::MySql(pool) => {
                let rows = sqlx::raw_sql(sql).fetch_all(pool).await?;
                rows.iter().map(|row| mysql_text(row, 0)).collect()
            }
            DbPool::Postgres(pool) => {
                let rows = sqlx::query(sql).fetch_all(pool).await?;
                Ok(rows.iter().map(|row| row.try_get::<String, _>(0)).collect::<Result<_, _>>()?)
            }
            DbPool::Sqlite(_) => Ok(vec![SQLITE_MAIN_DATABASE.to_string()]),
        }
    }

    /// Non-system schemas of a PostgreSQL database.
    pub async fn schema_names(handle: &PooledHandle) -> CoreResult<Vec<String>> {
        let DbPool::Postgres(pool) = handle.pool() else {
            return Err(CoreError::invalid_input(format!(
                "schemas are only available for PostgreSQL, not {}",
                handle.engine()
            )));
        };

        let rows = sqlx::query(
            r#"
            SELECT n.nspname::text AS name
            FROM pg_catalog.pg_namespace n
            WHERE n.nspname NOT LIKE 'pg_%'
              AND n.nspname != 'information_schema'
            ORDER BY n.nspname
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(rows.iter().map(|row| row.try_get::<String, _>("name")).collect::<Result<_, _>>()?)
    }

    /// Tables of a database (MySQL) or schema (PostgreSQL, default
    /// `public`). SQLite ignores `database`.
    pub async fn table_names(handle: &PooledHandle, database: &str) -> CoreResult<Vec<String>> {
        let dialect = Dialect::new(handle.engine());
        let sql = dialect.table_list_sql(database);

        match handle.pool() {
            DbPool::MySql(pool) => {
                let rows = sqlx::raw_sql(&sql).fetch_all(pool).await?;
                rows.iter().map(|row| mysql_text(row, 0)).collect()
            }
            DbPool::Postgres(pool) => {
                let rows = sqlx::query(&sql).bind(Dialect::pg_schema(database)).fetch_all(pool).await?;
                Ok(rows.iter().map(|row| row.try_get::<String, _>(0)).collect::<Result<_, _>>()?)
            }
            DbPool::Sqlite(pool) => {
                let rows = sqlx::query(&sql).fetch_all(pool).await?;
                Ok(rows.iter().map(|row| row.try_get::<String, _>(0)).collect::<Result<_, _>>()?)
            }
        }
    }

    /// Column metadata for a table, in ordinal order.
    pub async fn table_schema(handle: &PooledHandle, database: &str, table: &str) -> CoreResult<SchemaInfo> {
        let columns = match handle.pool() {
            DbPool::MySql(pool) => {
                let rows = sqlx::query(
                    r#"
                    SELECT
                        CAST(COLUMN_NAME AS CHAR) AS name,
                        CAST(COLUMN_TYPE AS CHAR) AS data_type,
                        CAST(IS_NULLABLE = 'YES' AS SIGNED) AS is_nullable,
                        CAST(COLUMN_DEFAULT AS CHAR) AS default_value,
                        CAST(COLUMN_KEY = 'PRI' AS SIGNED) AS is_primary_key,
                        CAST(COLUMN_KEY = 'UNI' AS SIGNED) AS is_unique
                    FROM information_schema.COLUMNS
                    WHERE TABLE_SCHEMA = COALESCE(NULLIF(?, ''), DATABASE())
                      AND TABLE_NAME = ?
                    ORDER BY ORDINAL_POSITION
                    "#,
                )
                .bind(database.trim())
                .bind(table)
                .fetch_all(pool)
                .await?;

                rows.iter()
                    .map(|row| {
                        Ok(ColumnDetail {
                            name: row.try_get("name")?,
                            data_type: row.try_get("data_type")?,
                            is_nullable: row.try_get::<i64, _>("is_nullable")? != 0,
                            default_value: row.try_get("default_value")?,
                            is_primary_key: row.try_get::<i64, _>("is_primary_key")? != 0,
                            is_unique: row.try_get::<i64, _>("is_unique")? != 0,
                        })
                    })
                    .collect::<Result<Vec<_>, sqlx::Error>>()?
            }
            DbPool::Postgres(pool) => {
                let rows = sqlx::query(
                    r#"
                    SELECT
                        c.column_name::text AS name,
                        c.data_type::text AS data_type,
                        c.is_nullable = 'YES' AS is_nullable,
                        c.column_default::text AS default_value,
                        EXISTS (
                            SELECT 1
                            FROM information_schema.table_constraints tc
                            JOIN information_schema.key_column_usage k
                              ON k.constraint_name = tc.constraint_name
                             AND k.table_schema = tc.table_schema
                             AND k.table_name = tc.table_name
                            WHERE tc.table_schema = c.table_schema
                              AND tc.table_name = c.table_name
                              AND tc.constraint_type = 'PRIMARY KEY'
                              AND k.column_name = c.column_name
                        ) AS is_primary_key,
                        EXISTS (
                            SELECT 1
                            FROM information_schema.table_constraints tc
                            JOIN information_schema.key_column_usage k
                              ON k.constraint_name = tc.constraint_name
                             AND k.table_schema = tc.table_schema
                             AND k.table_name = tc.table_name
                            WHERE tc.table_schema = c.table_schema
                              AND tc.table_name = c.table_name
                              AND tc.constraint_type = 'UNIQUE'
                              AND k.column_name = c.column_name
                              AND (
                                  SELECT COUNT(*)
                                  FROM information_schema.key_column_usage k2
                                  WHERE k2.constraint_name = tc.constraint_name
                                    AND k2.table_schema = tc.table_schema
                              ) = 1
                        ) AS is_unique
                    FROM information_schema.columns c
                    WHERE c.table_schema = $1
                      AND c.table_name = $2
                    ORDER BY c.ordinal_position
                    "#,
                )
                .bind(Dialect::pg_schema(database))
                .bind(table)
                .fetch_all(pool)
                .await?;

                rows.iter()
                    .map(|row| {
                        Ok(ColumnDetail {
                            name: row.try_get("name")?,
                            data_type: row.try_get("data_type")?,
                            is_nullable: row.try_get("is_nullable")?,
                            default_value: row.try_get("default_value")?,
                            is_primary_key: row.try_get("is_primary_key")?,
                            is_unique: row.try_get("is_unique")?,
                        })
                    })
                    .collect::<Result<Vec<_>, sqlx::Error>>()?
            }
            DbPool::Sqlite(pool) => {
                let dialect = Dialect::new(EngineKind::Sqlite);
                let rows = sqlx::query(&format!("PRAGMA table_info({})", dialect.quote_ident(table)))
                    .fetch_all(pool)
                    .await?;

                let unique_columns: Vec<String> = Self::table_indexes(handle, database, table)
                    .await?
                    .into_iter()
                    .filter(|idx| idx.is_unique && !idx.is_primary && idx.columns.len() == 1)
                    .flat_map(|idx| idx.columns)
                    .collect();

                rows.iter()
                    .map(|row| {
                        let name: String = row.try_get("name")?;
                        let is_unique = unique_columns.contains(&name);
                        Ok(ColumnDetail {
                            data_type: row.try_get("type")?,
                            is_nullable: row.try_get::<i64, _>("notnull")? == 0,
                            default_value: row.try_get("dflt_value")?,
                            is_primary_key: row.try_get::<i64, _>("pk")? > 0,
                            is_unique,
                            name,
                        })
                    })
                    .collect::<Result<Vec<_>, sqlx::Error>>()?
            }
        };

        if columns.is_empty() {
            return Err(CoreError::query(format!("table {table} does not exist")));
        }

        Ok(SchemaInfo { table: table.to_string(), columns })
    }

    /// Indexes of a table with their columns in key order.
    pub async fn table_indexes(handle: &PooledHandle, database: &str, table: &str) -> CoreResult<Vec<IndexInfo>> {
        let rows: Vec<(String, String, bool, bool)> = match handle.pool() {
            DbPool::MySql(pool) => {
                let rows = sqlx::query(
                    r#"
                    SELECT
                        CAST(INDEX_NAME AS CHAR) AS index_name,
                        CAST(COLUMN_NAME AS CHAR) AS column_name,
                        CAST(NON_UNIQUE AS SIGNED) AS non_unique
                    FROM information_schema.STATISTICS
                    WHERE TABLE_SCHEMA = COALESCE(NULLIF(?, ''), DATABASE())
                      AND TABLE_NAME = ?
                    ORDER BY INDEX_NAME, SEQ_IN_INDEX
                    "#,
                )
                .bind(database.trim())
                .bind(table)
                .fetch_all(pool)
                .await?;

                rows.iter()
                    .map(|row| {
                        let name: String = row.try_get("index_name")?;
                        let is_primary = name == "PRIMARY";
                        Ok((
                            name,
                            row.try_get("column_name")?,
                            row.try_get::<i64, _>("non_unique")? == 0,
                            is_primary,
                        ))
                    })
                    .collect::<Result<_, sqlx::Error>>()?
            }
            DbPool::Postgres(pool) => {
                let rows = sqlx::query(
                    r#"
                    SELECT
                        i.relname::text AS index_name,
                        a.attname::text AS column_name,
                        ix.indisunique AS is_unique,
                        ix.indisprimary AS is_primary
                    FROM pg_catalog.pg_index ix
                    JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
                    JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
                    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
                    JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord) ON true
                    JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
                    WHERE n.nspname = $1
                      AND t.relname = $2
                    ORDER BY i.relname, k.ord
                    "#,
                )
                .bind(Dialect::pg_schema(database))
                .bind(table)
                .fetch_all(pool)
                .await?;

                rows.iter()
                    .map(|row| {
                        Ok((
                            row.try_get("index_name")?,
                            row.try_get("column_name")?,
                            row.try_get("is_unique")?,
                            row.try_get("is_primary")?,
                        ))
                    })
                    .collect::<Result<_, sqlx::Error>>()?
            }
            DbPool::Sqlite(pool) => {
                let dialect = Dialect::new(EngineKind::Sqlite);
                let list = sqlx::query(&format!("PRAGMA index_list({})", dialect.quote_ident(table)))
                    .fetch_all(pool)
                    .await?;

                let mut indexes: Vec<(String, bool, bool)> = list
                    .iter()
                    .map(|row| {
                        let origin: String = row.try_get("origin")?;
                        Ok((row.try_get("name")?, row.try_get::<i64, _>("unique")? != 0, origin == "pk"))
                    })
                    .collect::<Result<_, sqlx::Error>>()?;
                indexes.sort_by(|a, b| a.0.cmp(&b.0));

                let mut rows = Vec::new();
                for (name, is_unique, is_primary) in indexes {
                    let info = sqlx::query(&format!("PRAGMA index_info({})", dialect.quote_ident(&name)))
                        .fetch_all(pool)
                        .await?;
                    for col in &info {
                        let column: Option<String> = col.try_get("name")?;
                        // Expression index keys have no column name.
                        rows.push((name.clone(), column.unwrap_or_default(), is_unique, is_primary));
                    }
                }
                rows
            }
        };

        Ok(group_indexes(rows))
    }

    /// `SELECT COUNT(*)` of a table.
    pub async fn table_row_count(handle: &PooledHandle, database: &str, table: &str) -> CoreResult<u64> {
        let sql = Dialect::new(handle.engine()).count_sql(database, table);
        let count: i64 = match handle.pool() {
            DbPool::MySql(pool) => sqlx::raw_sql(&sql).fetch_one(pool).await?.try_get(0)?,
            DbPool::Postgres(pool) => sqlx::raw_sql(&sql).fetch_one(pool).await?.try_get(0)?,
            DbPool::Sqlite(pool) => sqlx::raw_sql(&sql).fetch_one(pool).await?.try_get(0)?,
        };
        Ok(count.max(0) as u64)
    }

    /// One page of a table plus the table's total row count.
    ///
    /// Count and page are separate statements, so under concurrent writes
    /// `total` and the page may disagree.
    pub async fn table_data(
        handle: &PooledHandle,
        database: &str,
        table: &str,
        limit: u64,
        offset: u64,
    ) -> CoreResult<QueryResult> {
        let start = Instant::now();
        let total = Self::table_row_count(handle, database, table).await?;

        let sql = Dialect::new(handle.engine()).page_sql(database, table, limit, offset);
        let mut result = QueryService::raw_select(handle, &sql).await?;

        // An empty page carries no column metadata from the driver.
        if result.columns.is_empty() {
            let schema = Self::table_schema(handle, database, table).await?;
            result.columns = schema
                .columns
                .into_iter()
                .map(|c| ColumnInfo { name: c.name, type_name: c.data_type })
                .collect();
        }

        result.total = Some(total);
        result.execution_time_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(
            key = %handle.key(),
            table = %table,
            total,
            limit,
            offset,
            row_count = result.rows.len(),
            "Table page loaded"
        );
        Ok(result)
    }
}
