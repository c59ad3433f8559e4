//! Query execution models.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One result row; values are aligned with [`QueryResult::columns`].
pub type Row = Vec<JsonValue>;

/// Column metadata from query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Engine type name as reported by the driver (e.g. "INT4", "VARCHAR")
    pub type_name: String,
}

/// Results from query execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column metadata, in select order
    pub columns: Vec<ColumnInfo>,
    /// Result rows, normalized to JSON values
    pub rows: Vec<Row>,
    /// Total row count of the underlying table when the result is a page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Time to execute in milliseconds
    pub execution_time_ms: u64,
    /// Rows affected (for INSERT/UPDATE/DELETE and other mutations)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    /// Error text when the result carries a failure instead of rows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    /// Get the number of rows returned.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names in order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Look up a value by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&JsonValue> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        self.rows.get(row)?.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_lookup_by_column() {
        let result = QueryResult {
            columns: vec![
                ColumnInfo { name: "id".into(), type_name: "INTEGER".into() },
                ColumnInfo { name: "name".into(), type_name: "TEXT".into() },
            ],
            rows: vec![vec![json!(1), json!("ada")]],
            ..Default::default()
        };
        assert_eq!(result.column_names(), vec!["id", "name"]);
        assert_eq!(result.value(0, "name"), Some(&json!("ada")));
        assert_eq!(result.value(0, "missing"), None);
        assert_eq!(result.value(3, "id"), None);
        assert_eq!(result.row_count(), 1);
    }
}
