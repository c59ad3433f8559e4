//! Schema introspection models.
//!
//! Engine-neutral shapes for table column and index metadata. They are
//! rebuilt per request; callers that want caching do it themselves.

use serde::{Deserialize, Serialize};

/// A table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDetail {
    /// Column name.
    pub name: String,
    /// Declared type (e.g., "int(11)", "character varying", "TEXT").
    pub data_type: String,
    /// Whether the column allows NULL values.
    pub is_nullable: bool,
    /// Default value expression, if any.
    pub default_value: Option<String>,
    /// Whether this column is part of the primary key.
    pub is_primary_key: bool,
    /// Whether this column alone carries a unique constraint or index.
    pub is_unique: bool,
}

/// Column metadata for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    /// Table name.
    pub table: String,
    /// Columns in ordinal order.
    pub columns: Vec<ColumnDetail>,
}

impl SchemaInfo {
    /// Names of the primary key columns, in ordinal order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Find a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDetail> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// An index on a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Index name.
    pub name: String,
    /// Indexed columns in key order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub is_unique: bool,
    /// Whether the index backs the primary key.
    pub is_primary: bool,
}
