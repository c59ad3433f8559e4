//! Data models for the dbdeck core.
//!
//! This module contains all core data structures:
//! - `connection` - EngineKind, ConnectionSpec, SshTunnelSpec, SshAuth
//! - `query` - QueryResult, ColumnInfo
//! - `schema` - SchemaInfo, ColumnDetail, IndexInfo
//! - `plan` - PlanNode, ExplainPlan
//! - `backup` - BackupRecord

pub mod backup;
pub mod connection;
pub mod plan;
pub mod query;
pub mod schema;

pub use backup::BackupRecord;
pub use connection::{ConnectionSpec, EngineKind, SshAuth, SshTunnelSpec};
pub use plan::{ExplainPlan, PlanNode, PlanNodeKind};
pub use query::{ColumnInfo, QueryResult, Row};
pub use schema::{ColumnDetail, IndexInfo, SchemaInfo};
