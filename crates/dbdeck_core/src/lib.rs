//! Connection and operations core for the dbdeck database client.
//!
//! This crate is the layer between the UI and MySQL, PostgreSQL and SQLite:
//!
//! - **classifier**: Maps low-level error text to stable error codes
//! - **config**: Pool limits, retry policy, tunnel and backup tool settings
//! - **error**: Internal error type shared by every service
//! - **models**: Connection specs, query results, schema and plan records
//! - **services**: Pooled connections, SSH tunnels, queries, schema, explain, backups
//! - **state**: `DeckState`, the facade the UI talks to
//! - **logging**: Structured logging setup

pub mod classifier;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

pub use classifier::{classify, ClassifiedError, ErrorCode};
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use models::{
    BackupRecord, ColumnDetail, ColumnInfo, ConnectionSpec, EngineKind, ExplainPlan, IndexInfo, PlanNode,
    PlanNodeKind, QueryResult, SchemaInfo, SshAuth, SshTunnelSpec,
};
pub use services::{BackupService, ConnectionManager, Dialect, QueryService, SchemaService, TunnelManager};
pub use state::DeckState;
