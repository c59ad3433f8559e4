//! Backend services for the dbdeck core.
//!
//! - `dialect` - Per-engine identifier quoting, qualification and DSNs
//! - `connection` - Pooled handle cache with liveness checks and retries
//! - `ssh_tunnel` - Local port forwarding through a jump host
//! - `query` - Raw statement execution with value normalization
//! - `schema` - Catalog listing, column/index metadata, pagination
//! - `explain` - EXPLAIN payload parsing
//! - `backup` - Dump/restore through the engines' command line tools

pub mod backup;
pub mod connection;
pub mod dialect;
pub mod explain;
pub mod query;
pub mod schema;
pub mod ssh_tunnel;

pub use backup::BackupService;
pub use connection::{ConnectionManager, DbPool, HandleKey, PooledHandle};
pub use dialect::Dialect;
pub use explain::{parse_explain_json, parse_mysql_explain_json, parse_sqlite_query_plan, QueryPlanRow};
pub use query::QueryService;
pub use schema::SchemaService;
pub use ssh_tunnel::TunnelManager;
