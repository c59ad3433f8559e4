//! Per-engine SQL fragments.
//!
//! Every path that builds SQL around a user-supplied identifier goes through
//! [`Dialect::quote_ident`] or [`Dialect::qualified_table`]. Nothing else in
//! the crate formats identifiers.

use crate::models::{ConnectionSpec, EngineKind};

/// Default schema for unqualified PostgreSQL tables.
pub const DEFAULT_PG_SCHEMA: &str = "public";

/// Name reported for the single database of a SQLite file.
pub const SQLITE_MAIN_DATABASE: &str = "main";

/// SQL dialect of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    engine: EngineKind,
}

impl Dialect {
    pub fn new(engine: EngineKind) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    /// Quote an identifier, doubling any embedded quote character.
    pub fn quote_ident(&self, name: &str) -> String {
        match self.engine {
            EngineKind::MySql => format!("`{}`", name.replace('`', "``")),
            EngineKind::Postgres | EngineKind::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    /// Fully qualified table reference.
    ///
    /// MySQL qualifies with the database when one is given, PostgreSQL with
    /// the schema (defaulting to `public`), SQLite never qualifies.
    pub fn qualified_table(&self, database: &str, table: &str) -> String {
        let database = database.trim();
        match self.engine {
            EngineKind::MySql if database.is_empty() => self.quote_ident(table),
            EngineKind::MySql => format!("{}.{}", self.quote_ident(database), self.quote_ident(table)),
            EngineKind::Postgres => {
                let schema = if database.is_empty() { DEFAULT_PG_SCHEMA } else { database };
                format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
            }
            EngineKind::Sqlite => self.quote_ident(table),
        }
    }

    /// Schema name used for PostgreSQL catalog lookups.
    pub fn pg_schema(database: &str) -> &str {
        let database = database.trim();
        if database.is_empty() {
            DEFAULT_PG_SCHEMA
        } else {
            database
        }
    }

    /// Build the DSN for a spec, dialing `host:port` (which differs from the
    /// spec's own host when the connection goes through a tunnel).
    pub fn dsn(&self, spec: &ConnectionSpec, host: &str, port: u16) -> String {
        match self.engine {
            EngineKind::MySql => format!(
                "mysql://{}:{}@{}:{}/{}",
                url_encode(&spec.username),
                url_encode(&spec.password),
                host,
                port,
                url_encode(spec.database.trim())
            ),
            EngineKind::Postgres => {
                let database = if spec.database.trim().is_empty() { "postgres" } else { spec.database.trim() };
                format!(
                    "postgres://{}:{}@{}:{}/{}",
                    url_encode(&spec.username),
                    url_encode(&spec.password),
                    host,
                    port,
                    url_encode(database)
                )
            }
            EngineKind::Sqlite => format!("sqlite:{}", spec.database.trim()),
        }
    }

    /// DSN for the spec's own host and port.
    pub fn direct_dsn(&self, spec: &ConnectionSpec) -> String {
        self.dsn(spec, spec.host.trim(), spec.effective_port())
    }

    /// Catalog query listing databases; `None` for SQLite, which has only
    /// [`SQLITE_MAIN_DATABASE`].
    pub fn database_list_sql(&self) -> Option<&'static str> {
        match self.engine {
            EngineKind::MySql => Some("SHOW DATABASES"),
            EngineKind::Postgres => {
                Some("SELECT datname::text FROM pg_database WHERE datistemplate = false ORDER BY datname")
            }
            EngineKind::Sqlite => None,
        }
    }

    /// Catalog query listing tables; PostgreSQL binds the schema as `$1`.
    pub fn table_list_sql(&self, database: &str) -> String {
        match self.engine {
            EngineKind::MySql if database.trim().is_empty() => "SHOW TABLES".to_string(),
            EngineKind::MySql => format!("SHOW TABLES FROM {}", self.quote_ident(database.trim())),
            EngineKind::Postgres => {
                "SELECT tablename::text FROM pg_tables WHERE schemaname = $1 ORDER BY tablename".to_string()
            }
            EngineKind::Sqlite => {
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
                    .to_string()
            }
        }
    }

    /// Row count statement for a table.
    pub fn count_sql(&self, database: &str, table: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", self.qualified_table(database, table))
    }

    /// Page statement for a table.
    pub fn page_sql(&self, database: &str, table: &str, limit: u64, offset: u64) -> String {
        format!(
            "SELECT * FROM {} LIMIT {} OFFSET {}",
            self.qualified_table(database, table),
            limit,
            offset
        )
    }
}

impl From<EngineKind> for Dialect {
    fn from(engine: EngineKind) -> Self {
        Self::new(engine)
    }
}

/// Percent-encode the characters that carry meaning inside a DSN URL.
pub fn url_encode(input: &str) -> String {
    input
        .replace('%', "%25")
        .replace('#', "%23")
        .replace('&', "%26")
        .replace('@', "%40")
        .replace('?', "%3F")
        .replace('=', "%3D")
        .replace('+', "%2B")
        .replace(' ', "%20")
        .replace(':', "%3A")
        .replace('/', "%2F")
}

/// Remove the password from a DSN so it can be logged.
pub fn redact_dsn(dsn: &str) -> String {
    let Some(scheme_end) = dsn.find("://") else {
        return dsn.to_string();
    };
    let rest = &dsn[scheme_end + 3..];
    let Some(at) = rest.rfind('@') else {
        return dsn.to_string();
    };
    let userinfo = &rest[..at];
    match userinfo.find(':') {
        Some(colon) => format!("{}{}:***{}", &dsn[..scheme_end + 3], &userinfo[..colon], &rest[at..]),
        None => dsn.to_string(),
    }
}
