//! Error types for the dbdeck core.
//!
//! `CoreError` is the internal error type of every service. It never reaches
//! the UI layer directly: boundary calls convert it with
//! [`CoreError::classify`] into a [`ClassifiedError`](crate::ClassifiedError).

use crate::classifier::{self, ClassifiedError};
use thiserror::Error;

/// Result alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Main error type for the dbdeck core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No pooled handle is registered under the requested key.
    #[error("connection not found: {connection_id}")]
    ConnectionNotFound {
        /// Connection id that was looked up.
        connection_id: String,
        /// Session id that was looked up (empty for the shared handle).
        session_id: String,
    },

    /// Engine tag that is not one of mysql, postgresql or sqlite.
    #[error("unsupported database type: {engine}")]
    UnsupportedEngine {
        /// The tag as received.
        engine: String,
    },

    /// Opening or verifying a database connection failed.
    #[error("{message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Error reported by the database while running a statement.
    #[error("{message}")]
    Query {
        /// Driver error message.
        message: String,
        /// SQLSTATE or vendor error code when the driver exposes one.
        code: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// SSH tunnel setup or forwarding error.
    #[error("SSH error: {message}")]
    Ssh {
        /// Human-readable error message.
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An EXPLAIN payload could not be parsed.
    #[error("invalid explain plan: {message}")]
    Explain {
        /// What was wrong with the payload.
        message: String,
    },

    /// A dump/restore tool is not installed or not on the PATH.
    #[error("{tool}: executable file not found in $PATH")]
    ToolNotFound {
        /// Binary name or configured path.
        tool: String,
    },

    /// A dump/restore process failed or could not be started.
    #[error("{message}")]
    Backup {
        /// Human-readable error message, including tool stderr when present.
        message: String,
    },

    /// A long-running operation was cancelled by the caller.
    #[error("operation cancelled: context canceled")]
    Cancelled,

    /// Caller supplied invalid input (empty path, missing field, ...).
    #[error("{message}")]
    InvalidInput {
        /// Human-readable error message.
        message: String,
    },

    /// Configuration could not be loaded.
    #[error("config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Local file I/O error.
    #[error("I/O error: {message}")]
    Io {
        /// Human-readable error message.
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl CoreError {
    // ========== Constructors ==========

    /// Create a connection-not-found error for a handle key.
    pub fn connection_not_found(connection_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::ConnectionNotFound { connection_id: connection_id.into(), session_id: session_id.into() }
    }

    /// Create an unsupported-engine error.
    pub fn unsupported_engine(engine: impl Into<String>) -> Self {
        Self::UnsupportedEngine { engine: engine.into() }
    }

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a query error that did not come from the driver.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query { message: message.into(), code: None, source: None }
    }

    /// Create a new SSH error.
    pub fn ssh(message: impl Into<String>) -> Self {
        Self::Ssh { message: message.into(), source: None }
    }

    /// Create a new SSH error with source.
    pub fn ssh_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Ssh { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new explain parse error.
    pub fn explain(message: impl Into<String>) -> Self {
        Self::Explain { message: message.into() }
    }

    /// Create a tool-not-found error.
    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Self::ToolNotFound { tool: tool.into() }
    }

    /// Create a new backup/restore error.
    pub fn backup(message: impl Into<String>) -> Self {
        Self::Backup { message: message.into() }
    }

    /// Create an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    // ========== Methods ==========

    /// Check if this error represents a cancelled operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Get the error category name, used as a structured logging field.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConnectionNotFound { .. } => "ConnectionNotFound",
            Self::UnsupportedEngine { .. } => "UnsupportedEngine",
            Self::Connection { .. } => "Connection",
            Self::Query { .. } => "Query",
            Self::Ssh { .. } => "SSH",
            Self::Explain { .. } => "Explain",
            Self::ToolNotFound { .. } => "ToolNotFound",
            Self::Backup { .. } => "Backup",
            Self::Cancelled => "Cancelled",
            Self::InvalidInput { .. } => "InvalidInput",
            Self::Config { .. } => "Config",
            Self::Io { .. } => "Io",
        }
    }

    /// Get the database error code (if applicable).
    pub fn db_code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Convert to the user-facing classified form.
    pub fn classify(&self) -> ClassifiedError {
        classifier::classify(Some(self))
    }
}

// ========== Error Conversions ==========

/// Convert from sqlx::Error to CoreError.
///
/// Database-reported errors keep their code; transport-level failures are
/// connection errors.
impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let code = db_err.code().map(|c| c.into_owned());
                CoreError::Query { message, code, source: Some(Box::new(sqlx::Error::Database(db_err))) }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => {
                CoreError::Connection { message: err.to_string(), source: Some(Box::new(err)) }
            }
            other => CoreError::Query { message: other.to_string(), code: None, source: Some(Box::new(other)) },
        }
    }
}

/// Convert from std::io::Error to CoreError.
impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io { message: err.to_string(), source: Some(err) }
    }
}

/// Convert from serde_json::Error to CoreError.
impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Config { message: format!("JSON error: {err}") }
    }
}

/// Convert from russh::Error to CoreError.
impl From<russh::Error> for CoreError {
    fn from(err: russh::Error) -> Self {
        CoreError::Ssh { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorCode;

    #[test]
    fn test_connection_not_found_classifies() {
        let err = CoreError::connection_not_found("conn-1", "");
        assert_eq!(err.to_string(), "connection not found: conn-1");
        assert_eq!(err.classify().code, Some(ErrorCode::ConnectionNotFound));
    }

    #[test]
    fn test_cancelled_maps_to_timeout() {
        let err = CoreError::Cancelled;
        assert!(err.is_cancelled());
        assert_eq!(err.classify().code, Some(ErrorCode::Timeout));
    }

    #[test]
    fn test_unsupported_engine_passes_through() {
        let err = CoreError::unsupported_engine("oracle");
        let classified = err.classify();
        assert_eq!(classified.code, None);
        assert_eq!(classified.message, "unsupported database type: oracle");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CoreError = io.into();
        assert_eq!(err.category(), "Io");
    }

    #[test]
    fn test_sqlx_pool_timeout_is_connection_error() {
        let err: CoreError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.category(), "Connection");
        assert!(err.db_code().is_none());
    }
}
