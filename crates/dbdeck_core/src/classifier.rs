//! Maps low-level driver and process errors onto a stable, user-facing code.
//!
//! The three supported engines report the same logical failure with
//! different text, and none of the drivers expose a typed error that is
//! stable across all of them. Classification is therefore an ordered table
//! of `(code, needles)` rows evaluated top to bottom against the lowercased
//! error text; the first row with a matching needle wins.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error codes surfaced to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionNotFound,
    ConnectionRefused,
    AccessDenied,
    SyntaxError,
    NotFound,
    DuplicateKey,
    Timeout,
}

impl ErrorCode {
    /// The wire form of the code, e.g. `CONNECTION_REFUSED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionNotFound => "CONNECTION_NOT_FOUND",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::DuplicateKey => "DUPLICATE_KEY",
            Self::Timeout => "TIMEOUT",
        }
    }

    /// Human message shown in place of the raw driver text.
    pub fn message(&self) -> &'static str {
        match self {
            Self::ConnectionNotFound => "Connection not found",
            Self::ConnectionRefused => "Connection refused, check that the server is running and reachable",
            Self::AccessDenied => "Access denied, check the username, password and privileges",
            Self::SyntaxError => "SQL syntax error",
            Self::NotFound => "The requested table or object does not exist",
            Self::DuplicateKey => "Duplicate key, a row with this unique value already exists",
            Self::Timeout => "The operation timed out or was cancelled",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-displayable error: a stable code plus a message.
///
/// An unrecognized error has no code and carries the original text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Stable code, `None` for passthrough errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    /// Message for display.
    pub message: String,
}

impl ClassifiedError {
    /// True for the result of classifying no error at all.
    pub fn is_empty(&self) -> bool {
        self.code.is_none() && self.message.is_empty()
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ClassifiedError {}

/// Classification table, most specific first.
const RULES: &[(ErrorCode, &[&str])] = &[
    (ErrorCode::ConnectionNotFound, &["connection not found", "no connection with id"]),
    (ErrorCode::ConnectionRefused, &["connection refused", "actively refused", "no route to host"]),
    (
        ErrorCode::AccessDenied,
        &[
            "access denied",
            "authentication failed",
            "password authentication",
            "permission denied",
            "not authorized",
        ],
    ),
    (ErrorCode::SyntaxError, &["syntax error", "error in your sql syntax"]),
    (
        ErrorCode::NotFound,
        &["doesn't exist", "does not exist", "no such table", "no such column", "unknown database", "unknown table"],
    ),
    (
        ErrorCode::DuplicateKey,
        &["duplicate key value", "duplicate entry", "unique constraint failed", "violates unique constraint"],
    ),
    (
        ErrorCode::Timeout,
        &["context deadline exceeded", "context canceled", "timed out", "timeout", "cancelled", "canceled"],
    ),
];

/// Classify an error by its display text.
///
/// `None` yields an empty [`ClassifiedError`].
pub fn classify<E>(err: Option<&E>) -> ClassifiedError
where
    E: fmt::Display + ?Sized,
{
    let Some(err) = err else {
        return ClassifiedError::default();
    };
    classify_message(&err.to_string())
}

/// Classify raw error text.
pub fn classify_message(text: &str) -> ClassifiedError {
    let lowered = text.to_lowercase();
    for (code, needles) in RULES {
        if needles.iter().any(|needle| lowered.contains(needle)) {
            return ClassifiedError { code: Some(*code), message: code.message().to_string() };
        }
    }
    ClassifiedError { code: None, message: text.to_string() }
}
