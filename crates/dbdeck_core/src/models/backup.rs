//! Backup history record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One completed backup. The append-only history is stored by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Connection the backup was taken from.
    pub connection_id: String,
    /// File the dump was written to.
    pub output_path: PathBuf,
    /// When the backup completed.
    pub timestamp: DateTime<Utc>,
}
