//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::RowStatus;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored JSON column could not be encoded or decoded.
    #[error("Invalid JSON in column '{column}': {source}")]
    Json {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A status update the row state machine does not allow.
    #[error("Row status cannot move from {from:?} to {to}")]
    InvalidTransition { from: Vec<RowStatus>, to: RowStatus },

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,
}
