//! Error types for state tracking.

use thiserror::Error;

/// Errors that can occur while reading or updating pipeline state.
#[derive(Debug, Error)]
pub enum StateError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error creating the database directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A status column held an unknown value.
    #[error("Unknown unit status '{0}'")]
    InvalidStatus(String),

    /// A stage name was not recognised.
    #[error("Unknown stage '{0}'")]
    InvalidStage(String),

    /// A stored timestamp could not be parsed.
    #[error("Invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}
