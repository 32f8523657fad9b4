//! Error types for silt-core

use thiserror::Error;

/// Result type alias using silt-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in silt-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Remote backend cannot be reached right now
    ///
    /// This is the one recoverable condition: writes that hit it are queued
    /// for replay instead of failing, and flushes stop without error.
    #[error("Remote backend unavailable: {0}")]
    Unavailable(String),

    /// A mutation failed against a backend for a reason other than
    /// connectivity
    #[error("Operation execution failed: {0}")]
    Execution(String),

    /// Row not found
    #[error("Row not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A published snapshot artifact could not be retrieved
    #[error("Snapshot unavailable: {0}")]
    SnapshotMissing(String),
}

impl Error {
    /// Shorthand for the distinguished backend-unavailable condition.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    /// Whether this error is the backend-unavailable condition.
    ///
    /// Only this condition triggers queueing; every other remote failure
    /// propagates to the caller.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
