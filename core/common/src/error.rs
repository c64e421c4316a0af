//! Common error types for AnchorSync.

use thiserror::Error;

/// Top-level error type for AnchorSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller's observed record version is stale.
    #[error("Version conflict on {key}: expected version {expected}, stored version is {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    /// A record belongs to a zone outside the caller's scope.
    #[error("Zone mismatch on {key}: scope {expected:?}, record zone {found:?}")]
    ZoneMismatch {
        key: String,
        expected: Option<String>,
        found: Option<String>,
    },

    /// Sync refused to run because some paths are in conflict.
    #[error("Unresolved conflicts on {} path(s): {}", .0.len(), .0.join(", "))]
    UnresolvedConflicts(Vec<String>),

    /// The remote store answered with a non-success status.
    #[error("Remote rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// Network operation failed (timeout, connectivity).
    #[error("Network error: {0}")]
    Network(String),

    /// Concurrent writer detected (remote 409 or failed store precondition).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Some items of a batched operation failed.
    #[error("{} sync action(s) failed", .failures.len())]
    PartialFailure { failures: Vec<(String, Error)> },

    /// Local store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the failure is a connectivity problem rather than a refusal.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
