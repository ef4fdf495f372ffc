//! Error taxonomy for kmatrix orchestration.
//!
//! Only failures that stop a batch are errors. Per-run failures (build,
//! launch, test, timeout) are classified into a `Verdict` and recorded.

use kmatrix_state::{StateError, StorageError};

/// kmatrix orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum KmatrixError {
    /// Malformed or missing kernel catalog, artifact definition or setting.
    /// Raised before any pipeline starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// No usable catalog entry matches the request.
    #[error("no kernel selected for pattern {pattern:?}: {reason}")]
    Selection { pattern: String, reason: String },

    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    /// Persistence failed; no further runs are started.
    #[error("result store failure: {0}")]
    Store(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StateError> for KmatrixError {
    fn from(err: StateError) -> Self {
        KmatrixError::Store(StorageError::State(err))
    }
}

impl From<toml::de::Error> for KmatrixError {
    fn from(err: toml::de::Error) -> Self {
        KmatrixError::Config(err.to_string())
    }
}

/// Result type for kmatrix orchestration operations.
pub type Result<T> = std::result::Result<T, KmatrixError>;
