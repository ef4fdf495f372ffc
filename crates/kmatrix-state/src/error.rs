//! Error types for kmatrix-state

use thiserror::Error;

use crate::records::ResultId;

/// Errors raised while connecting to or preparing the result database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors produced by [`crate::ResultStore`] implementations.
///
/// Any of these surfacing from `append` is a StoreError for the scheduler:
/// it stops admitting new runs.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No result with this identifier has been persisted.
    #[error("run result not found: {id}")]
    NotFound { id: ResultId },

    /// The backend rejected or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A record could not be encoded for persistence.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A persisted row could not be decoded back into a result.
    #[error("invalid stored record: {0}")]
    InvalidRecord(String),

    /// The store could not be opened.
    #[error(transparent)]
    State(#[from] StateError),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
