//! kmatrix-state: durable run-result storage
//!
//! This crate is the persistence layer of kmatrix. Every pipeline execution
//! ends as one `RunResult` appended here; reliability decisions and log
//! queries read it back.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: append durability, single-writer identifier assignment, and
//! filtered history queries.
//!
//! ## Key Components
//!
//! - `ResultStore`: the append/get/query contract
//! - `SurrealResultStore`: SurrealDB (SurrealKV on disk, or in-memory) backend
//! - `fakes::MemoryResultStore`: in-memory fake for tests

mod error;
pub mod fakes;
mod migrations;
pub mod records;
mod schema;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use records::{
    InfraReason, ResultFilter, ResultId, ResultStore, RunOutcome, RunResult, SortOrder,
    StorageResult, TargetRef, Verdict,
};
pub use surreal_store::SurrealResultStore;

/// Result type for kmatrix-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
