//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryResultStore`, which satisfies the `ResultStore` contract
//! without any external dependencies and can be told to start failing after
//! a number of appends.

use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::records::*;

/// In-memory result store backed by a `Vec` in append order.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    results: RwLock<Vec<RunResult>>,
    fail_after: Option<usize>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose appends fail once `accepted` results have been stored.
    pub fn failing_after(accepted: usize) -> Self {
        Self {
            results: RwLock::new(Vec::new()),
            fail_after: Some(accepted),
        }
    }

    /// Number of persisted results.
    pub fn len(&self) -> usize {
        self.results.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn append(&self, outcome: RunOutcome) -> StorageResult<RunResult> {
        let mut results = self.results.write().unwrap();
        if self.fail_after.is_some_and(|n| results.len() >= n) {
            return Err(StorageError::Backend("injected append failure".to_string()));
        }
        let result = RunResult {
            id: ResultId(results.len() as u64 + 1),
            outcome,
        };
        results.push(result.clone());
        Ok(result)
    }

    async fn get(&self, id: ResultId) -> StorageResult<RunResult> {
        let results = self.results.read().unwrap();
        results
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StorageError::NotFound { id })
    }

    async fn query(&self, filter: &ResultFilter) -> StorageResult<Vec<RunResult>> {
        let results = self.results.read().unwrap();
        let mut matched: Vec<RunResult> =
            results.iter().filter(|r| filter.matches(r)).cloned().collect();
        if filter.order == SortOrder::NewestFirst {
            matched.reverse();
        }
        if let Some(n) = filter.limit {
            matched.truncate(n);
        }
        Ok(matched)
    }
}
