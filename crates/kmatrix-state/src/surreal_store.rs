//! SurrealDB-backed ResultStore implementation
//!
//! Uses `schema::ResultRow` for persistence, converting to/from
//! `records` types at the boundary. Appends go through a single writer lock
//! that owns the identifier counter, so identifiers follow commit order.

use std::path::Path;

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::records::{
    ResultFilter, ResultId, ResultStore, RunOutcome, RunResult, SortOrder, StorageResult,
};
use crate::schema::{ResultIdRow, ResultRow};

const NAMESPACE: &str = "kmatrix";
const DATABASE: &str = "results";

/// SurrealDB-backed implementation of [`ResultStore`].
pub struct SurrealResultStore {
    db: Surreal<Any>,
    /// Last identifier handed out; holding the guard is the write permit.
    writer: Mutex<u64>,
}

impl SurrealResultStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let store = Self::connect("mem://").await?;
        info!("SurrealResultStore connected (in-memory)");
        Ok(store)
    }

    /// Open (or create) an on-disk store under `path` using SurrealKV.
    pub async fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        let store = Self::connect(&url).await?;
        info!(path = %path.display(), "SurrealResultStore opened");
        Ok(store)
    }

    async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        let last_id = Self::load_last_id(&db).await?;
        debug!(last_id, "recovered result counter");

        Ok(Self {
            db,
            writer: Mutex::new(last_id),
        })
    }

    async fn load_last_id(db: &Surreal<Any>) -> crate::Result<u64> {
        let mut res = db
            .query("SELECT result_id FROM run_results ORDER BY result_id DESC LIMIT 1")
            .await?;
        let rows: Vec<ResultIdRow> = res.take(0)?;
        Ok(rows.first().map(|r| r.result_id).unwrap_or(0))
    }

    fn build_query(filter: &ResultFilter) -> String {
        let mut clauses = Vec::new();
        if filter.tag.is_some() {
            clauses.push("tag = $tag");
        }
        if filter.artifact.is_some() {
            clauses.push("artifact = $artifact");
        }
        if filter.since.is_some() {
            clauses.push("started_at >= $since");
        }
        if filter.until.is_some() {
            clauses.push("started_at <= $until");
        }

        let mut sql = String::from("SELECT * FROM run_results");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(match filter.order {
            SortOrder::NewestFirst => " ORDER BY result_id DESC",
            SortOrder::OldestFirst => " ORDER BY result_id ASC",
        });
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        sql
    }
}

#[async_trait]
impl ResultStore for SurrealResultStore {
    async fn append(&self, outcome: RunOutcome) -> StorageResult<RunResult> {
        let mut last = self.writer.lock().await;
        let id = ResultId(*last + 1);
        let row = ResultRow::new(id, &outcome);

        let _created: Option<ResultRow> = self
            .db
            .create("run_results")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        *last = id.0;
        debug!(result_id = %id, verdict = %outcome.verdict, "result appended");
        Ok(RunResult { id, outcome })
    }

    async fn get(&self, id: ResultId) -> StorageResult<RunResult> {
        let mut res = self
            .db
            .query("SELECT * FROM run_results WHERE result_id = $id")
            .bind(("id", id.0))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<ResultRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or(StorageError::NotFound { id })?
            .into_result()
    }

    async fn query(&self, filter: &ResultFilter) -> StorageResult<Vec<RunResult>> {
        let mut query = self.db.query(Self::build_query(filter));
        if let Some(tag) = &filter.tag {
            query = query.bind(("tag", tag.clone()));
        }
        if let Some(artifact) = &filter.artifact {
            query = query.bind(("artifact", artifact.clone()));
        }
        if let Some(since) = filter.since {
            query = query.bind(("since", SurrealDatetime::from(since)));
        }
        if let Some(until) = filter.until {
            query = query.bind(("until", SurrealDatetime::from(until)));
        }

        let mut res = query
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<ResultRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().map(ResultRow::into_result).collect()
    }
}
