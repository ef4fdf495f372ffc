//! SurrealDB schema initialization
//!
//! Sets up the `run_results` table with its constraints and indexes.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all kmatrix tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    init_run_results_table(db).await?;
    info!("kmatrix schema initialization complete");
    Ok(())
}

/// Initialize `run_results` table with constraints and indexes
///
/// Schema:
/// ```text
/// TABLE run_results {
///   result_id:       INT (unique, assigned by the single writer)
///   tag:             STRING (indexed)
///   artifact:        STRING (indexed)
///   artifact_kind:   STRING
///   distro:          STRING
///   distro_version:  STRING
///   kernel_release:  STRING
///   attempt:         INT
///   verdict:         STRING
///   output:          STRING
///   artifact_digest: STRING?
///   started_at:      DATETIME (indexed)
///   finished_at:     DATETIME
///   duration_ms:     INT
/// }
/// ```
///
/// Rows are append-only: updates and deletes are not permitted.
async fn init_run_results_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing run_results table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS run_results
            SCHEMALESS
            PERMISSIONS
                FOR select, create FULL
                FOR update, delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_result_id ON TABLE run_results COLUMNS result_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_tag ON TABLE run_results COLUMNS tag;
        DEFINE INDEX IF NOT EXISTS idx_artifact ON TABLE run_results COLUMNS artifact;
        DEFINE INDEX IF NOT EXISTS idx_started_at ON TABLE run_results COLUMNS started_at;
    "#;

    db.query(sql).await?;
    debug!("run_results table initialized");
    Ok(())
}
