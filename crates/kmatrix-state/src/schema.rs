//! SurrealDB row layout for persisted run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::records::{ResultId, RunOutcome, RunResult, TargetRef, Verdict};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// One row of the `run_results` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    /// SurrealDB record ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    /// Store-assigned sequential identifier
    pub result_id: u64,
    pub tag: String,
    pub artifact: String,
    pub artifact_kind: String,
    pub distro: String,
    pub distro_version: String,
    pub kernel_release: String,
    pub attempt: u32,
    /// `Verdict::label()` form
    pub verdict: String,
    pub output: String,
    pub artifact_digest: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ResultRow {
    pub fn new(id: ResultId, outcome: &RunOutcome) -> Self {
        ResultRow {
            id: None,
            result_id: id.0,
            tag: outcome.tag.clone(),
            artifact: outcome.artifact.clone(),
            artifact_kind: outcome.artifact_kind.clone(),
            distro: outcome.target.distro.clone(),
            distro_version: outcome.target.version.clone(),
            kernel_release: outcome.target.release.clone(),
            attempt: outcome.attempt,
            verdict: outcome.verdict.label().to_string(),
            output: outcome.output.clone(),
            artifact_digest: outcome.artifact_digest.clone(),
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
            duration_ms: outcome.duration_ms,
        }
    }

    pub fn into_result(self) -> Result<RunResult, StorageError> {
        let verdict = Verdict::from_label(&self.verdict).ok_or_else(|| {
            StorageError::InvalidRecord(format!(
                "result {} has unknown verdict {:?}",
                self.result_id, self.verdict
            ))
        })?;

        Ok(RunResult {
            id: ResultId(self.result_id),
            outcome: RunOutcome {
                tag: self.tag,
                artifact: self.artifact,
                artifact_kind: self.artifact_kind,
                target: TargetRef {
                    distro: self.distro,
                    version: self.distro_version,
                    release: self.kernel_release,
                },
                attempt: self.attempt,
                verdict,
                output: self.output,
                artifact_digest: self.artifact_digest,
                started_at: self.started_at,
                finished_at: self.finished_at,
                duration_ms: self.duration_ms,
            },
        })
    }
}

/// Projection used to recover the last assigned identifier on open.
#[derive(Debug, Deserialize)]
pub(crate) struct ResultIdRow {
    pub result_id: u64,
}
