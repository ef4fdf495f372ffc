//! Run-result records and the `ResultStore` abstraction
//!
//! A `RunOutcome` is what one pipeline execution produces. Handing it to
//! [`ResultStore::append`] assigns a monotonically increasing [`ResultId`]
//! and yields the immutable [`RunResult`].
//!
//! All stores are async and backend-agnostic. An in-memory fake is provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Store-assigned identifier of a persisted result. Starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResultId(pub u64);

impl std::fmt::Display for ResultId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ResultId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(ResultId)
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Why an infrastructure failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraReason {
    /// The build provider failed or timed out.
    BuildFailed,
    /// The VM failed to boot; a boot that outlasts its timeout is a [`Verdict::Timeout`].
    LaunchFailed,
    /// The artifact or test script could not be copied into the guest.
    DeployFailed,
}

/// Terminal classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// The test script exited zero.
    Success,
    /// The test script exited nonzero without timing out.
    TestFailed,
    /// The run or provisioning timeout elapsed.
    Timeout,
    /// The environment failed; not attributable to the artifact.
    InfraError { reason: InfraReason },
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success)
    }

    /// Stable string form used for persistence and display.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Success => "success",
            Verdict::TestFailed => "test_failed",
            Verdict::Timeout => "timeout",
            Verdict::InfraError {
                reason: InfraReason::BuildFailed,
            } => "build_failed",
            Verdict::InfraError {
                reason: InfraReason::LaunchFailed,
            } => "launch_failed",
            Verdict::InfraError {
                reason: InfraReason::DeployFailed,
            } => "deploy_failed",
        }
    }

    /// Inverse of [`Verdict::label`].
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "success" => Some(Verdict::Success),
            "test_failed" => Some(Verdict::TestFailed),
            "timeout" => Some(Verdict::Timeout),
            "build_failed" => Some(Verdict::InfraError {
                reason: InfraReason::BuildFailed,
            }),
            "launch_failed" => Some(Verdict::InfraError {
                reason: InfraReason::LaunchFailed,
            }),
            "deploy_failed" => Some(Verdict::InfraError {
                reason: InfraReason::DeployFailed,
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Kernel target identity as recorded alongside a result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub distro: String,
    pub version: String,
    pub release: String,
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.distro, self.version, self.release)
    }
}

/// Everything one pipeline execution produced, before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Caller-supplied batch tag.
    pub tag: String,
    /// Artifact name.
    pub artifact: String,
    /// Artifact kind ("module" or "exploit").
    pub artifact_kind: String,
    /// Kernel the run targeted.
    pub target: TargetRef,
    /// 1-based attempt index within the batch.
    pub attempt: u32,
    /// Terminal classification.
    pub verdict: Verdict,
    /// Combined output captured across stages.
    pub output: String,
    /// SHA-256 of the deployed artifact, absent when nothing was built.
    pub artifact_digest: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Wall time measured by the pipeline, in milliseconds.
    pub duration_ms: u64,
}

/// A persisted, immutable run result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub id: ResultId,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

impl RunResult {
    pub fn verdict(&self) -> Verdict {
        self.outcome.verdict
    }
}

// ---------------------------------------------------------------------------
// Query filter
// ---------------------------------------------------------------------------

/// Ordering of query results by identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Constraints for [`ResultStore::query`]. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFilter {
    pub tag: Option<String>,
    pub artifact: Option<String>,
    /// Inclusive lower bound on `started_at`.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `started_at`.
    pub until: Option<DateTime<Utc>>,
    /// Keep only the first N results after ordering.
    pub limit: Option<usize>,
    pub order: SortOrder,
}

impl ResultFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Most recent N (with the default newest-first order).
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Whether `result` satisfies every predicate (ordering and limit aside).
    pub fn matches(&self, result: &RunResult) -> bool {
        let o = &result.outcome;
        self.tag.as_ref().map_or(true, |t| &o.tag == t)
            && self.artifact.as_ref().map_or(true, |a| &o.artifact == a)
            && self.since.map_or(true, |s| o.started_at >= s)
            && self.until.map_or(true, |u| o.started_at <= u)
    }
}

// ---------------------------------------------------------------------------
// ResultStore
// ---------------------------------------------------------------------------

/// Durable, append-only history of run results.
///
/// Guarantees:
/// - `append` assigns identifiers in strictly increasing order of completion
///   and has persisted the record when it returns.
/// - Appends are serialized; readers observe a consistent prefix.
/// - Persisted results are never modified.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist an outcome, returning it with its assigned identifier.
    async fn append(&self, outcome: RunOutcome) -> StorageResult<RunResult>;

    /// Fetch one result. Returns `StorageError::NotFound` if absent.
    async fn get(&self, id: ResultId) -> StorageResult<RunResult>;

    /// Results matching `filter`, ordered and truncated as it specifies.
    async fn query(&self, filter: &ResultFilter) -> StorageResult<Vec<RunResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(tag: &str, artifact: &str) -> RunResult {
        let now = Utc::now();
        RunResult {
            id: ResultId(1),
            outcome: RunOutcome {
                tag: tag.to_string(),
                artifact: artifact.to_string(),
                artifact_kind: "module".to_string(),
                target: TargetRef {
                    distro: "Ubuntu".to_string(),
                    version: "18.04".to_string(),
                    release: "4.15.0-20-generic".to_string(),
                },
                attempt: 1,
                verdict: Verdict::Success,
                output: String::new(),
                artifact_digest: None,
                started_at: now,
                finished_at: now,
                duration_ms: 0,
            },
        }
    }

    #[test]
    fn test_verdict_labels_roundtrip() {
        let all = [
            Verdict::Success,
            Verdict::TestFailed,
            Verdict::Timeout,
            Verdict::InfraError {
                reason: InfraReason::BuildFailed,
            },
            Verdict::InfraError {
                reason: InfraReason::LaunchFailed,
            },
            Verdict::InfraError {
                reason: InfraReason::DeployFailed,
            },
        ];
        for v in all {
            assert_eq!(Verdict::from_label(v.label()), Some(v));
        }
        assert_eq!(Verdict::from_label("exploded"), None);
    }

    #[test]
    fn test_verdict_serde_shape() {
        let v = Verdict::InfraError {
            reason: InfraReason::LaunchFailed,
        };
        let json = serde_json::to_value(v).unwrap();
        assert_eq!(json["verdict"], "infra_error");
        assert_eq!(json["reason"], "launch_failed");
    }

    #[test]
    fn test_filter_matches_tag_and_artifact() {
        let r = sample("nightly", "hello_mod");
        assert!(ResultFilter::new().matches(&r));
        assert!(ResultFilter::new().tag("nightly").matches(&r));
        assert!(!ResultFilter::new().tag("weekly").matches(&r));
        assert!(!ResultFilter::new()
            .tag("nightly")
            .artifact("other")
            .matches(&r));
    }

    #[test]
    fn test_filter_time_range_is_inclusive() {
        let r = sample("t", "a");
        let at = r.outcome.started_at;
        assert!(ResultFilter::new().since(at).until(at).matches(&r));
        assert!(!ResultFilter::new()
            .since(at + chrono::Duration::seconds(1))
            .matches(&r));
    }

    #[test]
    fn test_result_id_parses() {
        let id: ResultId = "17".parse().unwrap();
        assert_eq!(id, ResultId(17));
        assert!("x".parse::<ResultId>().is_err());
    }
}
