//! Schedulable units of work.

use std::sync::Arc;

use crate::artifact::Artifact;
use crate::kernel::KernelDescriptor;

/// One (artifact, target, attempt) execution. Requests share no mutable
/// state; the `Arc`s only avoid copying read-only definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub artifact: Arc<Artifact>,
    pub target: Arc<KernelDescriptor>,
    /// 1-based.
    pub attempt: u32,
    pub tag: String,
}

impl RunRequest {
    pub fn label(&self) -> String {
        format!("{} on {} #{}", self.artifact.name, self.target, self.attempt)
    }
}

/// Expand targets × runs, target-major: every attempt of the first target,
/// then the next target.
pub fn expand_matrix(
    artifact: Arc<Artifact>,
    targets: &[KernelDescriptor],
    runs: u32,
    tag: &str,
) -> Vec<RunRequest> {
    targets
        .iter()
        .map(|t| Arc::new(t.clone()))
        .flat_map(|target| {
            let artifact = Arc::clone(&artifact);
            (1..=runs).map(move |attempt| RunRequest {
                artifact: Arc::clone(&artifact),
                target: Arc::clone(&target),
                attempt,
                tag: tag.to_string(),
            })
        })
        .collect()
}
