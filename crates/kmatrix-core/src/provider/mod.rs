//! Contracts with the external build and VM subsystems.
//!
//! The pipeline only talks to these traits. Process-backed implementations
//! live in [`docker`] and [`qemu`]; scripted in-memory ones in
//! [`crate::fakes`].

pub mod docker;
pub mod qemu;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::artifact::{Artifact, VmSpec};
use crate::exec::CommandOutput;
use crate::kernel::KernelDescriptor;

pub use docker::DockerBuildProvider;
pub use qemu::QemuVmProvider;

/// Failure of a provider operation, before the pipeline classifies it.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("timed out after {limit_ms} ms")]
    Timeout { limit_ms: u64, output: String },

    #[error("{reason}")]
    Failed { reason: String, output: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    pub fn failed(reason: impl Into<String>, output: impl Into<String>) -> Self {
        ProviderError::Failed {
            reason: reason.into(),
            output: output.into(),
        }
    }

    pub fn timeout(limit: Duration, output: impl Into<String>) -> Self {
        ProviderError::Timeout {
            limit_ms: limit.as_millis() as u64,
            output: output.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Timeout { .. })
    }

    /// Output captured before the failure, if any.
    pub fn output(&self) -> &str {
        match self {
            ProviderError::Timeout { output, .. } | ProviderError::Failed { output, .. } => output,
            ProviderError::Io(_) => "",
        }
    }
}

/// A successfully built artifact inside a run's private workdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArtifact {
    pub path: PathBuf,
    pub output: String,
}

/// Builds an artifact against one kernel's headers.
#[async_trait]
pub trait BuildProvider: Send + Sync {
    /// Build inside `workdir`, which holds a private copy of the sources and
    /// belongs to this call alone.
    async fn build(
        &self,
        artifact: &Artifact,
        target: &KernelDescriptor,
        workdir: &Path,
        timeout: Duration,
    ) -> Result<BuiltArtifact, ProviderError>;
}

/// Boots disposable machines.
#[async_trait]
pub trait VmProvider: Send + Sync {
    /// Boot `target` and wait until the guest accepts commands, at most
    /// `timeout`.
    async fn launch(
        &self,
        target: &KernelDescriptor,
        spec: &VmSpec,
        timeout: Duration,
    ) -> Result<Box<dyn VmHandle>, ProviderError>;
}

/// A running machine. Dropping a handle without calling
/// [`VmHandle::shutdown`] must still tear the machine down.
#[async_trait]
pub trait VmHandle: Send {
    fn id(&self) -> &str;

    async fn copy_to_guest(
        &mut self,
        local: &Path,
        guest: &str,
        timeout: Duration,
    ) -> Result<(), ProviderError>;

    /// Run a shell command in the guest. A nonzero exit or a timeout is
    /// reported in the output, not as an error.
    async fn run(&mut self, command: &str, timeout: Duration)
        -> Result<CommandOutput, ProviderError>;

    async fn shutdown(&mut self) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_output() {
        let err = ProviderError::timeout(Duration::from_secs(2), "booting...");
        assert!(err.is_timeout());
        assert_eq!(err.output(), "booting...");
        assert_eq!(err.to_string(), "timed out after 2000 ms");

        let err = ProviderError::failed("make: *** [all] Error 2", "cc1: error");
        assert!(!err.is_timeout());
        assert_eq!(err.output(), "cc1: error");
    }
}
