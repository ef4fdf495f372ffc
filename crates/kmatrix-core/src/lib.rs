//! kmatrix-core: kernel test-matrix orchestration
//!
//! Builds kernel modules and exploits against a matrix of kernel targets,
//! runs each build in a disposable VM, and reduces the recorded outcomes to
//! a pass/fail reliability decision.
//!
//! ## Layer 1 - Domain/Orchestration
//!
//! - `kernel`: catalog loading, rootfs fallback resolution, target selection
//! - `pipeline`: one build-launch-execute-teardown run
//! - `scheduler`: bounded worker pool under a global deadline
//! - `reliability`: rate and gate over stored results
//! - `orchestrate`: the batch entry point tying them together

pub mod artifact;
pub mod error;
pub mod exec;
pub mod fakes;
pub mod kernel;
pub mod orchestrate;
pub mod pipeline;
pub mod preflight;
pub mod provider;
pub mod reliability;
pub mod request;
pub mod scheduler;
pub mod telemetry;

pub use artifact::{Artifact, ArtifactKind, BuildSpec, SecurityToggles, VmSpec, ARTIFACT_FILE};
pub use error::{KmatrixError, Result};
pub use kernel::{
    select, CatalogSource, DistroVersion, FallbackReport, KernelCatalog, KernelDescriptor,
    KernelId,
};
pub use orchestrate::{BatchOutcome, Orchestrator, OrchestratorConfig, SelectionRequest};
pub use pipeline::{Pipeline, PipelineConfig, RunExecutor};
pub use provider::{
    BuildProvider, BuiltArtifact, DockerBuildProvider, ProviderError, QemuVmProvider, VmHandle,
    VmProvider,
};
pub use reliability::{GateVerdict, ReliabilityEvaluator, Tally, TimeoutPolicy};
pub use request::{expand_matrix, RunRequest};
pub use scheduler::{HaltHandle, HaltReason, ScheduleReport, Scheduler, SchedulerConfig};

pub use kmatrix_state::{
    InfraReason, ResultFilter, ResultId, ResultStore, RunOutcome, RunResult, SortOrder,
    StorageError, SurrealResultStore, TargetRef, Verdict,
};
