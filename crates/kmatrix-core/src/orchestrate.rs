//! Batch entry point: select, expand, schedule, evaluate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kmatrix_state::{ResultFilter, ResultStore};
use tokio::time::Instant;
use tracing::{info, instrument};

use crate::artifact::Artifact;
use crate::error::{KmatrixError, Result};
use crate::kernel::{select, KernelCatalog};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::provider::{BuildProvider, VmProvider};
use crate::reliability::{GateVerdict, ReliabilityEvaluator, TimeoutPolicy};
use crate::request::expand_matrix;
use crate::scheduler::{HaltHandle, ScheduleReport, Scheduler, SchedulerConfig};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub concurrency: usize,
    /// Measured from orchestrator creation; `None` never expires.
    pub global_timeout: Option<Duration>,
    pub pipeline: PipelineConfig,
    pub threshold: f64,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            concurrency: SchedulerConfig::default().concurrency,
            global_timeout: None,
            pipeline: PipelineConfig::default(),
            threshold: 1.0,
            timeout_policy: TimeoutPolicy::Count,
        }
    }
}

/// Which catalog entries a batch exercises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRequest {
    pub pattern: String,
    pub guess_all: bool,
    pub max: usize,
}

impl SelectionRequest {
    pub fn pattern(pattern: impl Into<String>) -> Self {
        SelectionRequest {
            pattern: pattern.into(),
            guess_all: false,
            max: usize::MAX,
        }
    }

    pub fn all() -> Self {
        SelectionRequest {
            pattern: String::new(),
            guess_all: true,
            max: usize::MAX,
        }
    }

    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub rate: Option<f64>,
    pub gate: GateVerdict,
    pub report: ScheduleReport,
}

pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn ResultStore>,
    concurrency: usize,
    deadline: Option<Instant>,
    evaluator: ReliabilityEvaluator,
    halt: HaltHandle,
}

impl Orchestrator {
    /// Fails with `Config` for an invalid threshold.
    pub fn new(
        builder: Arc<dyn BuildProvider>,
        vms: Arc<dyn VmProvider>,
        store: Arc<dyn ResultStore>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let evaluator = ReliabilityEvaluator::new(config.threshold, config.timeout_policy)?;
        Ok(Orchestrator {
            pipeline: Arc::new(Pipeline::new(builder, vms, config.pipeline)),
            store,
            concurrency: config.concurrency.max(1),
            deadline: config.global_timeout.map(|t| Instant::now() + t),
            evaluator,
            halt: HaltHandle::new(),
        })
    }

    /// Cancelling this handle stops new starts in every later batch too.
    pub fn halt_handle(&self) -> HaltHandle {
        self.halt.clone()
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Select targets and run `runs` attempts on each.
    ///
    /// Returns `Store` if any result could not be persisted.
    #[instrument(skip_all, fields(artifact = %artifact.name, runs = runs, tag = tag))]
    pub async fn schedule(
        &self,
        catalog: &KernelCatalog,
        artifact: Artifact,
        selection: &SelectionRequest,
        runs: u32,
        tag: &str,
    ) -> Result<ScheduleReport> {
        if runs == 0 {
            return Err(KmatrixError::Config("runs must be at least 1".to_string()));
        }
        let targets = select(catalog, &selection.pattern, selection.guess_all, selection.max)?;
        info!(targets = targets.len(), "targets selected");

        let requests = expand_matrix(Arc::new(artifact), &targets, runs, tag);
        let scheduler = Scheduler::new(
            self.pipeline.clone(),
            Arc::clone(&self.store),
            SchedulerConfig {
                concurrency: self.concurrency,
                deadline: self.deadline,
            },
        )
        .with_halt(self.halt.clone());

        let mut report = scheduler.run(requests).await;
        if let Some(e) = report.store_error.take() {
            return Err(KmatrixError::Store(e));
        }
        Ok(report)
    }

    /// Schedule one artifact and gate on the results of this batch.
    pub async fn run(
        &self,
        catalog: &KernelCatalog,
        artifact: Artifact,
        selection: &SelectionRequest,
        runs: u32,
        tag: &str,
    ) -> Result<BatchOutcome> {
        let since = Utc::now();
        let name = artifact.name.clone();

        let report = self.schedule(catalog, artifact, selection, runs, tag).await?;
        let gate = self
            .evaluate(&ResultFilter::new().tag(tag).artifact(name).since(since))
            .await?;

        info!(passed = gate.passed, rate = ?gate.rate, "{}", gate.message);
        Ok(BatchOutcome {
            rate: gate.rate,
            gate,
            report,
        })
    }

    /// Gate over whatever the store holds for `filter`.
    pub async fn evaluate(&self, filter: &ResultFilter) -> Result<GateVerdict> {
        let results = self.store.query(filter).await?;
        Ok(self.evaluator.evaluate(&results))
    }
}
