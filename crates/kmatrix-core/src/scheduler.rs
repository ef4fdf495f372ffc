//! Bounded-concurrency execution of a request matrix under a deadline.
//!
//! `concurrency` workers pull requests from one FIFO queue. Before each pull a
//! worker checks the halt state and the deadline; once either trips, no new
//! request starts, while runs already in flight finish under their own
//! timeouts and are still persisted. A store failure halts new starts
//! immediately.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use kmatrix_state::{ResultStore, RunOutcome, RunResult, StorageError};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::artifact::Artifact;
use crate::kernel::KernelDescriptor;
use crate::pipeline::RunExecutor;
use crate::request::{expand_matrix, RunRequest};

/// Why scheduling stopped before the queue drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Deadline,
    StoreFailure,
    /// External cancellation (e.g. Ctrl-C).
    Cancelled,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HaltReason::Deadline => "deadline reached",
            HaltReason::StoreFailure => "result store failure",
            HaltReason::Cancelled => "cancelled",
        })
    }
}

/// Shared stop signal. The first reason recorded wins.
#[derive(Debug, Clone)]
pub struct HaltHandle {
    tx: Arc<watch::Sender<Option<HaltReason>>>,
}

impl Default for HaltHandle {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        HaltHandle { tx: Arc::new(tx) }
    }
}

impl HaltHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop starting new runs.
    pub fn cancel(&self) {
        self.halt(HaltReason::Cancelled);
    }

    /// Returns `true` if this call set the reason.
    pub fn halt(&self, reason: HaltReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn reason(&self) -> Option<HaltReason> {
        *self.tx.borrow()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum simultaneous runs. Values below 1 are treated as 1.
    pub concurrency: usize,
    /// No run starts at or after this instant.
    pub deadline: Option<Instant>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            deadline: None,
        }
    }
}

/// What a [`Scheduler::run`] call did.
#[derive(Debug, Default)]
pub struct ScheduleReport {
    /// Persisted results, ordered by identifier.
    pub persisted: Vec<RunResult>,
    /// Outcomes of finished runs whose append failed.
    pub unpersisted: Vec<RunOutcome>,
    pub started: usize,
    pub not_started: usize,
    /// First append failure.
    pub store_error: Option<StorageError>,
    pub halted_by: Option<HaltReason>,
}

impl ScheduleReport {
    pub fn completed(&self) -> usize {
        self.persisted.len() + self.unpersisted.len()
    }
}

struct Shared {
    queue: Mutex<VecDeque<RunRequest>>,
    persisted: Mutex<Vec<RunResult>>,
    unpersisted: Mutex<Vec<RunOutcome>>,
    store_error: Mutex<Option<StorageError>>,
    started: AtomicUsize,
}

pub struct Scheduler {
    executor: Arc<dyn RunExecutor>,
    store: Arc<dyn ResultStore>,
    config: SchedulerConfig,
    halt: HaltHandle,
}

impl Scheduler {
    pub fn new(
        executor: Arc<dyn RunExecutor>,
        store: Arc<dyn ResultStore>,
        config: SchedulerConfig,
    ) -> Self {
        Scheduler {
            executor,
            store,
            config,
            halt: HaltHandle::new(),
        }
    }

    /// Share an externally owned halt signal.
    pub fn with_halt(mut self, halt: HaltHandle) -> Self {
        self.halt = halt;
        self
    }

    pub fn halt_handle(&self) -> HaltHandle {
        self.halt.clone()
    }

    /// Targets × runs, target-major. See [`expand_matrix`].
    pub fn matrix(
        artifact: Arc<Artifact>,
        targets: &[KernelDescriptor],
        runs: u32,
        tag: &str,
    ) -> Vec<RunRequest> {
        expand_matrix(artifact, targets, runs, tag)
    }

    /// Drive `requests` to completion or until halted.
    #[instrument(skip_all, fields(requests = requests.len(), concurrency = self.config.concurrency))]
    pub async fn run(&self, requests: Vec<RunRequest>) -> ScheduleReport {
        let total = requests.len();
        let shared = Arc::new(Shared {
            queue: Mutex::new(requests.into()),
            persisted: Mutex::new(Vec::new()),
            unpersisted: Mutex::new(Vec::new()),
            store_error: Mutex::new(None),
            started: AtomicUsize::new(0),
        });

        let workers = self.config.concurrency.max(1).min(total.max(1));
        info!(total, workers, "scheduling started");

        let mut tasks = Vec::with_capacity(workers);
        for worker in 0..workers {
            let shared = Arc::clone(&shared);
            let executor = Arc::clone(&self.executor);
            let store = Arc::clone(&self.store);
            let halt = self.halt.clone();
            let deadline = self.config.deadline;

            tasks.push(tokio::spawn(async move {
                work(worker, shared, executor, store, halt, deadline).await;
            }));
        }

        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                error!(error = %e, "scheduler worker panicked");
            }
        }

        let started = shared.started.load(Ordering::SeqCst);
        let mut persisted = std::mem::take(&mut *shared.persisted.lock().await);
        persisted.sort_by_key(|r| r.id);
        let report = ScheduleReport {
            persisted,
            unpersisted: std::mem::take(&mut *shared.unpersisted.lock().await),
            started,
            not_started: total - started,
            store_error: shared.store_error.lock().await.take(),
            halted_by: self.halt.reason(),
        };

        info!(
            started = report.started,
            persisted = report.persisted.len(),
            not_started = report.not_started,
            halted_by = ?report.halted_by,
            "scheduling finished"
        );
        report
    }
}

async fn work(
    worker: usize,
    shared: Arc<Shared>,
    executor: Arc<dyn RunExecutor>,
    store: Arc<dyn ResultStore>,
    halt: HaltHandle,
    deadline: Option<Instant>,
) {
    loop {
        if let Some(reason) = halt.reason() {
            debug!(worker, %reason, "worker stopping");
            return;
        }
        let mut queue = shared.queue.lock().await;
        if queue.is_empty() {
            return;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            drop(queue);
            if halt.halt(HaltReason::Deadline) {
                warn!("global deadline reached, no new runs will start");
            }
            return;
        }
        let Some(request) = queue.pop_front() else {
            return;
        };
        drop(queue);
        shared.started.fetch_add(1, Ordering::SeqCst);
        debug!(worker, request = %request.label(), "run started");

        let outcome = executor.execute(&request).await;

        match store.append(outcome.clone()).await {
            Ok(result) => {
                debug!(worker, result_id = %result.id, verdict = %result.verdict(), "result persisted");
                shared.persisted.lock().await.push(result);
            }
            Err(e) => {
                error!(worker, error = %e, request = %request.label(), "failed to persist result");
                halt.halt(HaltReason::StoreFailure);
                let mut first = shared.store_error.lock().await;
                if first.is_none() {
                    *first = Some(e);
                }
                drop(first);
                shared.unpersisted.lock().await.push(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use kmatrix_state::fakes::MemoryResultStore;
    use kmatrix_state::Verdict;

    use super::*;
    use crate::artifact::ArtifactKind;

    /// Takes `work` of (virtual) time per run and records start order.
    struct SleepyExecutor {
        work: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
        starts: std::sync::Mutex<Vec<u32>>,
    }

    impl SleepyExecutor {
        fn new(work: Duration) -> Arc<Self> {
            Arc::new(SleepyExecutor {
                work,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                starts: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RunExecutor for SleepyExecutor {
        async fn execute(&self, request: &RunRequest) -> RunOutcome {
            self.starts.lock().unwrap().push(request.attempt);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.work).await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            RunOutcome {
                tag: request.tag.clone(),
                artifact: request.artifact.name.clone(),
                artifact_kind: request.artifact.kind.to_string(),
                target: request.target.target_ref(),
                attempt: request.attempt,
                verdict: Verdict::Success,
                output: String::new(),
                artifact_digest: None,
                started_at: Utc::now(),
                finished_at: Utc::now(),
                duration_ms: self.work.as_millis() as u64,
            }
        }
    }

    fn requests(n: u32) -> Vec<RunRequest> {
        let artifact = Arc::new(Artifact::new("m", ArtifactKind::Module, "/src"));
        let target = KernelDescriptor::new("Ubuntu", "18.04", "4.15.0", "/k", "/r");
        Scheduler::matrix(artifact, &[target], n, "t")
    }

    fn scheduler(
        executor: Arc<SleepyExecutor>,
        store: Arc<MemoryResultStore>,
        concurrency: usize,
        deadline: Option<Instant>,
    ) -> Scheduler {
        Scheduler::new(
            executor,
            store,
            SchedulerConfig {
                concurrency,
                deadline,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_new_starts() {
        let executor = SleepyExecutor::new(Duration::from_secs(2));
        let store = Arc::new(MemoryResultStore::new());
        let begin = Instant::now();
        let deadline = begin + Duration::from_secs(1);

        let report = scheduler(executor, store.clone(), 1, Some(deadline))
            .run(requests(5))
            .await;

        assert_eq!(report.persisted.len(), 1);
        assert_eq!(report.started, 1);
        assert_eq!(report.not_started, 4);
        assert_eq!(report.halted_by, Some(HaltReason::Deadline));
        assert_eq!(store.len(), 1);
        // the in-flight run finishes, nothing after it starts
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded_and_everything_persists() {
        let executor = SleepyExecutor::new(Duration::from_secs(1));
        let store = Arc::new(MemoryResultStore::new());

        let report = scheduler(executor.clone(), store, 3, None)
            .run(requests(10))
            .await;

        assert_eq!(executor.max_active.load(Ordering::SeqCst), 3);
        assert_eq!(report.started, 10);
        assert_eq!(report.not_started, 0);
        assert_eq!(report.halted_by, None);
        let ids: Vec<u64> = report.persisted.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_are_fifo() {
        let executor = SleepyExecutor::new(Duration::from_secs(1));
        let store = Arc::new(MemoryResultStore::new());

        scheduler(executor.clone(), store, 1, None)
            .run(requests(6))
            .await;

        assert_eq!(*executor.starts.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_halts_new_starts() {
        let executor = SleepyExecutor::new(Duration::from_secs(1));
        let store = Arc::new(MemoryResultStore::failing_after(2));

        let report = scheduler(executor, store, 1, None).run(requests(6)).await;

        assert_eq!(report.persisted.len(), 2);
        assert_eq!(report.unpersisted.len(), 1);
        assert_eq!(report.started, 3);
        assert_eq!(report.not_started, 3);
        assert_eq!(report.halted_by, Some(HaltReason::StoreFailure));
        assert!(report.store_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_new_starts() {
        let executor = SleepyExecutor::new(Duration::from_secs(2));
        let store = Arc::new(MemoryResultStore::new());
        let sched = scheduler(executor, store, 1, None);
        let halt = sched.halt_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            halt.cancel();
        });
        let report = sched.run(requests(5)).await;

        assert_eq!(report.started, 2);
        assert_eq!(report.persisted.len(), 2);
        assert_eq!(report.halted_by, Some(HaltReason::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_queue_returns_immediately() {
        let executor = SleepyExecutor::new(Duration::from_secs(1));
        let store = Arc::new(MemoryResultStore::new());

        let report = scheduler(executor, store, 4, None).run(Vec::new()).await;

        assert_eq!(report.started, 0);
        assert!(report.persisted.is_empty());
        assert_eq!(report.halted_by, None);
    }

    #[test]
    fn test_first_halt_reason_wins() {
        let halt = HaltHandle::new();
        assert!(halt.halt(HaltReason::Deadline));
        assert!(!halt.halt(HaltReason::Cancelled));
        assert_eq!(halt.reason(), Some(HaltReason::Deadline));
    }
}
