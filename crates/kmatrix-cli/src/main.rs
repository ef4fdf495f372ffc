//! kmatrix - kernel module / exploit test matrix runner
//!
//! Builds an artifact against every selected kernel target, runs it inside a
//! disposable VM, records each outcome and gates on the success rate.
//!
//! ## Commands
//!
//! - `pew`: test one artifact across the kernel matrix
//! - `pack`: test every artifact under a directory
//! - `kernel list`: show the resolved kernel catalog
//! - `gen module|exploit`: print a starter `.kmatrix.toml`
//! - `log query` / `log dump`: inspect recorded results
//!
//! Exit status: 0 when the gate passes, 1 when it fails, 2 on any error
//! (configuration, selection, storage).

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use kmatrix_core::{
    artifact, preflight, Artifact, ArtifactKind, CatalogSource, DockerBuildProvider, GateVerdict,
    HaltHandle, KernelCatalog, Orchestrator, OrchestratorConfig, PipelineConfig, QemuVmProvider,
    ReliabilityEvaluator, ResultFilter, ResultId, ResultStore, RunResult, SelectionRequest,
    SurrealResultStore, TimeoutPolicy, ARTIFACT_FILE,
};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "kmatrix")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Kernel module and exploit test matrix runner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct Settings {
    /// Kernel catalog (default: ~/.kmatrix/kernels.toml)
    #[arg(long, env = "KMATRIX_KERNELS", global = true)]
    kernels: Option<PathBuf>,

    /// Additional user catalog, merged after the main one if present
    /// (default: ~/.kmatrix/kernels.user.toml)
    #[arg(long, env = "KMATRIX_USER_KERNELS", global = true)]
    user_kernels: Option<PathBuf>,

    /// Result database directory (default: ~/.kmatrix/db)
    #[arg(long, env = "KMATRIX_DB", global = true)]
    db: Option<PathBuf>,

    /// SSH private key for guest access
    #[arg(long, env = "KMATRIX_SSH_KEY", global = true)]
    ssh_key: Option<PathBuf>,

    /// Stop starting new runs after this many seconds (0 = never)
    #[arg(long, default_value_t = 0, global = true)]
    timeout: u64,

    /// Per-run deploy and execute timeout, in seconds
    #[arg(long, default_value_t = 600, global = true)]
    qemu_timeout: u64,

    /// Per-run build timeout, in seconds
    #[arg(long, default_value_t = 600, global = true)]
    docker_timeout: u64,

    /// Per-run VM boot timeout, in seconds
    #[arg(long, default_value_t = 120, global = true)]
    provision_timeout: u64,

    /// Minimum success rate, in (0, 1]
    #[arg(long, default_value_t = 1.0, global = true)]
    threshold: f64,

    /// How timeouts count toward the rate: count or exclude
    #[arg(long, default_value = "count", value_parser = TimeoutPolicy::from_str, global = true)]
    timeout_policy: TimeoutPolicy,
}

#[derive(Args, Debug, Clone)]
struct SelectionArgs {
    /// Regular expression over "distro version release"
    #[arg(long)]
    kernel: Option<String>,

    /// Use every usable kernel
    #[arg(long)]
    guess: bool,

    /// Maximum number of kernels
    #[arg(long)]
    max: Option<usize>,
}

impl SelectionArgs {
    fn request(&self) -> SelectionRequest {
        let base = match (&self.kernel, self.guess) {
            (Some(pattern), false) => SelectionRequest::pattern(pattern.clone()),
            _ => SelectionRequest::all(),
        };
        base.with_max(self.max.unwrap_or(usize::MAX))
    }
}

#[derive(Args, Debug, Clone)]
struct BatchArgs {
    /// Concurrent runs (default: available parallelism)
    #[arg(long)]
    threads: Option<usize>,

    /// Tag recorded with every result (default: current unix time)
    #[arg(long)]
    tag: Option<String>,
}

impl BatchArgs {
    fn tag(&self) -> String {
        self.tag
            .clone()
            .unwrap_or_else(|| Utc::now().timestamp().to_string())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build and test one artifact across the kernel matrix
    Pew {
        /// Artifact directory containing .kmatrix.toml
        #[arg(long, default_value = ".")]
        path: PathBuf,

        /// Prebuilt binary to deploy instead of building
        #[arg(long)]
        binary: Option<PathBuf>,

        /// Test script to run in the guest
        #[arg(long)]
        test: Option<PathBuf>,

        /// Copy each built artifact into this directory
        #[arg(long)]
        dist: Option<PathBuf>,

        /// Attempts per kernel
        #[arg(long, default_value_t = 1)]
        runs: u32,

        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        batch: BatchArgs,
    },

    /// Test every artifact directory under a root
    Pack {
        /// Directory whose subdirectories hold artifacts
        root: PathBuf,

        /// Passes over each artifact; every pass is its own batch
        #[arg(long, default_value_t = 4)]
        exploit_runs: u32,

        /// Attempts per kernel within one pass
        #[arg(long, default_value_t = 1)]
        kernel_runs: u32,

        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        batch: BatchArgs,
    },

    /// Inspect the kernel catalog
    Kernel {
        #[command(subcommand)]
        action: KernelAction,
    },

    /// Print a starter .kmatrix.toml
    Gen {
        #[command(subcommand)]
        kind: GenKind,

        /// Artifact name (default: current directory name)
        #[arg(long, global = true)]
        name: Option<String>,
    },

    /// Inspect recorded results
    Log {
        #[command(subcommand)]
        action: LogAction,
    },
}

#[derive(Subcommand)]
enum KernelAction {
    /// List catalog entries after fallback resolution
    List,
}

#[derive(Subcommand)]
enum GenKind {
    /// Kernel module skeleton
    Module,
    /// Kernel exploit skeleton
    Exploit,
}

impl GenKind {
    fn artifact_kind(&self) -> ArtifactKind {
        match self {
            GenKind::Module => ArtifactKind::Module,
            GenKind::Exploit => ArtifactKind::Exploit,
        }
    }
}

#[derive(Subcommand)]
enum LogAction {
    /// Show the most recent results, newest first
    Query {
        /// Only results with this tag
        #[arg(long)]
        tag: Option<String>,

        /// Only results of this artifact
        #[arg(long, conflicts_with = "path")]
        artifact: Option<String>,

        /// Only results of the artifact defined in this directory
        #[arg(long)]
        path: Option<PathBuf>,

        /// Number of results
        #[arg(short, long, default_value_t = 50)]
        num: usize,

        /// Also print the success rate of the listed results
        #[arg(long)]
        rate: bool,
    },

    /// Show one result including its captured output
    Dump {
        /// Result identifier
        id: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    kmatrix_core::telemetry::init_tracing(cli.json, level);

    match dispatch(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

/// Returns whether the command's gate (if any) passed.
async fn dispatch(cli: Cli) -> Result<bool> {
    let settings = cli.settings;
    match cli.command {
        Commands::Pew {
            path,
            binary,
            test,
            dist,
            runs,
            selection,
            batch,
        } => {
            let overrides = PewOverrides { binary, test, dist };
            cmd_pew(&settings, &path, overrides, runs, &selection, &batch).await
        }
        Commands::Pack {
            root,
            exploit_runs,
            kernel_runs,
            selection,
            batch,
        } => {
            let passes = PackPasses {
                exploit_runs,
                kernel_runs,
            };
            cmd_pack(&settings, &root, passes, &selection, &batch).await
        }
        Commands::Kernel { action } => match action {
            KernelAction::List => cmd_kernel_list(&settings),
        },
        Commands::Gen { kind, name } => cmd_gen(kind, name),
        Commands::Log { action } => match action {
            LogAction::Query {
                tag,
                artifact,
                path,
                num,
                rate,
            } => {
                let artifact = match (artifact, path) {
                    (Some(name), _) => Some(name),
                    (None, Some(dir)) => Some(Artifact::load(&dir)?.name),
                    (None, None) => None,
                };
                cmd_log_query(&settings, tag.as_deref(), artifact.as_deref(), num, rate).await
            }
            LogAction::Dump { id } => cmd_log_dump(&settings, ResultId(id)).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn kmatrix_home() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".kmatrix"))
}

impl Settings {
    fn catalog_sources(&self) -> Result<Vec<CatalogSource>> {
        let kernels = match &self.kernels {
            Some(path) => path.clone(),
            None => kmatrix_home()?.join("kernels.toml"),
        };
        let user = match &self.user_kernels {
            Some(path) => path.clone(),
            None => kmatrix_home()?.join("kernels.user.toml"),
        };
        Ok(vec![
            CatalogSource::Required(kernels),
            CatalogSource::Optional(user),
        ])
    }

    fn db_path(&self) -> Result<PathBuf> {
        match &self.db {
            Some(path) => Ok(path.clone()),
            None => Ok(kmatrix_home()?.join("db")),
        }
    }

    fn orchestrator_config(
        &self,
        threads: Option<usize>,
        dist: Option<PathBuf>,
    ) -> Result<OrchestratorConfig> {
        let defaults = OrchestratorConfig::default();
        Ok(OrchestratorConfig {
            concurrency: threads.unwrap_or(defaults.concurrency),
            global_timeout: (self.timeout > 0).then(|| Duration::from_secs(self.timeout)),
            pipeline: PipelineConfig {
                build_timeout: Duration::from_secs(self.docker_timeout),
                provision_timeout: Duration::from_secs(self.provision_timeout),
                run_timeout: Duration::from_secs(self.qemu_timeout),
                dist_dir: dist,
            },
            threshold: self.threshold,
            timeout_policy: self.timeout_policy,
        })
    }
}

fn load_catalog(settings: &Settings) -> Result<KernelCatalog> {
    let mut catalog = KernelCatalog::load(&settings.catalog_sources()?)?;
    let report = catalog.resolve_fallbacks();
    info!(
        kernels = catalog.len(),
        substituted = report.substituted.len(),
        unusable = report.unusable.len(),
        "kernel catalog resolved"
    );
    Ok(catalog)
}

async fn open_store(settings: &Settings) -> Result<Arc<SurrealResultStore>> {
    let path = settings.db_path()?;
    let store = SurrealResultStore::open(&path)
        .await
        .with_context(|| format!("Failed to open result database at {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn orchestrator(
    settings: &Settings,
    threads: Option<usize>,
    dist: Option<PathBuf>,
) -> Result<Orchestrator> {
    let config = settings.orchestrator_config(threads, dist)?;
    let store = open_store(settings).await?;

    let mut qemu = QemuVmProvider::new();
    if let Some(key) = &settings.ssh_key {
        qemu = qemu.with_ssh_key(key);
    }

    let orch = Orchestrator::new(
        Arc::new(DockerBuildProvider::default()),
        Arc::new(qemu),
        store,
        config,
    )?;
    cancel_on_ctrl_c(orch.halt_handle());
    Ok(orch)
}

/// Exit status after a second interrupt (128 + SIGINT).
const FORCED_EXIT: i32 = 130;

/// First Ctrl-C stops new starts; running VMs finish under their own
/// timeouts. A second one exits at once.
fn cancel_on_ctrl_c(halt: HaltHandle) {
    tokio::spawn(async move {
        if await_interrupts(tokio::signal::ctrl_c, &halt).await {
            eprintln!("aborted");
            std::process::exit(FORCED_EXIT);
        }
    });
}

/// Cancels `halt` on the first interrupt. Returns true once a second
/// interrupt arrives, false if signal handling is unavailable.
async fn await_interrupts<F, Fut>(mut interrupt: F, halt: &HaltHandle) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if interrupt().await.is_err() {
        return false;
    }
    warn!("interrupted, waiting for running VMs to finish (Ctrl-C again to abort)");
    halt.cancel();
    interrupt().await.is_ok()
}

/// Docker must be present and usable when anything is built.
async fn check_host(needs_build: bool) -> Result<()> {
    preflight::check_required_tools(&preflight::required_tools(needs_build))?;
    if needs_build {
        preflight::check_docker_access(Path::new("docker")).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn result_line(result: &RunResult) -> String {
    let o = &result.outcome;
    format!(
        "{:>6}  {:<24} {:<36} #{:<3} {:<14} {:>8}ms",
        result.id,
        o.artifact,
        o.target.to_string(),
        o.attempt,
        o.verdict.label(),
        o.duration_ms
    )
}

fn print_gate(gate: &GateVerdict) {
    println!();
    println!(
        "success {} / test_failed {} / timeout {} / infra_error {}",
        gate.tally.success, gate.tally.test_failed, gate.tally.timeout, gate.tally.infra_error
    );
    println!("{}", gate.message);
    println!("{}", if gate.passed { "PASS" } else { "FAIL" });
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// `pew` flags that override the artifact definition.
struct PewOverrides {
    binary: Option<PathBuf>,
    test: Option<PathBuf>,
    dist: Option<PathBuf>,
}

async fn cmd_pew(
    settings: &Settings,
    path: &Path,
    overrides: PewOverrides,
    runs: u32,
    selection: &SelectionArgs,
    batch: &BatchArgs,
) -> Result<bool> {
    let mut artifact = Artifact::load(path)?;
    if let Some(binary) = overrides.binary {
        artifact = artifact.with_binary(binary);
    }
    if let Some(test) = overrides.test {
        artifact = artifact.with_test_script(test);
    }

    check_host(artifact.binary.is_none()).await?;
    let catalog = load_catalog(settings)?;
    let orch = orchestrator(settings, batch.threads, overrides.dist).await?;

    let tag = batch.tag();
    info!(artifact = %artifact.name, tag = %tag, "starting batch");
    let outcome = orch
        .run(&catalog, artifact, &selection.request(), runs, &tag)
        .await?;

    for result in &outcome.report.persisted {
        println!("{}", result_line(result));
    }
    if let Some(reason) = outcome.report.halted_by {
        println!(
            "{} runs not started ({})",
            outcome.report.not_started, reason
        );
    }
    print_gate(&outcome.gate);
    Ok(outcome.gate.passed)
}

/// Immediate subdirectories of `root` holding an artifact definition.
fn pack_artifacts(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("Failed to read pack directory {}", root.display()))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() && path.join(ARTIFACT_FILE).is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// How often `pack` exercises each artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PackPasses {
    /// Separate batches per artifact.
    exploit_runs: u32,
    /// Attempts per kernel inside each batch.
    kernel_runs: u32,
}

async fn cmd_pack(
    settings: &Settings,
    root: &Path,
    passes: PackPasses,
    selection: &SelectionArgs,
    batch: &BatchArgs,
) -> Result<bool> {
    if passes.exploit_runs == 0 {
        bail!("--exploit-runs must be at least 1");
    }
    let dirs = pack_artifacts(root)?;
    if dirs.is_empty() {
        bail!("no artifacts ({}) under {}", ARTIFACT_FILE, root.display());
    }
    let artifacts = dirs
        .iter()
        .map(Artifact::load)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    check_host(artifacts.iter().any(|a| a.binary.is_none())).await?;
    let catalog = load_catalog(settings)?;
    let orch = orchestrator(settings, batch.threads, None).await?;

    let tag = batch.tag();
    let since = Utc::now();
    'pack: for artifact in artifacts {
        for pass in 1..=passes.exploit_runs {
            info!(artifact = %artifact.name, pass, tag = %tag, "starting pack entry");
            let report = orch
                .schedule(
                    &catalog,
                    artifact.clone(),
                    &selection.request(),
                    passes.kernel_runs,
                    &tag,
                )
                .await?;
            for result in &report.persisted {
                println!("{}", result_line(result));
            }
            if report.halted_by.is_some() {
                break 'pack;
            }
        }
    }

    let gate = orch
        .evaluate(&ResultFilter::new().tag(tag).since(since))
        .await?;
    print_gate(&gate);
    Ok(gate.passed)
}

fn cmd_kernel_list(settings: &Settings) -> Result<bool> {
    let catalog = load_catalog(settings)?;
    for kernel in catalog.iter() {
        match &kernel.rootfs_path {
            Some(rootfs) => println!("{}  ({})", kernel, rootfs.display()),
            None => println!("{}  (unusable: no rootfs)", kernel),
        }
    }
    Ok(true)
}

fn cmd_gen(kind: GenKind, name: Option<String>) -> Result<bool> {
    let name = match name {
        Some(name) => name,
        None => default_artifact_name()?,
    };
    print!("{}", artifact::skeleton(kind.artifact_kind(), &name));
    Ok(true)
}

fn default_artifact_name() -> Result<String> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string()))
}

fn log_filter(tag: Option<&str>, artifact: Option<&str>, num: usize) -> ResultFilter {
    let mut filter = ResultFilter::new().limit(num);
    if let Some(tag) = tag {
        filter = filter.tag(tag);
    }
    if let Some(artifact) = artifact {
        filter = filter.artifact(artifact);
    }
    filter
}

async fn cmd_log_query(
    settings: &Settings,
    tag: Option<&str>,
    artifact: Option<&str>,
    num: usize,
    rate: bool,
) -> Result<bool> {
    let store = open_store(settings).await?;
    let filter = log_filter(tag, artifact, num);

    let results = store.query(&filter).await?;
    if results.is_empty() {
        println!("No results found");
        return Ok(true);
    }
    for result in &results {
        println!("{}", result_line(result));
    }

    if rate {
        let evaluator = ReliabilityEvaluator::new(settings.threshold, settings.timeout_policy)?;
        match evaluator.evaluate(&results).rate {
            Some(r) => println!("\nsuccess rate: {:.2}", r),
            None => println!("\nsuccess rate: n/a"),
        }
    }
    Ok(true)
}

async fn cmd_log_dump(settings: &Settings, id: ResultId) -> Result<bool> {
    let store = open_store(settings).await?;
    let result = store.get(id).await?;
    let o = &result.outcome;

    println!("id:       {}", result.id);
    println!("tag:      {}", o.tag);
    println!("artifact: {} ({})", o.artifact, o.artifact_kind);
    println!("kernel:   {}", o.target);
    println!("attempt:  {}", o.attempt);
    println!("verdict:  {}", o.verdict);
    if let Some(digest) = &o.artifact_digest {
        println!("sha256:   {}", digest);
    }
    println!(
        "started:  {}",
        o.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("duration: {}ms", o.duration_ms);
    println!();
    print!("{}", o.output);
    Ok(true)
}
