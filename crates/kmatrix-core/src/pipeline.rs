//! One run, end to end: build, launch, deploy & execute, teardown.
//!
//! Every stage failure is classified into a [`Verdict`]; nothing here returns
//! an error to the scheduler. Each run owns a private temporary workdir and
//! its own VM, so runs may execute fully in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kmatrix_state::{InfraReason, RunOutcome, Verdict};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::artifact::ArtifactKind;
use crate::exec::CommandOutput;
use crate::provider::{BuildProvider, ProviderError, VmHandle, VmProvider};
use crate::request::RunRequest;

const GUEST_DIR: &str = "/tmp";
const GUEST_TEST_SCRIPT: &str = "/tmp/kmatrix-test.sh";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub build_timeout: Duration,
    /// Bound on booting the VM until it accepts commands.
    pub provision_timeout: Duration,
    /// Bound on deploy & execute.
    pub run_timeout: Duration,
    /// Where built artifacts are copied, if anywhere.
    pub dist_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            build_timeout: Duration::from_secs(600),
            provision_timeout: Duration::from_secs(120),
            run_timeout: Duration::from_secs(600),
            dist_dir: None,
        }
    }
}

/// Carries one request to an outcome. The scheduler depends on this
/// rather than on [`Pipeline`] directly.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute(&self, request: &RunRequest) -> RunOutcome;
}

/// Combined output of all stages, each under a header line.
#[derive(Debug, Default)]
struct StageLog {
    text: String,
}

impl StageLog {
    fn section(&mut self, stage: &str, output: &str) {
        self.text.push_str(&format!("==> {stage}\n"));
        self.text.push_str(output);
        if !output.is_empty() && !output.ends_with('\n') {
            self.text.push('\n');
        }
    }

    fn note(&mut self, stage: &str, message: impl std::fmt::Display) {
        self.text.push_str(&format!("==> {stage}: {message}\n"));
    }

    fn command(&mut self, stage: &str, out: &CommandOutput) {
        self.section(stage, &out.output);
        if out.timed_out {
            self.note(stage, "timed out");
        } else if let Some(code) = out.exit_code {
            self.note(stage, format_args!("exit status {code}"));
        }
    }
}

fn infra(reason: InfraReason) -> Verdict {
    Verdict::InfraError { reason }
}

/// Remaining budget until `deadline`.
fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub struct Pipeline {
    builder: Arc<dyn BuildProvider>,
    vms: Arc<dyn VmProvider>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        builder: Arc<dyn BuildProvider>,
        vms: Arc<dyn VmProvider>,
        config: PipelineConfig,
    ) -> Self {
        Pipeline {
            builder,
            vms,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[instrument(
        skip_all,
        fields(
            artifact = %request.artifact.name,
            target = %request.target,
            attempt = request.attempt,
        )
    )]
    pub async fn run(&self, request: &RunRequest) -> RunOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut log = StageLog::default();

        let (verdict, artifact_digest) = self.stages(request, &mut log).await;

        let duration_ms = clock.elapsed().as_millis() as u64;
        info!(verdict = %verdict, duration_ms, "run finished");

        RunOutcome {
            tag: request.tag.clone(),
            artifact: request.artifact.name.clone(),
            artifact_kind: request.artifact.kind.to_string(),
            target: request.target.target_ref(),
            attempt: request.attempt,
            verdict,
            output: log.text,
            artifact_digest,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
        }
    }

    async fn stages(&self, request: &RunRequest, log: &mut StageLog) -> (Verdict, Option<String>) {
        // Dropped at the end of the run, removing the build tree.
        let workdir = match tempfile::Builder::new().prefix("kmatrix-run-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                log.note("build", format_args!("cannot create workdir: {e}"));
                return (infra(InfraReason::BuildFailed), None);
            }
        };

        let binary = match self.build(request, workdir.path(), log).await {
            Ok(path) => path,
            Err(verdict) => return (verdict, None),
        };
        let digest = match sha256_file(&binary).await {
            Ok(digest) => digest,
            Err(e) => {
                log.note("build", format_args!("cannot read artifact: {e}"));
                return (infra(InfraReason::BuildFailed), None);
            }
        };

        debug!("launching vm");
        let mut vm = match self
            .vms
            .launch(&request.target, &request.artifact.vm, self.config.provision_timeout)
            .await
        {
            Ok(vm) => vm,
            Err(e) => {
                log.section("launch", e.output());
                log.note("launch", &e);
                let verdict = if e.is_timeout() {
                    Verdict::Timeout
                } else {
                    infra(InfraReason::LaunchFailed)
                };
                warn!(error = %e, "launch failed");
                return (verdict, Some(digest));
            }
        };
        debug!(vm = vm.id(), "vm ready");

        let deadline = Instant::now() + self.config.run_timeout;
        let executed = tokio::time::timeout_at(
            deadline,
            self.deploy_and_execute(request, &binary, vm.as_mut(), deadline, log),
        )
        .await;
        let verdict = match executed {
            Ok(verdict) => verdict,
            Err(_) => {
                log.note("execute", "run timeout elapsed");
                Verdict::Timeout
            }
        };

        if let Err(e) = vm.shutdown().await {
            warn!(vm = vm.id(), error = %e, "teardown failed");
            log.note("teardown", &e);
        }

        (verdict, Some(digest))
    }

    /// Build into `workdir`, or take the prebuilt binary. Returns the path
    /// of the artifact to deploy.
    async fn build(
        &self,
        request: &RunRequest,
        workdir: &Path,
        log: &mut StageLog,
    ) -> Result<PathBuf, Verdict> {
        let artifact = &request.artifact;

        if let Some(binary) = &artifact.binary {
            let dest = workdir.join(artifact.deployed_name());
            return match tokio::fs::copy(binary, &dest).await {
                Ok(_) => {
                    log.note("build", format_args!("using prebuilt {}", binary.display()));
                    Ok(dest)
                }
                Err(e) => {
                    log.note("build", format_args!("cannot copy {}: {e}", binary.display()));
                    Err(infra(InfraReason::BuildFailed))
                }
            };
        }

        let source = workdir.join("src");
        let (from, to) = (artifact.source_dir.clone(), source.clone());
        let copied = tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(std::io::Error::other)
            .and_then(|r| r);
        if let Err(e) = copied {
            log.note("build", format_args!("cannot copy sources: {e}"));
            return Err(infra(InfraReason::BuildFailed));
        }

        debug!(workdir = %source.display(), "building");
        match self
            .builder
            .build(artifact, &request.target, &source, self.config.build_timeout)
            .await
        {
            Ok(built) => {
                log.section("build", &built.output);
                self.copy_to_dist(request, &built.path).await;
                Ok(built.path)
            }
            Err(e) => {
                warn!(error = %e, "build failed");
                log.section("build", e.output());
                log.note("build", &e);
                Err(infra(InfraReason::BuildFailed))
            }
        }
    }

    async fn copy_to_dist(&self, request: &RunRequest, built: &Path) {
        let Some(dir) = &self.config.dist_dir else {
            return;
        };
        let target = &request.target;
        let dest = dir.join(format!(
            "{}-{}-{}-{}",
            request.artifact.name, target.distro, target.version, target.release
        ));
        let copied = match tokio::fs::create_dir_all(dir).await {
            Ok(()) => tokio::fs::copy(built, &dest).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = copied {
            warn!(dest = %dest.display(), error = %e, "failed to copy artifact to dist");
        }
    }

    async fn deploy_and_execute(
        &self,
        request: &RunRequest,
        binary: &Path,
        vm: &mut dyn VmHandle,
        deadline: Instant,
        log: &mut StageLog,
    ) -> Verdict {
        let artifact = &request.artifact;
        let guest_artifact = format!("{GUEST_DIR}/{}", artifact.deployed_name());

        let deploy_failed = |e: &ProviderError| {
            if e.is_timeout() {
                Verdict::Timeout
            } else {
                infra(InfraReason::DeployFailed)
            }
        };

        for (local, guest) in [
            (binary, guest_artifact.as_str()),
            (artifact.test_script.as_path(), GUEST_TEST_SCRIPT),
        ] {
            if let Err(e) = vm.copy_to_guest(local, guest, remaining(deadline)).await {
                warn!(error = %e, guest, "deploy failed");
                log.section("deploy", e.output());
                log.note("deploy", &e);
                return deploy_failed(&e);
            }
        }

        if artifact.kind == ArtifactKind::Module {
            match vm.run(&format!("insmod {guest_artifact}"), remaining(deadline)).await {
                Ok(out) => {
                    log.command("insmod", &out);
                    if out.timed_out {
                        return Verdict::Timeout;
                    }
                    if !out.success() {
                        return Verdict::TestFailed;
                    }
                }
                Err(e) => {
                    log.note("insmod", &e);
                    return deploy_failed(&e);
                }
            }
        }

        let test = format!("chmod +x {GUEST_TEST_SCRIPT} && {GUEST_TEST_SCRIPT} {guest_artifact}");
        match vm.run(&test, remaining(deadline)).await {
            Ok(out) => {
                log.command("test", &out);
                if out.timed_out {
                    Verdict::Timeout
                } else if out.success() {
                    Verdict::Success
                } else {
                    Verdict::TestFailed
                }
            }
            Err(e) => {
                log.note("test", &e);
                deploy_failed(&e)
            }
        }
    }
}

#[async_trait]
impl RunExecutor for Pipeline {
    async fn execute(&self, request: &RunRequest) -> RunOutcome {
        self.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_log_sections() {
        let mut log = StageLog::default();
        log.section("build", "cc -o hello");
        log.command(
            "test",
            &CommandOutput {
                exit_code: Some(1),
                output: "FAIL\n".to_string(),
                timed_out: false,
                duration_ms: 3,
            },
        );
        assert_eq!(
            log.text,
            "==> build\ncc -o hello\n==> test\nFAIL\n==> test: exit status 1\n"
        );
    }

    #[test]
    fn test_copy_tree_preserves_layout() {
        let from = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(from.path().join("sub")).unwrap();
        std::fs::write(from.path().join("Makefile"), "all:\n").unwrap();
        std::fs::write(from.path().join("sub/hello.c"), "int x;\n").unwrap();

        let to = tempfile::tempdir().unwrap();
        let dest = to.path().join("src");
        copy_tree(from.path(), &dest).unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("Makefile")).unwrap(), "all:\n");
        assert_eq!(
            std::fs::read_to_string(dest.join("sub/hello.c")).unwrap(),
            "int x;\n"
        );
    }

    #[tokio::test]
    async fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
