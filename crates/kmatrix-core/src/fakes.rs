//! Scripted in-memory providers (testing only)
//!
//! `ScriptedBuildProvider` and `ScriptedVmProvider` satisfy the provider
//! contracts without Docker or QEMU. Delays use `tokio::time`, so tests can
//! run them under a paused clock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::artifact::{Artifact, VmSpec};
use crate::exec::CommandOutput;
use crate::kernel::KernelDescriptor;
use crate::provider::{BuildProvider, BuiltArtifact, ProviderError, VmHandle, VmProvider};

/// Guest output marker for a deployed artifact that was tampered with.
pub const CORRUPT_MARKER: &str = "CORRUPT";

/// Writes a small artifact file into the workdir after an optional delay.
#[derive(Debug, Default)]
pub struct ScriptedBuildProvider {
    delay: Duration,
    fail: bool,
    corrupt_release: Option<String>,
    workdirs: Mutex<Vec<PathBuf>>,
}

impl ScriptedBuildProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every build exits nonzero.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Builds for `release` produce a corrupted artifact.
    pub fn corrupting(mut self, release: impl Into<String>) -> Self {
        self.corrupt_release = Some(release.into());
        self
    }

    /// Workdirs handed to `build`, in call order.
    pub fn workdirs(&self) -> Vec<PathBuf> {
        self.workdirs.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildProvider for ScriptedBuildProvider {
    async fn build(
        &self,
        artifact: &Artifact,
        target: &KernelDescriptor,
        workdir: &Path,
        timeout: Duration,
    ) -> Result<BuiltArtifact, ProviderError> {
        self.workdirs.lock().unwrap().push(workdir.to_path_buf());

        if self.delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(ProviderError::timeout(timeout, "building...\n"));
        }
        tokio::time::sleep(self.delay).await;

        if self.fail {
            return Err(ProviderError::failed(
                "build exited with Some(2)",
                "error: implicit declaration of function\n",
            ));
        }

        let contents = if self.corrupt_release.as_deref() == Some(target.release.as_str()) {
            format!("{CORRUPT_MARKER} {}\n", artifact.name)
        } else {
            format!("{} for {}\n", artifact.name, target.release)
        };
        let path = workdir.join(artifact.output_path());
        tokio::fs::write(&path, contents).await?;

        Ok(BuiltArtifact {
            path,
            output: format!("built {} against {}\n", artifact.name, target.release),
        })
    }
}

/// Counters shared by a provider and all the machines it launched.
#[derive(Debug, Default)]
pub struct VmStats {
    pub launched: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub shutdowns: AtomicUsize,
    ids: Mutex<Vec<String>>,
}

impl VmStats {
    pub fn ids(&self) -> Vec<String> {
        self.ids.lock().unwrap().clone()
    }
}

/// Boots pretend machines that keep copied files in memory.
///
/// The test command exits zero unless the deployed artifact contains
/// [`CORRUPT_MARKER`] or a failing exit code was configured.
#[derive(Debug, Default)]
pub struct ScriptedVmProvider {
    boot_delay: Duration,
    run_delay: Duration,
    launch_fails: bool,
    insmod_fails: bool,
    test_exit: i32,
    stats: Arc<VmStats>,
}

impl ScriptedVmProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    /// Time the test command takes in the guest.
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    pub fn launch_failing(mut self) -> Self {
        self.launch_fails = true;
        self
    }

    pub fn insmod_failing(mut self) -> Self {
        self.insmod_fails = true;
        self
    }

    pub fn with_test_exit(mut self, code: i32) -> Self {
        self.test_exit = code;
        self
    }

    pub fn stats(&self) -> Arc<VmStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl VmProvider for ScriptedVmProvider {
    async fn launch(
        &self,
        target: &KernelDescriptor,
        _spec: &VmSpec,
        timeout: Duration,
    ) -> Result<Box<dyn VmHandle>, ProviderError> {
        if self.launch_fails || !target.is_usable() {
            return Err(ProviderError::failed("qemu exited during boot", "kernel panic\n"));
        }
        if self.boot_delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(ProviderError::timeout(timeout, ""));
        }
        tokio::time::sleep(self.boot_delay).await;

        let id = format!("fake-{}", Uuid::new_v4());
        self.stats.ids.lock().unwrap().push(id.clone());
        self.stats.launched.fetch_add(1, Ordering::SeqCst);
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(FakeVm {
            id,
            files: HashMap::new(),
            run_delay: self.run_delay,
            insmod_fails: self.insmod_fails,
            test_exit: self.test_exit,
            stats: Arc::clone(&self.stats),
            shut_down: false,
        }))
    }
}

struct FakeVm {
    id: String,
    files: HashMap<String, Vec<u8>>,
    run_delay: Duration,
    insmod_fails: bool,
    test_exit: i32,
    stats: Arc<VmStats>,
    shut_down: bool,
}

impl FakeVm {
    fn output(exit_code: i32, output: impl Into<String>) -> CommandOutput {
        CommandOutput {
            exit_code: Some(exit_code),
            output: output.into(),
            timed_out: false,
            duration_ms: 0,
        }
    }

    fn release(&mut self) {
        if !self.shut_down {
            self.shut_down = true;
            self.stats.active.fetch_sub(1, Ordering::SeqCst);
            self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl VmHandle for FakeVm {
    fn id(&self) -> &str {
        &self.id
    }

    async fn copy_to_guest(
        &mut self,
        local: &Path,
        guest: &str,
        _timeout: Duration,
    ) -> Result<(), ProviderError> {
        let bytes = tokio::fs::read(local).await.map_err(|e| {
            ProviderError::failed(format!("scp: {}: {e}", local.display()), "")
        })?;
        self.files.insert(guest.to_string(), bytes);
        Ok(())
    }

    async fn run(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ProviderError> {
        if let Some(module) = command.strip_prefix("insmod ") {
            if self.insmod_fails || !self.files.contains_key(module) {
                return Ok(Self::output(1, "insmod: ERROR: could not insert module\n"));
            }
            return Ok(Self::output(0, ""));
        }

        if self.run_delay > timeout {
            tokio::time::sleep(timeout).await;
            return Ok(CommandOutput {
                exit_code: None,
                output: "running...\n".to_string(),
                timed_out: true,
                duration_ms: timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(self.run_delay).await;

        let corrupted = self
            .files
            .values()
            .any(|f| String::from_utf8_lossy(f).contains(CORRUPT_MARKER));
        if corrupted {
            return Ok(Self::output(1, "artifact corrupted\n"));
        }
        Ok(Self::output(self.test_exit, format!("[{}] test done\n", self.id)))
    }

    async fn shutdown(&mut self) -> Result<(), ProviderError> {
        self.release();
        Ok(())
    }
}

impl Drop for FakeVm {
    fn drop(&mut self) {
        self.release();
    }
}
