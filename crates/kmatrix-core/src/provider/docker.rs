//! Container-based build provider.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BuildProvider, BuiltArtifact, ProviderError};
use crate::artifact::Artifact;
use crate::exec::run_with_timeout;
use crate::kernel::KernelDescriptor;

const CONTAINER_WORKDIR: &str = "/work";
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the artifact's build command in a throwaway container that carries
/// the target kernel's headers, with the run's workdir mounted at `/work`.
#[derive(Debug, Clone)]
pub struct DockerBuildProvider {
    docker: PathBuf,
}

impl Default for DockerBuildProvider {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerBuildProvider {
    pub fn new(docker: impl Into<PathBuf>) -> Self {
        DockerBuildProvider {
            docker: docker.into(),
        }
    }

    fn command(
        &self,
        container: &str,
        artifact: &Artifact,
        target: &KernelDescriptor,
        workdir: &Path,
    ) -> Command {
        let image = artifact
            .build
            .image
            .clone()
            .unwrap_or_else(|| target.build_image());

        let mut cmd = Command::new(&self.docker);
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(container)
            .arg("-v")
            .arg(format!("{}:{}", workdir.display(), CONTAINER_WORKDIR))
            .arg("-w")
            .arg(CONTAINER_WORKDIR)
            .arg("-e")
            .arg(format!("KERNEL_RELEASE={}", target.release))
            .arg("-e")
            .arg(format!("KERNEL={}", target.headers_path()));
        for (key, value) in &artifact.build.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(image).args(&artifact.build.command);
        cmd
    }

    /// The container outlives a killed `docker run` client.
    async fn remove_container(&self, container: &str) {
        let mut cmd = Command::new(&self.docker);
        cmd.args(["rm", "-f", container]);
        match run_with_timeout(cmd, REMOVE_TIMEOUT).await {
            Ok(out) if out.success() => debug!(container, "build container removed"),
            Ok(out) => warn!(container, output = %out.output, "failed to remove build container"),
            Err(e) => warn!(container, error = %e, "failed to remove build container"),
        }
    }
}

#[async_trait]
impl BuildProvider for DockerBuildProvider {
    async fn build(
        &self,
        artifact: &Artifact,
        target: &KernelDescriptor,
        workdir: &Path,
        timeout: Duration,
    ) -> Result<BuiltArtifact, ProviderError> {
        let container = format!("kmatrix-build-{}", Uuid::new_v4());
        let cmd = self.command(&container, artifact, target, workdir);

        let out = run_with_timeout(cmd, timeout).await?;
        if out.timed_out {
            self.remove_container(&container).await;
            return Err(ProviderError::timeout(timeout, out.output));
        }
        if !out.success() {
            return Err(ProviderError::failed(
                format!("build exited with {:?}", out.exit_code),
                out.output,
            ));
        }

        let path = workdir.join(artifact.output_path());
        if !path.is_file() {
            return Err(ProviderError::failed(
                format!("build produced no {}", artifact.output_path().display()),
                out.output,
            ));
        }

        Ok(BuiltArtifact {
            path,
            output: out.output,
        })
    }
}
