//! Host tool checks run before anything is scheduled.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{KmatrixError, Result};
use crate::exec::run_with_timeout;

const DOCKER_PS_TIMEOUT: Duration = Duration::from_secs(30);

/// Tools the process-backed providers shell out to. Docker is only needed
/// when something has to be built.
pub fn required_tools(needs_build: bool) -> Vec<&'static str> {
    let mut tools = Vec::new();
    if needs_build {
        tools.push("docker");
    }
    tools.extend(["qemu-system-x86_64", "ssh", "scp"]);
    tools
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// First executable named `tool` in the directories of `path_var`.
pub fn find_in(path_var: &OsStr, tool: &str) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

/// Fails with `Config` naming every tool missing from `PATH`.
pub fn check_required_tools(tools: &[&str]) -> Result<()> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    check_tools_in(&path_var, tools)
}

fn check_tools_in(path_var: &OsStr, tools: &[&str]) -> Result<()> {
    let missing: Vec<&str> = tools
        .iter()
        .copied()
        .filter(|tool| match find_in(path_var, tool) {
            Some(found) => {
                debug!(tool, path = %found.display(), "found tool");
                false
            }
            None => true,
        })
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(KmatrixError::Config(format!(
            "required tools not found on PATH: {}",
            missing.join(", ")
        )))
    }
}

/// Runs `docker ps` so a daemon the user may not talk to is reported before
/// any build starts.
pub async fn check_docker_access(docker: &Path) -> Result<()> {
    let mut ps = Command::new(docker);
    ps.args(["ps", "--quiet"]);
    let out = run_with_timeout(ps, DOCKER_PS_TIMEOUT)
        .await
        .map_err(|e| KmatrixError::Config(format!("cannot run {} ps: {e}", docker.display())))?;

    if out.success() {
        debug!(docker = %docker.display(), "docker daemon reachable");
        return Ok(());
    }
    if out.timed_out {
        return Err(KmatrixError::Config(format!(
            "{} ps did not answer within {}s",
            docker.display(),
            DOCKER_PS_TIMEOUT.as_secs()
        )));
    }

    let mut message = format!("{} ps failed: {}", docker.display(), out.output.trim());
    if out.output.to_lowercase().contains("permission denied") {
        message.push_str(" (add the user to the docker group, or run kmatrix with sudo)");
    }
    Err(KmatrixError::Config(message))
}
