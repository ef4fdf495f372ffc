//! QEMU-backed VM provider.
//!
//! Each launch boots `qemu-system-x86_64` with the target's kernel and a
//! copy-on-write view of its rootfs (`-snapshot`), so concurrent machines
//! never share writable disk state. The guest is reached over SSH through a
//! user-mode network port forwarded on the loopback interface.
//!
//! Forwarded ports are reserved in the provider for the lifetime of the VM,
//! so concurrent launches never hand the same port to two guests. A launch
//! whose port was taken by another process in the meantime is retried on a
//! fresh port.

use std::collections::HashSet;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ProviderError, VmHandle, VmProvider};
use crate::artifact::VmSpec;
use crate::exec::{run_with_timeout, CommandOutput};
use crate::kernel::KernelDescriptor;

const SSH_POLL_TIMEOUT: Duration = Duration::from_secs(10);
/// QEMU sets up host forwarding at startup; a clash makes it exit at once.
const STARTUP_GRACE: Duration = Duration::from_millis(500);
const LAUNCH_ATTEMPTS: u32 = 3;

/// Loopback ports currently forwarded to a guest of this provider.
#[derive(Debug, Clone, Default)]
struct PortReservations {
    ports: Arc<Mutex<HashSet<u16>>>,
}

impl PortReservations {
    fn locked(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a free loopback port that no live VM of this provider holds.
    fn reserve(&self) -> std::io::Result<PortLease> {
        let mut ports = self.locked();
        loop {
            let port = free_loopback_port()?;
            if ports.insert(port) {
                return Ok(PortLease {
                    port,
                    reservations: self.clone(),
                });
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locked().len()
    }
}

/// A reserved port, released on drop.
#[derive(Debug)]
struct PortLease {
    port: u16,
    reservations: PortReservations,
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.reservations.locked().remove(&self.port);
    }
}

#[derive(Debug, Clone)]
pub struct QemuVmProvider {
    qemu: PathBuf,
    ssh_user: String,
    ssh_key: Option<PathBuf>,
    poll_interval: Duration,
    ports: PortReservations,
}

impl Default for QemuVmProvider {
    fn default() -> Self {
        QemuVmProvider {
            qemu: PathBuf::from("qemu-system-x86_64"),
            ssh_user: "root".to_string(),
            ssh_key: None,
            poll_interval: Duration::from_secs(2),
            ports: PortReservations::default(),
        }
    }
}

impl QemuVmProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_qemu(mut self, qemu: impl Into<PathBuf>) -> Self {
        self.qemu = qemu.into();
        self
    }

    pub fn with_ssh_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.ssh_key = Some(key.into());
        self
    }

    pub fn with_ssh_user(mut self, user: impl Into<String>) -> Self {
        self.ssh_user = user.into();
        self
    }

    fn command(&self, target: &KernelDescriptor, rootfs: &Path, spec: &VmSpec, port: u16) -> Command {
        let kvm = Path::new("/dev/kvm").exists();
        let mut append = vec!["root=/dev/sda", "rw", "console=ttyS0", "panic=-1", "oops=panic"];
        append.extend(spec.toggles.cmdline_args());

        let mut cmd = Command::new(&self.qemu);
        cmd.arg("-nographic")
            .arg("-no-reboot")
            .arg("-snapshot")
            .arg("-m")
            .arg(spec.memory_mb.to_string())
            .arg("-smp")
            .arg(spec.cpus.to_string())
            .arg("-cpu")
            .arg(format!(
                "{},{}",
                if kvm { "host" } else { "qemu64" },
                spec.toggles.cpu_flags()
            ))
            .arg("-kernel")
            .arg(&target.kernel_path)
            .arg("-append")
            .arg(append.join(" "))
            .arg("-drive")
            .arg(format!("file={},format=raw,index=0,media=disk", rootfs.display()))
            .arg("-netdev")
            .arg(format!("user,id=net0,hostfwd=tcp:127.0.0.1:{port}-:22"))
            .arg("-device")
            .arg("e1000,netdev=net0");
        if kvm {
            cmd.arg("-enable-kvm");
        }
        cmd
    }
}

fn free_loopback_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Whether QEMU gave up because the forwarded host port was already bound.
fn is_port_clash(err: &ProviderError) -> bool {
    let output = err.output();
    output.contains("Could not set up host forwarding rule") || output.contains("Address already in use")
}

async fn read_stderr(child: &mut Child) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        if let Err(e) = stderr.read_to_string(&mut text).await {
            debug!(error = %e, "failed to read qemu stderr");
        }
    }
    text
}

/// Keeps reading QEMU's stderr after boot so the pipe never fills.
fn log_stderr(vm_id: String, child: &mut Child) {
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(vm = %vm_id, "qemu: {line}");
            }
        });
    }
}

impl QemuVmProvider {
    /// Spawn one QEMU process and wait until the guest answers over SSH.
    async fn boot(
        &self,
        target: &KernelDescriptor,
        rootfs: &Path,
        spec: &VmSpec,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<QemuVm, ProviderError> {
        let lease = self.ports.reserve()?;
        let port = lease.port;
        let mut cmd = self.command(target, rootfs, spec, port);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        let mut vm = QemuVm {
            id: format!("qemu-{}", Uuid::new_v4()),
            child,
            lease,
            user: self.ssh_user.clone(),
            key: self.ssh_key.clone(),
            shut_down: false,
        };
        info!(vm = %vm.id, kernel = %target, port, "booting vm");

        let grace = STARTUP_GRACE.min(deadline.saturating_duration_since(Instant::now()));
        if let Ok(status) = tokio::time::timeout(grace, vm.child.wait()).await {
            vm.shut_down = true;
            let stderr = read_stderr(&mut vm.child).await;
            return Err(ProviderError::failed(
                format!("qemu exited during startup with {}", status?),
                stderr,
            ));
        }
        log_stderr(vm.id.clone(), &mut vm.child);

        loop {
            if let Some(status) = vm.child.try_wait()? {
                vm.shut_down = true;
                return Err(ProviderError::failed(
                    format!("qemu exited during boot with {status}"),
                    "",
                ));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if let Err(e) = vm.shutdown().await {
                    warn!(vm = %vm.id, error = %e, "failed to stop vm after boot timeout");
                }
                return Err(ProviderError::timeout(timeout, ""));
            }

            let reply = run_with_timeout(vm.ssh("true"), remaining.min(SSH_POLL_TIMEOUT)).await?;
            if reply.success() {
                debug!(vm = %vm.id, "guest reachable");
                return Ok(vm);
            }
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

#[async_trait]
impl VmProvider for QemuVmProvider {
    async fn launch(
        &self,
        target: &KernelDescriptor,
        spec: &VmSpec,
        timeout: Duration,
    ) -> Result<Box<dyn VmHandle>, ProviderError> {
        let rootfs = target
            .rootfs_path
            .as_deref()
            .ok_or_else(|| ProviderError::failed(format!("{target} has no rootfs"), ""))?;

        let deadline = Instant::now() + timeout;
        let mut attempt = 1;
        loop {
            match self.boot(target, rootfs, spec, deadline, timeout).await {
                Ok(vm) => return Ok(Box::new(vm)),
                Err(e) if attempt < LAUNCH_ATTEMPTS && is_port_clash(&e) => {
                    warn!(kernel = %target, attempt, "forwarded port taken, retrying launch");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A booted QEMU guest. Killed on shutdown or drop.
pub struct QemuVm {
    id: String,
    child: Child,
    /// Holds the forwarded port until the VM is gone.
    lease: PortLease,
    user: String,
    key: Option<PathBuf>,
    shut_down: bool,
}

impl QemuVm {
    fn ssh_options(&self, cmd: &mut Command) {
        cmd.args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
            "BatchMode=yes",
            "-o",
            "ConnectTimeout=5",
        ]);
        if let Some(key) = &self.key {
            cmd.arg("-i").arg(key);
        }
    }

    fn ssh(&self, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        self.ssh_options(&mut cmd);
        cmd.arg("-p")
            .arg(self.lease.port.to_string())
            .arg(format!("{}@127.0.0.1", self.user))
            .arg(command);
        cmd
    }

    fn scp(&self, local: &Path, guest: &str) -> Command {
        let mut cmd = Command::new("scp");
        self.ssh_options(&mut cmd);
        cmd.arg("-P")
            .arg(self.lease.port.to_string())
            .arg(local)
            .arg(format!("{}@127.0.0.1:{}", self.user, guest));
        cmd
    }
}

#[async_trait]
impl VmHandle for QemuVm {
    fn id(&self) -> &str {
        &self.id
    }

    async fn copy_to_guest(
        &mut self,
        local: &Path,
        guest: &str,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        let out = run_with_timeout(self.scp(local, guest), timeout).await?;
        if out.timed_out {
            return Err(ProviderError::timeout(timeout, out.output));
        }
        if !out.success() {
            return Err(ProviderError::failed(
                format!("copy of {} to {} failed", local.display(), guest),
                out.output,
            ));
        }
        Ok(())
    }

    async fn run(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ProviderError> {
        Ok(run_with_timeout(self.ssh(command), timeout).await?)
    }

    async fn shutdown(&mut self) -> Result<(), ProviderError> {
        if self.shut_down {
            return Ok(());
        }
        // -snapshot discards guest writes, nothing to flush
        self.child.kill().await?;
        self.shut_down = true;
        debug!(vm = %self.id, "vm stopped");
        Ok(())
    }
}

impl Drop for QemuVm {
    fn drop(&mut self) {
        if !self.shut_down {
            warn!(vm = %self.id, "vm dropped without shutdown, killing");
            if let Err(e) = self.child.start_kill() {
                warn!(vm = %self.id, error = %e, "failed to kill vm");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::SecurityToggles;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_command_carries_toggles_and_forward() {
        let target = KernelDescriptor::new(
            "Ubuntu",
            "18.04",
            "4.15.0-20-generic",
            "/k/vmlinuz-4.15.0-20-generic",
            "/r/ubuntu.img",
        );
        let spec = VmSpec {
            cpus: 2,
            memory_mb: 1024,
            toggles: SecurityToggles {
                kaslr: false,
                smep: true,
                smap: false,
                kpti: false,
            },
        };

        let cmd = QemuVmProvider::new().command(&target, Path::new("/r/ubuntu.img"), &spec, 2222);
        let args = args(&cmd);

        let append = args
            .iter()
            .position(|a| a == "-append")
            .map(|i| args[i + 1].clone())
            .unwrap();
        assert!(append.contains("nokaslr"));
        assert!(append.contains("nosmap"));
        assert!(append.contains("nopti"));
        assert!(!append.contains("nosmep"));

        assert!(args.contains(&"1024".to_string()));
        assert!(args.contains(&"/k/vmlinuz-4.15.0-20-generic".to_string()));
        assert!(args.contains(&"user,id=net0,hostfwd=tcp:127.0.0.1:2222-:22".to_string()));
        assert!(args.iter().any(|a| a.ends_with("+smep,-smap")));
    }

    #[test]
    fn test_free_port_is_nonzero() {
        assert_ne!(free_loopback_port().unwrap(), 0);
    }

    #[test]
    fn test_reserved_ports_are_unique_until_released() {
        let reservations = PortReservations::default();
        let leases: Vec<PortLease> = (0..32).map(|_| reservations.reserve().unwrap()).collect();

        let ports: HashSet<u16> = leases.iter().map(|l| l.port).collect();
        assert_eq!(ports.len(), 32);
        assert_eq!(reservations.len(), 32);

        drop(leases);
        assert_eq!(reservations.len(), 0);
    }

    #[test]
    fn test_port_clash_is_recognised() {
        let clash = ProviderError::failed(
            "qemu exited during startup with exit status: 1",
            "qemu-system-x86_64: -netdev user,id=net0,hostfwd=tcp:127.0.0.1:2222-:22: \
             Could not set up host forwarding rule 'tcp:127.0.0.1:2222-:22'",
        );
        assert!(is_port_clash(&clash));

        let other = ProviderError::failed("qemu exited", "could not open disk image /r/x.img");
        assert!(!is_port_clash(&other));
    }

    #[cfg(unix)]
    fn fake_qemu(dir: &Path, stderr: &str) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let calls = dir.join("calls");
        let qemu = dir.join("qemu");
        std::fs::write(
            &qemu,
            format!(
                "#!/bin/sh\necho call >> '{}'\necho \"{stderr}\" >&2\nexit 1\n",
                calls.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&qemu, std::fs::Permissions::from_mode(0o755)).unwrap();
        (qemu, calls)
    }

    #[cfg(unix)]
    fn call_count(calls: &Path) -> usize {
        std::fs::read_to_string(calls).unwrap_or_default().lines().count()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_port_clash_retries_on_fresh_ports() {
        let dir = tempfile::tempdir().unwrap();
        let (qemu, calls) = fake_qemu(
            dir.path(),
            "qemu: Could not set up host forwarding rule 'tcp:127.0.0.1:1-:22'",
        );
        let provider = QemuVmProvider::new().with_qemu(&qemu);
        let target = KernelDescriptor::new("A", "1", "r", "/k", "/r");

        let err = provider
            .launch(&target, &VmSpec::default(), Duration::from_secs(20))
            .await
            .err()
            .unwrap();

        assert!(is_port_clash(&err));
        assert_eq!(call_count(&calls), LAUNCH_ATTEMPTS as usize);
        assert_eq!(provider.ports.len(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_other_startup_failures_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (qemu, calls) = fake_qemu(dir.path(), "qemu: could not load kernel '/k'");
        let provider = QemuVmProvider::new().with_qemu(&qemu);
        let target = KernelDescriptor::new("A", "1", "r", "/k", "/r");

        let err = provider
            .launch(&target, &VmSpec::default(), Duration::from_secs(20))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ProviderError::Failed { .. }));
        assert!(err.output().contains("could not load kernel"));
        assert_eq!(call_count(&calls), 1);
    }

    #[tokio::test]
    async fn test_launch_without_rootfs_fails() {
        let mut target = KernelDescriptor::new("A", "1", "r", "/k", "/r");
        target.rootfs_path = None;
        let err = QemuVmProvider::new()
            .launch(&target, &VmSpec::default(), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::Failed { .. }));
    }
}
