//! Out-of-process command execution with a hard time limit.
//!
//! stdout and stderr are streamed line by line into one combined log in
//! arrival order. When the limit elapses the child is killed and reaped
//! before returning; it is never left running unobserved.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How long output readers may keep draining after the child is gone.
/// Grandchildren can hold the pipes open past the child's exit.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Result of one command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal or on timeout.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

async fn forward<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "output stream closed");
                break;
            }
        }
    }
}

/// Spawn `command`, wait at most `limit`, kill it if still running.
///
/// Errors only when the process cannot be spawned or waited on; a nonzero
/// exit or a timeout is reported in the returned [`CommandOutput`].
pub async fn run_with_timeout(mut command: Command, limit: Duration) -> std::io::Result<CommandOutput> {
    let start = Instant::now();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward(stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward(stderr, tx.clone())));
    }
    drop(tx);

    let collector = tokio::spawn(async move {
        let mut combined = String::new();
        while let Some(line) = rx.recv().await {
            combined.push_str(&line);
        }
        combined
    });

    let (exit_code, timed_out) = match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            warn!(
                pid = child.id(),
                limit_ms = limit.as_millis() as u64,
                "command timed out, killing"
            );
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill timed out command");
            }
            (None, true)
        }
    };

    for mut reader in readers {
        if tokio::time::timeout(DRAIN_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }
    let output = collector.await.unwrap_or_default();

    Ok(CommandOutput {
        exit_code,
        output,
        timed_out,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let out = run_with_timeout(sh("echo out; echo err >&2"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.output.contains("out\n"));
        assert!(out.output.contains("err\n"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let out = run_with_timeout(sh("echo nope; exit 3"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let started = Instant::now();
        let out = run_with_timeout(sh("echo started; exec sleep 30"), Duration::from_millis(300))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
        assert!(out.output.contains("started"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_io_error() {
        let cmd = Command::new("/nonexistent/kmatrix-binary");
        assert!(run_with_timeout(cmd, Duration::from_secs(1)).await.is_err());
    }
}
