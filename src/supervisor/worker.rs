//! Worker process handles
//!
//! The supervisor re-invokes its own binary with `BUNGEE_ROLE=worker` for
//! each pool slot. stdout carries the worker→supervisor protocol as
//! newline-delimited JSON (`{"status":"ready",...}` / `{"status":"error",...}`);
//! stdin carries the supervisor→worker commands (`{"command":"shutdown"}`).
//! Logs go to stderr, which the children inherit.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};

/// How long a worker gets to report ready after spawn.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a worker gets to drain and exit after a shutdown command.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker → supervisor report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerReport {
    Ready { pid: u32 },
    Error { error: String },
}

/// Supervisor → worker command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum WorkerCommand {
    Shutdown,
}

/// A live worker child process.
pub struct WorkerHandle {
    pub id: usize,
    pub pid: u32,
    child: Child,
    stdin: ChildStdin,
}

impl WorkerHandle {
    /// Spawn a worker for pool slot `id` and wait for its ready report.
    pub async fn spawn(id: usize, port: u16, config_path: &std::path::Path) -> Result<Self> {
        let exe = std::env::current_exe().context("cannot locate own binary")?;

        let mut child = Command::new(exe)
            .env("BUNGEE_ROLE", "worker")
            .env("BUNGEE_WORKER_ID", id.to_string())
            .env("PORT", port.to_string())
            .env("CONFIG_PATH", config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn worker process")?;

        let stdout = child.stdout.take().context("worker stdout not piped")?;
        let stdin = child.stdin.take().context("worker stdin not piped")?;

        // First protocol line decides: ready or startup error.
        let report = tokio::time::timeout(STARTUP_TIMEOUT, async {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Ok(report) = serde_json::from_str::<WorkerReport>(&line) {
                            return Some(report);
                        }
                        tracing::debug!(worker = id, line = %line, "ignoring non-protocol output");
                    }
                    Ok(None) => return None,
                    Err(_) => return None,
                }
            }
        })
        .await;

        match report {
            Ok(Some(WorkerReport::Ready { pid })) => {
                tracing::info!(worker = id, pid, "worker ready");
                Ok(Self {
                    id,
                    pid,
                    child,
                    stdin,
                })
            }
            Ok(Some(WorkerReport::Error { error })) => {
                let _ = child.kill().await;
                anyhow::bail!("worker {} failed to start: {}", id, error);
            }
            Ok(None) => {
                let _ = child.kill().await;
                anyhow::bail!("worker {} exited before reporting ready", id);
            }
            Err(_) => {
                let _ = child.kill().await;
                anyhow::bail!("worker {} did not become ready within 30s", id);
            }
        }
    }

    /// Ask the worker to drain and exit; force-terminate if it overstays.
    pub async fn shutdown(mut self) {
        let command = serde_json::to_string(&WorkerCommand::Shutdown).expect("static command");
        if self.stdin.write_all(format!("{}\n", command).as_bytes()).await.is_err() {
            // stdin gone means the worker is already dying; just reap it.
            let _ = self.child.kill().await;
            return;
        }
        let _ = self.stdin.flush().await;

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(worker = self.id, pid = self.pid, %status, "worker exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(worker = self.id, error = %e, "failed waiting for worker exit");
            }
            Err(_) => {
                tracing::warn!(worker = self.id, pid = self.pid, "worker ignored shutdown, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}
