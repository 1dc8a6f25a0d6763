//! Worker processes and the channel seam.
//!
//! A worker is a single-execution host: spawned fresh, fed one `execute`
//! request, torn down afterwards. The channel trait hides whether frames
//! cross a real process boundary (length-delimited stdio) or an in-process
//! pipe in tests.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tmg_wire::framing::{read_frame, write_frame};
use tmg_wire::{GatewayError, GatewayResult};

use crate::limits::SandboxLimits;

#[async_trait]
pub trait WorkerChannel: Send + Sync {
    async fn send(&self, frame: &[u8]) -> GatewayResult<()>;

    /// Next inbound frame; `None` when the worker is gone.
    async fn recv(&self) -> GatewayResult<Option<Vec<u8>>>;

    /// Terminate signal, grace period, then hard kill. Idempotent.
    async fn terminate(&self, grace: Duration);
}

#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn spawn(&self, limits: &SandboxLimits) -> GatewayResult<Arc<dyn WorkerChannel>>;
}

/// Spawns the configured worker command with a scrubbed environment.
pub struct ProcessWorkerFactory {
    command: Vec<String>,
}

impl ProcessWorkerFactory {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn spawn(&self, limits: &SandboxLimits) -> GatewayResult<Arc<dyn WorkerChannel>> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(GatewayError::config("sandbox worker command is empty"));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            // Default-deny environment: only allow-listed variables pass.
            .env_clear();
        for key in &limits.allowed_env {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| GatewayError::sandbox_runtime(format!("spawn worker '{}': {}", program, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::internal("worker stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::internal("worker stdout not piped"))?;

        Ok(Arc::new(ProcessWorker {
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(stdout),
            child: Mutex::new(Some(child)),
        }))
    }
}

struct ProcessWorker {
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<ChildStdout>,
    child: Mutex<Option<Child>>,
}

#[async_trait]
impl WorkerChannel for ProcessWorker {
    async fn send(&self, frame: &[u8]) -> GatewayResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| GatewayError::sandbox_runtime("worker stdin closed"))?;
        write_frame(stdin, frame)
            .await
            .map_err(|e| GatewayError::sandbox_runtime(format!("write to worker: {}", e)))
    }

    async fn recv(&self) -> GatewayResult<Option<Vec<u8>>> {
        let mut stdout = self.stdout.lock().await;
        read_frame(&mut *stdout)
            .await
            .map_err(|e| GatewayError::sandbox_runtime(format!("read from worker: {}", e)))
    }

    async fn terminate(&self, grace: Duration) {
        // Closing stdin is the terminate signal.
        self.stdin.lock().await.take();
        let mut child_guard = self.child.lock().await;
        let Some(mut child) = child_guard.take() else {
            return;
        };
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "worker exited within grace period"),
            Ok(Err(e)) => warn!(error = %e, "error waiting for worker"),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill worker");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_command_is_a_config_error() {
        let factory = ProcessWorkerFactory::new(vec![]);
        let err = factory.spawn(&SandboxLimits::default()).await.unwrap_err();
        assert_eq!(err.kind, tmg_wire::ErrorKind::Config);
    }

    #[tokio::test]
    async fn missing_binary_is_a_runtime_error() {
        let factory = ProcessWorkerFactory::new(vec!["no-such-worker-binary".to_string()]);
        let err = factory.spawn(&SandboxLimits::default()).await.unwrap_err();
        assert_eq!(err.kind, tmg_wire::ErrorKind::SandboxRuntime);
    }

    #[tokio::test]
    async fn terminate_reaps_the_child() {
        let factory = ProcessWorkerFactory::new(vec!["cat".to_string()]);
        let worker = factory.spawn(&SandboxLimits::default()).await.unwrap();
        worker.terminate(Duration::from_millis(500)).await;
        // After termination the channel reports EOF.
        assert!(worker.recv().await.unwrap().is_none());
    }
}
