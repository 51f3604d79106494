use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{SpawnedWorker, TerminalLaunchSpec, WorkerExit, WorkerSpawner, WorktreeProvisioner};
use crate::config::TerminalConfig;
use crate::error::{FlowError, Result};

/// Spawns workers as child processes of the configured agent command, each
/// in its own git worktree when a provisioner is attached. Enforces the
/// launch timeout with a kill and reports exit through the per-worker
/// one-shot channel.
pub struct ProcessSpawner {
    config: TerminalConfig,
    provisioner: Option<Arc<WorktreeProvisioner>>,
    kill_switches: Arc<DashMap<String, oneshot::Sender<String>>>,
}

impl ProcessSpawner {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            config,
            provisioner: None,
            kill_switches: Arc::new(DashMap::new()),
        }
    }

    pub fn with_provisioner(mut self, provisioner: WorktreeProvisioner) -> Self {
        self.provisioner = Some(Arc::new(provisioner));
        self
    }

    pub fn active_workers(&self) -> usize {
        self.kill_switches.len()
    }
}

async fn read_stream(stream: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let mut buffer = String::new();
    if let Some(mut stream) = stream
        && let Err(e) = stream.read_to_string(&mut buffer).await
    {
        warn!(error = %e, "Failed to read worker stream");
    }
    buffer
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, spec: TerminalLaunchSpec) -> Result<SpawnedWorker> {
        let worktree_path = match &self.provisioner {
            Some(provisioner) => Some(provisioner.setup(&spec.worker_id, &spec.branch).await?),
            None => None,
        };

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .arg(&spec.instructions)
            .envs(&spec.env)
            .env("CHARTERFLOW_AGENT_KIND", &spec.agent_kind)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &worktree_path {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            FlowError::Spawn(format!("failed to launch {}: {}", self.config.command, e))
        })?;
        let pid = child.id();

        info!(
            worker_id = %spec.worker_id,
            pid = ?pid,
            agent_kind = %spec.agent_kind,
            "Spawned terminal worker"
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<String>();
        self.kill_switches.insert(spec.worker_id.clone(), kill_tx);

        let worker_id = spec.worker_id.clone();
        let timeout = spec.timeout;
        let kill_switches = Arc::clone(&self.kill_switches);
        let provisioner = self.provisioner.clone();

        tokio::spawn(async move {
            let out_task = tokio::spawn(read_stream(stdout));
            let err_task = tokio::spawn(read_stream(stderr));

            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = tokio::time::sleep(timeout) => {
                    warn!(worker_id = %worker_id, timeout_secs = timeout.as_secs(), "Worker timed out, killing");
                    let _ = child.start_kill();
                    child.wait().await.ok()
                }
                reason = &mut kill_rx => {
                    if let Ok(reason) = reason {
                        info!(worker_id = %worker_id, reason = %reason, "Worker terminated on request");
                    }
                    let _ = child.start_kill();
                    child.wait().await.ok()
                }
            };

            let output = out_task.await.unwrap_or_default();
            let errors = err_task.await.unwrap_or_default();

            kill_switches.remove(&worker_id);
            if let Some(provisioner) = provisioner
                && let Err(e) = provisioner.cleanup(&worker_id, true).await
            {
                warn!(worker_id = %worker_id, error = %e, "Worktree cleanup failed");
            }

            let exit = WorkerExit {
                exit_code: status.and_then(|s| s.code()),
                output,
                errors,
            };
            let _ = exit_tx.send(exit);
        });

        Ok(SpawnedWorker {
            id: spec.worker_id,
            pid,
            worktree_path,
            exit: exit_rx,
        })
    }

    async fn terminate(&self, worker_id: &str, reason: Option<&str>) -> Result<()> {
        match self.kill_switches.remove(worker_id) {
            Some((_, kill_tx)) => {
                let _ = kill_tx.send(reason.unwrap_or("terminated").to_string());
                Ok(())
            }
            None => {
                debug!(worker_id = %worker_id, "Terminate requested for untracked worker");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn shell_spawner() -> ProcessSpawner {
        ProcessSpawner::new(TerminalConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string()],
            ..TerminalConfig::default()
        })
    }

    fn spec(worker_id: &str, instructions: &str, timeout: Duration) -> TerminalLaunchSpec {
        TerminalLaunchSpec {
            worker_id: worker_id.to_string(),
            branch: format!("terminal/{}", worker_id),
            agent_kind: "general".to_string(),
            instructions: instructions.to_string(),
            timeout,
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_spawn_captures_output_and_exit_code() {
        let spawner = shell_spawner();
        let worker = spawner
            .spawn(spec("w-1", "echo hello; echo oops >&2", Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(worker.pid.is_some());

        let exit = worker.exit.await.unwrap();
        assert_eq!(exit.exit_code, Some(0));
        assert!(exit.success());
        assert_eq!(exit.output.trim(), "hello");
        assert_eq!(exit.errors.trim(), "oops");
        assert_eq!(spawner.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let spawner = shell_spawner();
        let worker = spawner
            .spawn(spec("w-2", "exit 3", Duration::from_secs(10)))
            .await
            .unwrap();

        let exit = worker.exit.await.unwrap();
        assert_eq!(exit.exit_code, Some(3));
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_env_overlay_reaches_worker() {
        let spawner = shell_spawner();
        let mut launch = spec("w-3", "printf \"$CHARTERFLOW_TASK_ID\"", Duration::from_secs(10));
        launch
            .env
            .insert("CHARTERFLOW_TASK_ID".to_string(), "t-42".to_string());

        let worker = spawner.spawn(launch).await.unwrap();
        let exit = worker.exit.await.unwrap();
        assert_eq!(exit.output, "t-42");
    }

    #[tokio::test]
    async fn test_timeout_kills_worker() {
        let spawner = shell_spawner();
        let worker = spawner
            .spawn(spec("w-4", "sleep 30", Duration::from_millis(200)))
            .await
            .unwrap();

        let exit = worker.exit.await.unwrap();
        assert!(!exit.success());
        assert_ne!(exit.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_terminate_stops_worker() {
        let spawner = shell_spawner();
        let worker = spawner
            .spawn(spec("w-5", "sleep 30", Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(spawner.active_workers(), 1);

        spawner.terminate("w-5", Some("operator request")).await.unwrap();
        let exit = worker.exit.await.unwrap();
        assert!(!exit.success());
        assert_eq!(spawner.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_terminate_untracked_worker_is_not_an_error() {
        let spawner = shell_spawner();
        assert!(spawner.terminate("no-such-worker", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_command_is_spawn_failure() {
        let spawner = ProcessSpawner::new(TerminalConfig {
            command: "charterflow-no-such-binary".to_string(),
            args: vec![],
            ..TerminalConfig::default()
        });

        let result = spawner
            .spawn(spec("w-6", "noop", Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(FlowError::Spawn(_))));
    }
}
