//! Worker-spawning collaborator: creates and destroys isolated out-of-process
//! workers. The handoff manager treats this strictly as an opaque capability.

mod process;
mod workspace;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

pub use process::ProcessSpawner;
pub use workspace::WorktreeProvisioner;

use crate::error::Result;

/// Parameters for launching one isolated worker.
#[derive(Debug, Clone)]
pub struct TerminalLaunchSpec {
    pub worker_id: String,
    /// Branch name for the worker's isolated workspace.
    pub branch: String,
    pub agent_kind: String,
    /// Initial instructions handed to the worker process.
    pub instructions: String,
    pub timeout: Duration,
    /// Environment overlay; carries task and context identifiers.
    pub env: HashMap<String, String>,
}

/// What a worker left behind when it exited. `exit_code` is `None` when the
/// process was killed by a signal (including timeout enforcement).
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub exit_code: Option<i32>,
    pub output: String,
    pub errors: String,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Handle returned by `spawn`. The exit channel is one-shot and private to
/// this worker, so concurrently spawned workers cannot cross-talk.
pub struct SpawnedWorker {
    pub id: String,
    pub pid: Option<u32>,
    pub worktree_path: Option<PathBuf>,
    pub exit: oneshot::Receiver<WorkerExit>,
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Provision a workspace and start the worker process. Returns once the
    /// process exists, not once it finishes.
    async fn spawn(&self, spec: TerminalLaunchSpec) -> Result<SpawnedWorker>;

    /// Forcibly stop a running worker. A worker that already exited is not
    /// an error.
    async fn terminate(&self, worker_id: &str, reason: Option<&str>) -> Result<()>;
}
