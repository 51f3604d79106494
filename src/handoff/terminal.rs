use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TerminalConfig;
use crate::spawn::TerminalLaunchSpec;
use crate::task::{AgentContext, AgentTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Tracked state of one isolated out-of-process worker. Owned by the
/// handoff manager for the worker's life; archived on exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalInstance {
    pub id: String,
    pub pid: Option<u32>,
    pub status: TerminalStatus,
    pub task_id: String,
    pub agent_kind: String,
    pub branch: String,
    pub worktree_path: Option<PathBuf>,
    pub spawned_at: DateTime<Utc>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub errors: String,
}

/// Per-handoff overrides on top of the configured terminal defaults.
#[derive(Debug, Clone, Default)]
pub struct TerminalOverrides {
    pub branch: Option<String>,
    pub agent_kind: Option<String>,
    pub instructions: Option<String>,
    pub timeout: Option<Duration>,
    pub env: HashMap<String, String>,
}

impl TerminalOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_agent_kind(mut self, agent_kind: impl Into<String>) -> Self {
        self.agent_kind = Some(agent_kind.into());
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Build the launch spec for a task: defaults from config, overrides on
/// top, and an environment overlay carrying the task and context ids.
pub(crate) fn build_launch_spec(
    task: &AgentTask,
    overrides: &TerminalOverrides,
    context: &AgentContext,
    defaults: &TerminalConfig,
) -> TerminalLaunchSpec {
    let worker_id = format!("term-{}", Uuid::new_v4());
    let branch = overrides
        .branch
        .clone()
        .unwrap_or_else(|| format!("{}/{}", defaults.branch_prefix, worker_id));

    let instructions = overrides.instructions.clone().unwrap_or_else(|| {
        if task.payload.is_null() {
            task.task_type.clone()
        } else {
            serde_json::to_string_pretty(&task.payload).unwrap_or_else(|_| task.task_type.clone())
        }
    });

    let mut env = overrides.env.clone();
    env.insert("CHARTERFLOW_TASK_ID".to_string(), task.id.clone());
    env.insert(
        "CHARTERFLOW_REQUEST_ID".to_string(),
        context.request_id.clone(),
    );
    env.insert(
        "CHARTERFLOW_SESSION_ID".to_string(),
        context.session_id.clone(),
    );

    TerminalLaunchSpec {
        worker_id,
        branch,
        agent_kind: overrides
            .agent_kind
            .clone()
            .unwrap_or_else(|| "general".to_string()),
        instructions,
        timeout: overrides
            .timeout
            .unwrap_or(Duration::from_secs(defaults.timeout_secs)),
        env,
    }
}
