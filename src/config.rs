use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub bus: BusConfig,
    pub queue: QueueConfig,
    pub terminal: TerminalConfig,
    pub workflow: WorkflowConfig,
}

impl FlowConfig {
    pub async fn load(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join("config.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, config_dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self).map_err(|e| FlowError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values, collecting every violation.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.bus.max_history == 0 {
            errors.push("bus.max_history must be greater than 0");
        }

        if self.queue.queue_name.is_empty() {
            errors.push("queue.queue_name must not be empty");
        }
        if self.queue.concurrency == 0 {
            errors.push("queue.concurrency must be greater than 0");
        }
        if self.queue.default_attempts == 0 {
            errors.push("queue.default_attempts must be greater than 0");
        }
        if self.queue.backoff_base_ms == 0 {
            errors.push("queue.backoff_base_ms must be greater than 0");
        }
        if self.queue.poll_interval_ms == 0 {
            errors.push("queue.poll_interval_ms must be greater than 0");
        }

        if self.terminal.command.is_empty() {
            errors.push("terminal.command must not be empty");
        }
        if self.terminal.timeout_secs == 0 {
            errors.push("terminal.timeout_secs must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FlowError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Retained messages in the introspection ring.
    pub max_history: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { max_history: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Broker database file.
    pub db_path: PathBuf,
    pub queue_name: String,
    /// Simultaneous jobs per consumer group.
    pub concurrency: usize,
    pub default_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".charterflow/queue.db"),
            queue_name: "agent-tasks".to_string(),
            concurrency: 5,
            default_attempts: 3,
            backoff_base_ms: 2000,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Command launched inside each isolated worker workspace.
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub worktrees_dir: PathBuf,
    pub base_branch: String,
    pub branch_prefix: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            command: "charter-agent".to_string(),
            args: Vec::new(),
            timeout_secs: 1800,
            worktrees_dir: PathBuf::from(".charterflow/worktrees"),
            base_branch: "main".to_string(),
            branch_prefix: "terminal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Duration threshold for `WorkflowManager::cleanup_completed`.
    pub retention_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            retention_ms: 86_400_000,
        }
    }
}
