use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("No pending handoff for task: {0}")]
    NoPendingHandoff(String),

    #[error("Wrong recipient for task {task_id}: handoff is addressed to {expected}, not {actual}")]
    WrongRecipient {
        task_id: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid state transition: {from} -> {to} (allowed: {allowed})")]
    InvalidTransition {
        from: String,
        to: String,
        allowed: String,
    },

    #[error("No terminal worker for task: {0}")]
    NoTerminalForTask(String),

    #[error("Worker spawn failed: {0}")]
    Spawn(String),

    #[error("Workflow already exists: {0}")]
    WorkflowAlreadyExists(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Worker already registered for queue: {0}")]
    WorkerAlreadyRegistered(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;

pub(crate) fn queue_err(msg: impl Into<String>) -> FlowError {
    FlowError::Queue(msg.into())
}

pub(crate) fn queue_err_with(msg: &str, e: impl std::fmt::Display) -> FlowError {
    FlowError::Queue(format!("{}: {}", msg, e))
}
