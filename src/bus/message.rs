//! Message types for inter-agent signaling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{AgentContext, TaskStatus};

/// Event taxonomy on the bus. The `Custom` variant is the open extension
/// point for consumers that define their own types; it serializes as its
/// raw string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    TaskCreated,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    AgentHandoff,
    ContextUpdate,
    Error,
    TerminalSpawned,
    TerminalCompleted,
    TerminalFailed,
    TerminalTerminated,
    Custom(String),
}

impl MessageType {
    /// Every non-custom type. Agent-scoped subscriptions attach to each of
    /// these; custom types require an explicit type subscription.
    pub const KNOWN: [MessageType; 11] = [
        MessageType::TaskCreated,
        MessageType::TaskStarted,
        MessageType::TaskCompleted,
        MessageType::TaskFailed,
        MessageType::AgentHandoff,
        MessageType::ContextUpdate,
        MessageType::Error,
        MessageType::TerminalSpawned,
        MessageType::TerminalCompleted,
        MessageType::TerminalFailed,
        MessageType::TerminalTerminated,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::AgentHandoff => "agent_handoff",
            Self::ContextUpdate => "context_update",
            Self::Error => "error",
            Self::TerminalSpawned => "terminal_spawned",
            Self::TerminalCompleted => "terminal_completed",
            Self::TerminalFailed => "terminal_failed",
            Self::TerminalTerminated => "terminal_terminated",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        match s {
            "task_created" => Self::TaskCreated,
            "task_started" => Self::TaskStarted,
            "task_completed" => Self::TaskCompleted,
            "task_failed" => Self::TaskFailed,
            "agent_handoff" => Self::AgentHandoff,
            "context_update" => Self::ContextUpdate,
            "error" => Self::Error,
            "terminal_spawned" => Self::TerminalSpawned,
            "terminal_completed" => Self::TerminalCompleted,
            "terminal_failed" => Self::TerminalFailed,
            "terminal_terminated" => Self::TerminalTerminated,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MessageType::from(s.as_str()))
    }
}

/// Payload shapes for the known event kinds. `Opaque` carries anything a
/// publisher wants to attach for types this crate does not model; handlers
/// validate shape where they consume it, not at publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    Handoff {
        task_id: String,
        from_agent: String,
        to_agent: String,
        reason: String,
    },
    TaskUpdate {
        task_id: String,
        status: TaskStatus,
        error: Option<String>,
    },
    TerminalLifecycle {
        task_id: String,
        terminal_id: String,
        exit_code: Option<i32>,
        output: Option<String>,
        errors: Option<String>,
    },
    ContextUpdate {
        context: AgentContext,
    },
    Error {
        message: String,
    },
    Opaque(serde_json::Value),
}

impl MessagePayload {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Handoff { task_id, .. }
            | Self::TaskUpdate { task_id, .. }
            | Self::TerminalLifecycle { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// An event on the bus. Immutable once published; retained in the bounded
/// history ring for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub source_agent: String,
    pub target_agent: Option<String>,
    pub payload: MessagePayload,
    pub timestamp: DateTime<Utc>,
    pub context: Option<AgentContext>,
}

impl Message {
    pub fn involves(&self, agent_id: &str) -> bool {
        self.source_agent == agent_id || self.target_agent.as_deref() == Some(agent_id)
    }
}

/// A message before publication. `MessageBus::publish` assigns the id and
/// timestamp.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub message_type: MessageType,
    pub source_agent: String,
    pub target_agent: Option<String>,
    pub payload: MessagePayload,
    pub context: Option<AgentContext>,
}

impl MessageDraft {
    pub fn new(
        message_type: MessageType,
        source_agent: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            message_type,
            source_agent: source_agent.into(),
            target_agent: None,
            payload,
            context: None,
        }
    }

    pub fn to_agent(mut self, target: impl Into<String>) -> Self {
        self.target_agent = Some(target.into());
        self
    }

    pub fn with_context(mut self, context: AgentContext) -> Self {
        self.context = Some(context);
        self
    }
}
