//! Task and context types shared by the handoff manager and the task queue.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    /// Numeric queue priority. Lower numbers are served first.
    pub fn queue_value(&self) -> i64 {
        match self {
            Self::Urgent => 1,
            Self::High => 2,
            Self::Normal => 5,
            Self::Low => 10,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A unit of work exchanged between agents.
///
/// Mutated in place by whichever component currently owns it; never deleted.
/// Terminal tasks are retained in handoff history for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub status: TaskStatus,
    pub source_agent: String,
    pub target_agent: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentTask {
    pub fn new(
        task_type: impl Into<String>,
        source_agent: impl Into<String>,
        target_agent: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload: serde_json::Value::Null,
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            source_agent: source_agent.into(),
            target_agent: target_agent.into(),
            created_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }
}

/// Cross-cutting request metadata threaded through every hop.
///
/// Immutable once created for a unit of work; copied, never mutated, when
/// handed to a new agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentContext {
    pub request_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentContext {
    pub fn new(request_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            session_id: session_id.into(),
            user_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_queue_values() {
        assert_eq!(TaskPriority::Urgent.queue_value(), 1);
        assert_eq!(TaskPriority::High.queue_value(), 2);
        assert_eq!(TaskPriority::Normal.queue_value(), 5);
        assert_eq!(TaskPriority::Low.queue_value(), 10);
    }

    #[test]
    fn test_task_lifecycle() {
        let mut task = AgentTask::new("flight_search", "orchestrator", "flight-search");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.completed_at.is_none());

        task.start();
        assert_eq!(task.status, TaskStatus::InProgress);

        task.complete();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert!(task.status.is_terminal());
    }

    #[test]
    fn test_task_failure_attaches_error() {
        let mut task = AgentTask::new("client_enrichment", "orchestrator", "client-data");
        task.fail("upstream returned 503");

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("upstream returned 503"));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_context_is_cloned_not_shared() {
        let ctx = AgentContext::new("req-1", "sess-1")
            .with_user("user-9")
            .with_metadata("channel", serde_json::json!("email"));

        let copy = ctx.clone();
        assert_eq!(copy.request_id, "req-1");
        assert_eq!(copy.user_id.as_deref(), Some("user-9"));
        assert_eq!(copy.metadata.len(), 1);
    }
}
