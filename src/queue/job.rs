use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{AgentContext, AgentTask, TaskPriority};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2000;

/// Lifecycle state of a queued job. `Delayed` is derived (a waiting job
/// whose eligibility is in the future); `Unknown` is only ever reported for
/// a job id the broker no longer knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scheduling options for `TaskQueue::add_task`.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Overrides the task's own priority when set.
    pub priority: Option<TaskPriority>,
    /// Delay before the job becomes eligible for pickup.
    pub delay: Option<Duration>,
    /// Total attempt budget; defaults to 3.
    pub attempts: Option<u32>,
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }
}

/// A task as represented inside the durable queue, with queue-specific
/// scheduling metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub queue: String,
    pub task: AgentTask,
    pub context: Option<AgentContext>,
    /// Numeric priority; lower is served first.
    pub priority: i64,
    pub state: JobState,
    /// Attempts started so far (incremented on claim).
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub eligible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
}

impl QueuedJob {
    pub fn new(
        queue: impl Into<String>,
        task: AgentTask,
        context: Option<AgentContext>,
        options: &QueueOptions,
        backoff_base_ms: u64,
    ) -> Self {
        let now = Utc::now();
        let priority = options.priority.unwrap_or(task.priority).queue_value();
        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.into(),
            task,
            context,
            priority,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: options.attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            backoff_base_ms,
            eligible_at: now + options.delay.unwrap_or_else(Duration::zero),
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            failed_reason: None,
        }
    }

    /// Exponential backoff for the next retry after attempt `attempts_made`.
    pub fn backoff_delay_ms(&self) -> u64 {
        let exponent = self.attempts_made.saturating_sub(1).min(16);
        self.backoff_base_ms.saturating_mul(1u64 << exponent)
    }

    /// The externally reported state: a waiting job not yet eligible shows
    /// as delayed.
    pub fn reported_state(&self, now: DateTime<Utc>) -> JobState {
        if self.state == JobState::Waiting && self.eligible_at > now {
            JobState::Delayed
        } else {
            self.state
        }
    }
}

/// Status report returned by `TaskQueue::job_status`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub task: Option<AgentTask>,
    pub result: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
}

impl JobStatus {
    pub fn unknown(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Unknown,
            task: None,
            result: None,
            failed_reason: None,
        }
    }
}
