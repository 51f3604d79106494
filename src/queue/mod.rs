//! Durable, prioritized, retryable task queue over a SQLite broker.
//!
//! `add_task` returns once the job is durably enqueued; execution happens on
//! a separate consumer loop with its own concurrency limit. Completion and
//! failure are observed through the `events()` stream, not by polling.

mod job;
mod store;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

pub use job::{JobState, JobStatus, QueueOptions, QueuedJob};
pub use store::{FailOutcome, JobStore, QueueMetrics};
pub use worker::{JobProcessor, QueueEvent};

use crate::config::QueueConfig;
use crate::error::{FlowError, Result};
use crate::task::{AgentContext, AgentTask};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct TaskQueue {
    config: QueueConfig,
    store: JobStore,
    events: broadcast::Sender<QueueEvent>,
    worker: Mutex<Option<worker::QueueWorker>>,
}

impl TaskQueue {
    pub fn open(config: QueueConfig) -> Result<Self> {
        let store = JobStore::open(&config.db_path)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(
            queue = %config.queue_name,
            db = %config.db_path.display(),
            "Task queue opened"
        );
        Ok(Self {
            config,
            store,
            events,
            worker: Mutex::new(None),
        })
    }

    /// Durably enqueue a task. Returns the opaque job id.
    pub async fn add_task(
        &self,
        task: AgentTask,
        context: Option<AgentContext>,
        options: QueueOptions,
    ) -> Result<String> {
        let mut options = options;
        if options.attempts.is_none() {
            options.attempts = Some(self.config.default_attempts);
        }

        let job = QueuedJob::new(
            &self.config.queue_name,
            task,
            context,
            &options,
            self.config.backoff_base_ms,
        );
        let job_id = job.id.clone();
        self.store.enqueue(job).await?;
        Ok(job_id)
    }

    /// Register the single consumer group for this queue.
    pub fn start_worker(&self, processor: Arc<dyn JobProcessor>) -> Result<()> {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return Err(FlowError::WorkerAlreadyRegistered(
                self.config.queue_name.clone(),
            ));
        }

        *slot = Some(worker::QueueWorker::spawn(
            self.store.clone(),
            self.config.queue_name.clone(),
            processor,
            self.config.concurrency,
            Duration::from_millis(self.config.poll_interval_ms),
            self.events.clone(),
        ));
        Ok(())
    }

    /// Drain in-flight jobs and deregister the consumer group.
    pub async fn stop_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.drain().await;
        }
    }

    pub async fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        match self.store.get_job(job_id).await? {
            Some(job) => Ok(JobStatus {
                job_id: job.id.clone(),
                state: job.reported_state(Utc::now()),
                task: Some(job.task),
                result: job.result,
                failed_reason: job.failed_reason,
            }),
            None => Ok(JobStatus::unknown(job_id)),
        }
    }

    /// Remove a job that has not yet completed. Returns false when the job
    /// no longer exists or is mid-execution.
    pub async fn cancel_task(&self, job_id: &str) -> Result<bool> {
        self.store.cancel(job_id).await
    }

    pub async fn metrics(&self) -> Result<QueueMetrics> {
        self.store.metrics(&self.config.queue_name).await
    }

    /// Evict completed jobs older than `grace_ms` and failed jobs older than
    /// `24 * grace_ms`.
    pub async fn clean_jobs(&self, grace_ms: i64) -> Result<usize> {
        self.store.clean(grace_ms).await
    }

    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub async fn close(&self) {
        self.stop_worker().await;
        self.store.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::task::TaskPriority;

    fn test_config(dir: &TempDir) -> QueueConfig {
        QueueConfig {
            db_path: dir.path().join("queue.db"),
            backoff_base_ms: 20,
            poll_interval_ms: 10,
            ..QueueConfig::default()
        }
    }

    struct OkProcessor;

    #[async_trait]
    impl JobProcessor for OkProcessor {
        async fn process(
            &self,
            task: AgentTask,
            _context: Option<AgentContext>,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "handled": task.id }))
        }
    }

    struct FailingProcessor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobProcessor for FailingProcessor {
        async fn process(
            &self,
            _task: AgentTask,
            _context: Option<AgentContext>,
        ) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FlowError::Other("processor always fails".into()))
        }
    }

    async fn wait_for_event(
        rx: &mut broadcast::Receiver<QueueEvent>,
        mut pred: impl FnMut(&QueueEvent) -> bool,
    ) -> QueueEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for queue event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_add_task_and_complete() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::open(test_config(&dir)).unwrap();
        let mut events = queue.events();

        let task = AgentTask::new("flight_search", "orchestrator", "worker");
        let task_id = task.id.clone();
        let job_id = queue.add_task(task, None, QueueOptions::new()).await.unwrap();

        queue.start_worker(Arc::new(OkProcessor)).unwrap();

        let event = wait_for_event(&mut events, |e| matches!(e, QueueEvent::Completed { .. })).await;
        match event {
            QueueEvent::Completed {
                job_id: done_id,
                task_id: done_task,
                result,
            } => {
                assert_eq!(done_id, job_id);
                assert_eq!(done_task, task_id);
                assert_eq!(result["handled"], serde_json::json!(task_id));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let status = queue.job_status(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert!(status.result.is_some());

        queue.close().await;
    }

    #[tokio::test]
    async fn test_failing_job_retries_with_nondecreasing_delay() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::open(test_config(&dir)).unwrap();
        let mut events = queue.events();

        let processor = Arc::new(FailingProcessor {
            calls: AtomicUsize::new(0),
        });

        let task = AgentTask::new("client_enrichment", "orchestrator", "worker");
        let job_id = queue
            .add_task(task, None, QueueOptions::new().with_attempts(3))
            .await
            .unwrap();

        queue.start_worker(Arc::clone(&processor) as Arc<dyn JobProcessor>).unwrap();

        let mut delays = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for queue event")
                .expect("event channel closed");
            match event {
                QueueEvent::Retrying { delay_ms, .. } => delays.push(delay_ms),
                QueueEvent::Failed {
                    job_id: failed_id,
                    attempts,
                    ..
                } => {
                    assert_eq!(failed_id, job_id);
                    assert_eq!(attempts, 3);
                    break;
                }
                QueueEvent::Completed { .. } => panic!("job should never complete"),
            }
        }

        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(delays.len(), 2);
        assert!(delays[0] <= delays[1], "backoff must be non-decreasing");

        let status = queue.job_status(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.failed_reason.is_some());

        queue.close().await;
    }

    #[tokio::test]
    async fn test_priority_serves_urgent_first() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.concurrency = 1;
        let queue = TaskQueue::open(config).unwrap();
        let mut events = queue.events();

        let low = AgentTask::new("report", "orchestrator", "worker")
            .with_priority(TaskPriority::Low);
        let urgent = AgentTask::new("rescue", "orchestrator", "worker")
            .with_priority(TaskPriority::Urgent);
        let urgent_task_id = urgent.id.clone();

        queue.add_task(low, None, QueueOptions::new()).await.unwrap();
        queue.add_task(urgent, None, QueueOptions::new()).await.unwrap();

        queue.start_worker(Arc::new(OkProcessor)).unwrap();

        let first =
            wait_for_event(&mut events, |e| matches!(e, QueueEvent::Completed { .. })).await;
        match first {
            QueueEvent::Completed { task_id, .. } => assert_eq!(task_id, urgent_task_id),
            other => panic!("unexpected event {:?}", other),
        }

        queue.close().await;
    }

    #[tokio::test]
    async fn test_cancel_and_unknown_status() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::open(test_config(&dir)).unwrap();

        let task = AgentTask::new("flight_search", "orchestrator", "worker");
        let job_id = queue.add_task(task, None, QueueOptions::new()).await.unwrap();

        assert!(queue.cancel_task(&job_id).await.unwrap());
        assert!(!queue.cancel_task(&job_id).await.unwrap());

        let status = queue.job_status(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Unknown);
        assert!(status.task.is_none());

        queue.close().await;
    }

    #[tokio::test]
    async fn test_metrics_and_delayed_reporting() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::open(test_config(&dir)).unwrap();

        let immediate = AgentTask::new("a", "x", "y");
        let delayed = AgentTask::new("b", "x", "y");
        queue
            .add_task(immediate, None, QueueOptions::new())
            .await
            .unwrap();
        let delayed_id = queue
            .add_task(
                delayed,
                None,
                QueueOptions::new().with_delay(chrono::Duration::seconds(60)),
            )
            .await
            .unwrap();

        let metrics = queue.metrics().await.unwrap();
        assert_eq!(metrics.waiting, 1);
        assert_eq!(metrics.delayed, 1);

        let status = queue.job_status(&delayed_id).await.unwrap();
        assert_eq!(status.state, JobState::Delayed);

        queue.close().await;
    }

    struct SlowProcessor;

    #[async_trait]
    impl JobProcessor for SlowProcessor {
        async fn process(
            &self,
            task: AgentTask,
            _context: Option<AgentContext>,
        ) -> Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(serde_json::json!({ "handled": task.id }))
        }
    }

    #[tokio::test]
    async fn test_stop_worker_drains_in_flight_jobs() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::open(test_config(&dir)).unwrap();

        let task = AgentTask::new("flight_search", "orchestrator", "worker");
        let job_id = queue.add_task(task, None, QueueOptions::new()).await.unwrap();

        queue.start_worker(Arc::new(SlowProcessor)).unwrap();

        // Wait until the job is actually mid-execution.
        for _ in 0..100 {
            if queue.metrics().await.unwrap().active == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.metrics().await.unwrap().active, 1);

        queue.stop_worker().await;

        // Drain finished the in-flight job rather than abandoning it.
        let status = queue.job_status(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(queue.metrics().await.unwrap().active, 0);

        queue.close().await;
    }

    #[tokio::test]
    async fn test_second_worker_rejected_and_stop_allows_restart() {
        let dir = TempDir::new().unwrap();
        let queue = TaskQueue::open(test_config(&dir)).unwrap();

        queue.start_worker(Arc::new(OkProcessor)).unwrap();
        let err = queue.start_worker(Arc::new(OkProcessor)).unwrap_err();
        assert!(matches!(err, FlowError::WorkerAlreadyRegistered(_)));

        queue.stop_worker().await;
        queue.start_worker(Arc::new(OkProcessor)).unwrap();
        queue.close().await;
    }
}
