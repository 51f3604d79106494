//! Consumer loop for the job broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::job::QueuedJob;
use super::store::{FailOutcome, JobStore};
use crate::error::Result;
use crate::task::{AgentContext, AgentTask};

/// Implemented by whatever executes queued tasks. The return value is stored
/// with the completed job and carried on the completion event.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(
        &self,
        task: AgentTask,
        context: Option<AgentContext>,
    ) -> Result<serde_json::Value>;
}

/// Lifecycle events observed on `TaskQueue::events()`.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Completed {
        job_id: String,
        task_id: String,
        result: serde_json::Value,
    },
    Retrying {
        job_id: String,
        task_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    Failed {
        job_id: String,
        task_id: String,
        reason: String,
        attempts: u32,
    },
}

/// One consumer group: a claim loop feeding a semaphore-bounded set of
/// processing tasks.
pub(crate) struct QueueWorker {
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    concurrency: u32,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    pub(crate) fn spawn(
        store: JobStore,
        queue: String,
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
        poll_interval: Duration,
        events: broadcast::Sender<QueueEvent>,
    ) -> Self {
        let concurrency = concurrency.max(1) as u32;
        let shutdown = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let semaphore = Arc::new(Semaphore::new(concurrency as usize));

        let loop_shutdown = Arc::clone(&shutdown);
        let loop_wake = Arc::clone(&wake);
        let loop_semaphore = Arc::clone(&semaphore);

        let handle = tokio::spawn(async move {
            info!(queue = %queue, concurrency, "Queue worker started");
            loop {
                if loop_shutdown.load(Ordering::Acquire) {
                    break;
                }

                let permit = match Arc::clone(&loop_semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                if loop_shutdown.load(Ordering::Acquire) {
                    break;
                }

                match store.claim(&queue, 1).await {
                    Ok(mut jobs) => {
                        if let Some(job) = jobs.pop() {
                            let store = store.clone();
                            let processor = Arc::clone(&processor);
                            let events = events.clone();
                            tokio::spawn(async move {
                                Self::process_one(&store, processor.as_ref(), &events, job).await;
                                drop(permit);
                            });
                        } else {
                            drop(permit);
                            tokio::select! {
                                _ = loop_wake.notified() => {}
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        warn!(queue = %queue, error = %e, "Job claim failed");
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
            debug!("Queue worker loop stopped");
        });

        Self {
            shutdown,
            wake,
            semaphore,
            concurrency,
            handle,
        }
    }

    async fn process_one(
        store: &JobStore,
        processor: &dyn JobProcessor,
        events: &broadcast::Sender<QueueEvent>,
        job: QueuedJob,
    ) {
        debug!(
            job_id = %job.id,
            task_id = %job.task.id,
            attempt = job.attempts_made,
            "Processing job"
        );

        match processor.process(job.task.clone(), job.context.clone()).await {
            Ok(result) => {
                if let Err(e) = store.complete(&job.id, result.clone()).await {
                    warn!(job_id = %job.id, error = %e, "Failed to record completion");
                    return;
                }
                let _ = events.send(QueueEvent::Completed {
                    job_id: job.id,
                    task_id: job.task.id,
                    result,
                });
            }
            Err(e) => {
                let reason = e.to_string();
                match store.fail(&job.id, &reason).await {
                    Ok(FailOutcome::Retry { attempt, delay_ms }) => {
                        debug!(
                            job_id = %job.id,
                            attempt,
                            delay_ms,
                            "Job attempt failed, retry scheduled"
                        );
                        let _ = events.send(QueueEvent::Retrying {
                            job_id: job.id,
                            task_id: job.task.id,
                            attempt,
                            delay_ms,
                        });
                    }
                    Ok(FailOutcome::Exhausted { attempts }) => {
                        warn!(
                            job_id = %job.id,
                            task_id = %job.task.id,
                            attempts,
                            reason = %reason,
                            "Job failed permanently"
                        );
                        let _ = events.send(QueueEvent::Failed {
                            job_id: job.id,
                            task_id: job.task.id,
                            reason,
                            attempts,
                        });
                    }
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "Failed to record failure");
                    }
                }
            }
        }
    }

    /// Stop claiming, wait for in-flight jobs to finish, then return.
    pub(crate) async fn drain(self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_waiters();

        if self.handle.await.is_err() {
            warn!("Queue worker loop panicked");
        }

        // Every in-flight job holds a permit; acquiring the full budget
        // means the last one has finished.
        match self.semaphore.acquire_many(self.concurrency).await {
            Ok(_all) => info!("Queue worker drained"),
            Err(_) => warn!("Queue worker semaphore closed during drain"),
        }
    }
}
