//! SQLite job broker with a dedicated writer thread and a small read pool.
//!
//! All mutations flow through one writer thread over an mpsc channel with
//! oneshot responses, so claim/complete/fail decisions are serialized; reads
//! go through read-only connections on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, error, warn};

use super::job::{JobState, QueuedJob};
use crate::error::{Result, queue_err, queue_err_with};

const READ_POOL_SIZE: usize = 2;

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// The job goes back to waiting with a backoff delay.
    Retry { attempt: u32, delay_ms: u64 },
    /// The attempt budget is spent; the job is retained as failed.
    Exhausted { attempts: u32 },
}

/// Counts per lifecycle state for one queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueMetrics {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

enum StoreCommand {
    Enqueue {
        job: Box<QueuedJob>,
        response: tokio::sync::oneshot::Sender<Result<()>>,
    },
    Claim {
        queue: String,
        limit: usize,
        response: tokio::sync::oneshot::Sender<Result<Vec<QueuedJob>>>,
    },
    Complete {
        job_id: String,
        result: serde_json::Value,
        response: tokio::sync::oneshot::Sender<Result<()>>,
    },
    Fail {
        job_id: String,
        reason: String,
        response: tokio::sync::oneshot::Sender<Result<FailOutcome>>,
    },
    Cancel {
        job_id: String,
        response: tokio::sync::oneshot::Sender<Result<bool>>,
    },
    Clean {
        grace_ms: i64,
        response: tokio::sync::oneshot::Sender<Result<usize>>,
    },
    Shutdown,
}

struct ReadPool {
    connections: Vec<Mutex<Connection>>,
    next: std::sync::atomic::AtomicUsize,
}

impl ReadPool {
    fn new(db_path: &Path, size: usize) -> Result<Self> {
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(
                db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| queue_err_with("Failed to open read connection", e))?;
            connections.push(Mutex::new(conn));
        }
        Ok(Self {
            connections,
            next: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    fn acquire(&self) -> parking_lot::MutexGuard<'_, Connection> {
        let idx =
            self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.connections.len();
        self.connections[idx].lock()
    }
}

struct StoreInner {
    writer_tx: Sender<StoreCommand>,
    read_pool: ReadPool,
    db_path: PathBuf,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct JobStore {
    inner: Arc<StoreInner>,
}

impl JobStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| queue_err_with("Failed to create broker directory", e))?;
        }

        let (writer_tx, writer_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let thread_db_path = db_path.clone();
        let handle = thread::Builder::new()
            .name("job-store-writer".into())
            .spawn(move || match Self::init_db(&thread_db_path) {
                Ok(conn) => {
                    let _ = ready_tx.send(Ok(()));
                    Self::process_commands(&conn, writer_rx);
                }
                Err(e) => {
                    error!(error = %e, "Job store writer init failed");
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| queue_err_with("Failed to spawn writer thread", e))?;

        ready_rx
            .recv()
            .map_err(|_| queue_err("Writer thread died during init"))??;

        let read_pool = ReadPool::new(&db_path, READ_POOL_SIZE)?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                writer_tx,
                read_pool,
                db_path,
                writer_handle: Mutex::new(Some(handle)),
            }),
        })
    }

    fn init_db(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .map_err(|e| queue_err_with("Failed to open broker database", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| queue_err_with("Failed to enable WAL", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                 id              TEXT PRIMARY KEY,
                 queue           TEXT NOT NULL,
                 task_id         TEXT NOT NULL,
                 task            TEXT NOT NULL,
                 context         TEXT,
                 priority        INTEGER NOT NULL,
                 state           TEXT NOT NULL,
                 attempts_made   INTEGER NOT NULL DEFAULT 0,
                 max_attempts    INTEGER NOT NULL,
                 backoff_base_ms INTEGER NOT NULL,
                 eligible_at     TEXT NOT NULL,
                 created_at      TEXT NOT NULL,
                 updated_at      TEXT NOT NULL,
                 completed_at    TEXT,
                 result          TEXT,
                 failed_reason   TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_jobs_claim
                 ON jobs (queue, state, eligible_at, priority);",
        )
        .map_err(|e| queue_err_with("Failed to create jobs table", e))?;
        Ok(conn)
    }

    fn process_commands(conn: &Connection, rx: Receiver<StoreCommand>) {
        while let Ok(command) = rx.recv() {
            match command {
                StoreCommand::Enqueue { job, response } => {
                    let _ = response.send(Self::enqueue_impl(conn, &job));
                }
                StoreCommand::Claim {
                    queue,
                    limit,
                    response,
                } => {
                    let _ = response.send(Self::claim_impl(conn, &queue, limit));
                }
                StoreCommand::Complete {
                    job_id,
                    result,
                    response,
                } => {
                    let _ = response.send(Self::complete_impl(conn, &job_id, &result));
                }
                StoreCommand::Fail {
                    job_id,
                    reason,
                    response,
                } => {
                    let _ = response.send(Self::fail_impl(conn, &job_id, &reason));
                }
                StoreCommand::Cancel { job_id, response } => {
                    let _ = response.send(Self::cancel_impl(conn, &job_id));
                }
                StoreCommand::Clean { grace_ms, response } => {
                    let _ = response.send(Self::clean_impl(conn, grace_ms));
                }
                StoreCommand::Shutdown => break,
            }
        }
        debug!("Job store writer stopped");
    }

    async fn send_command<T>(
        &self,
        build: impl FnOnce(tokio::sync::oneshot::Sender<Result<T>>) -> StoreCommand,
    ) -> Result<T> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.inner
            .writer_tx
            .send(build(tx))
            .map_err(|_| queue_err("Writer thread disconnected"))?;
        rx.await
            .map_err(|_| queue_err("Writer response channel dropped"))?
    }

    pub async fn enqueue(&self, job: QueuedJob) -> Result<()> {
        self.send_command(|response| StoreCommand::Enqueue {
            job: Box::new(job),
            response,
        })
        .await
    }

    /// Atomically claim up to `limit` eligible jobs, marking them active and
    /// counting the attempt.
    pub async fn claim(&self, queue: &str, limit: usize) -> Result<Vec<QueuedJob>> {
        let queue = queue.to_string();
        self.send_command(|response| StoreCommand::Claim {
            queue,
            limit,
            response,
        })
        .await
    }

    pub async fn complete(&self, job_id: &str, result: serde_json::Value) -> Result<()> {
        let job_id = job_id.to_string();
        self.send_command(|response| StoreCommand::Complete {
            job_id,
            result,
            response,
        })
        .await
    }

    pub async fn fail(&self, job_id: &str, reason: &str) -> Result<FailOutcome> {
        let job_id = job_id.to_string();
        let reason = reason.to_string();
        self.send_command(|response| StoreCommand::Fail {
            job_id,
            reason,
            response,
        })
        .await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        self.send_command(|response| StoreCommand::Cancel { job_id, response })
            .await
    }

    pub async fn clean(&self, grace_ms: i64) -> Result<usize> {
        self.send_command(|response| StoreCommand::Clean { grace_ms, response })
            .await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<QueuedJob>> {
        let job_id = job_id.to_string();
        let inner = Arc::clone(&self.inner);

        tokio::task::spawn_blocking(move || {
            let guard = inner.read_pool.acquire();
            guard
                .query_row(
                    "SELECT id, queue, task, context, priority, state, attempts_made,
                            max_attempts, backoff_base_ms, eligible_at, created_at,
                            updated_at, completed_at, result, failed_reason
                       FROM jobs WHERE id = ?1",
                    params![&job_id],
                    Self::map_job_row,
                )
                .optional()
                .map_err(|e| queue_err_with("Failed to query job", e))?
                .map(Self::row_to_job)
                .transpose()
        })
        .await
        .map_err(|e| queue_err_with("Read task failed", e))?
    }

    pub async fn metrics(&self, queue: &str) -> Result<QueueMetrics> {
        let queue = queue.to_string();
        let inner = Arc::clone(&self.inner);

        tokio::task::spawn_blocking(move || {
            let guard = inner.read_pool.acquire();
            let now = Utc::now().to_rfc3339();
            let mut metrics = QueueMetrics::default();

            let mut stmt = guard
                .prepare("SELECT state, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY state")
                .map_err(|e| queue_err_with("Failed to prepare metrics query", e))?;
            let rows = stmt
                .query_map(params![&queue], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(|e| queue_err_with("Failed to query metrics", e))?;

            for row in rows {
                let (state, count) = row.map_err(|e| queue_err_with("Failed to read row", e))?;
                let count = count as usize;
                match state.as_str() {
                    "waiting" => metrics.waiting = count,
                    "active" => metrics.active = count,
                    "completed" => metrics.completed = count,
                    "failed" => metrics.failed = count,
                    other => warn!(state = %other, "Unexpected job state in broker"),
                }
            }

            let delayed: i64 = guard
                .query_row(
                    "SELECT COUNT(*) FROM jobs
                      WHERE queue = ?1 AND state = 'waiting' AND eligible_at > ?2",
                    params![&queue, &now],
                    |row| row.get(0),
                )
                .map_err(|e| queue_err_with("Failed to count delayed jobs", e))?;

            metrics.delayed = delayed as usize;
            metrics.waiting = metrics.waiting.saturating_sub(metrics.delayed);
            Ok(metrics)
        })
        .await
        .map_err(|e| queue_err_with("Read task failed", e))?
    }

    pub fn db_path(&self) -> &Path {
        &self.inner.db_path
    }

    /// Stop the writer thread. Pending commands already queued are processed
    /// first; the store is unusable afterwards.
    pub fn close(&self) {
        let _ = self.inner.writer_tx.send(StoreCommand::Shutdown);
        if let Some(handle) = self.inner.writer_handle.lock().take()
            && handle.join().is_err()
        {
            warn!("Job store writer panicked during shutdown");
        }
    }

    fn enqueue_impl(conn: &Connection, job: &QueuedJob) -> Result<()> {
        let task_json = serde_json::to_string(&job.task)?;
        let context_json = job
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO jobs (id, queue, task_id, task, context, priority, state,
                               attempts_made, max_attempts, backoff_base_ms,
                               eligible_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'waiting', 0, ?7, ?8, ?9, ?10, ?11)",
            params![
                &job.id,
                &job.queue,
                &job.task.id,
                &task_json,
                &context_json,
                job.priority,
                job.max_attempts,
                job.backoff_base_ms as i64,
                job.eligible_at.to_rfc3339(),
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| queue_err_with("Failed to enqueue job", e))?;

        debug!(job_id = %job.id, task_id = %job.task.id, priority = job.priority, "Job enqueued");
        Ok(())
    }

    fn claim_impl(conn: &Connection, queue: &str, limit: usize) -> Result<Vec<QueuedJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now().to_rfc3339();

        let ids: Vec<String> = {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT id FROM jobs
                      WHERE queue = ?1 AND state = 'waiting' AND eligible_at <= ?2
                      ORDER BY priority ASC, eligible_at ASC, created_at ASC
                      LIMIT ?3",
                )
                .map_err(|e| queue_err_with("Failed to prepare claim query", e))?;
            let rows = stmt
                .query_map(params![queue, &now, limit as i64], |row| row.get(0))
                .map_err(|e| queue_err_with("Failed to query claimable jobs", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| queue_err_with("Failed to collect job ids", e))?
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            conn.execute(
                "UPDATE jobs
                    SET state = 'active', attempts_made = attempts_made + 1, updated_at = ?2
                  WHERE id = ?1",
                params![&id, &now],
            )
            .map_err(|e| queue_err_with("Failed to mark job active", e))?;

            let job = conn
                .query_row(
                    "SELECT id, queue, task, context, priority, state, attempts_made,
                            max_attempts, backoff_base_ms, eligible_at, created_at,
                            updated_at, completed_at, result, failed_reason
                       FROM jobs WHERE id = ?1",
                    params![&id],
                    Self::map_job_row,
                )
                .map_err(|e| queue_err_with("Failed to load claimed job", e))?;
            claimed.push(Self::row_to_job(job)?);
        }

        Ok(claimed)
    }

    fn complete_impl(conn: &Connection, job_id: &str, result: &serde_json::Value) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let changed = conn
            .execute(
                "UPDATE jobs
                    SET state = 'completed', result = ?2, completed_at = ?3, updated_at = ?3
                  WHERE id = ?1 AND state = 'active'",
                params![job_id, serde_json::to_string(result)?, &now],
            )
            .map_err(|e| queue_err_with("Failed to complete job", e))?;

        if changed == 0 {
            warn!(job_id = %job_id, "Completed job was not active (cancelled mid-flight?)");
        }
        Ok(())
    }

    fn fail_impl(conn: &Connection, job_id: &str, reason: &str) -> Result<FailOutcome> {
        let (attempts_made, max_attempts, backoff_base_ms): (u32, u32, i64) = conn
            .query_row(
                "SELECT attempts_made, max_attempts, backoff_base_ms FROM jobs WHERE id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|e| queue_err_with("Failed to load job for failure", e))?;

        let now = Utc::now();
        if attempts_made < max_attempts {
            let exponent = attempts_made.saturating_sub(1).min(16);
            let delay_ms = (backoff_base_ms as u64).saturating_mul(1u64 << exponent);
            let eligible_at = now + chrono::Duration::milliseconds(delay_ms as i64);

            conn.execute(
                "UPDATE jobs
                    SET state = 'waiting', eligible_at = ?2, failed_reason = ?3, updated_at = ?4
                  WHERE id = ?1",
                params![
                    job_id,
                    eligible_at.to_rfc3339(),
                    reason,
                    now.to_rfc3339()
                ],
            )
            .map_err(|e| queue_err_with("Failed to reschedule job", e))?;

            Ok(FailOutcome::Retry {
                attempt: attempts_made,
                delay_ms,
            })
        } else {
            conn.execute(
                "UPDATE jobs
                    SET state = 'failed', failed_reason = ?2, completed_at = ?3, updated_at = ?3
                  WHERE id = ?1",
                params![job_id, reason, now.to_rfc3339()],
            )
            .map_err(|e| queue_err_with("Failed to mark job failed", e))?;

            Ok(FailOutcome::Exhausted {
                attempts: attempts_made,
            })
        }
    }

    fn cancel_impl(conn: &Connection, job_id: &str) -> Result<bool> {
        let removed = conn
            .execute(
                "DELETE FROM jobs WHERE id = ?1 AND state NOT IN ('active', 'completed')",
                params![job_id],
            )
            .map_err(|e| queue_err_with("Failed to cancel job", e))?;
        Ok(removed > 0)
    }

    fn clean_impl(conn: &Connection, grace_ms: i64) -> Result<usize> {
        let now = Utc::now();
        let completed_cutoff = (now - chrono::Duration::milliseconds(grace_ms)).to_rfc3339();
        // Failures are retained an order of magnitude longer for postmortem.
        let failed_cutoff = (now - chrono::Duration::milliseconds(grace_ms * 24)).to_rfc3339();

        let removed = conn
            .execute(
                "DELETE FROM jobs
                  WHERE (state = 'completed' AND completed_at < ?1)
                     OR (state = 'failed' AND completed_at < ?2)",
                params![&completed_cutoff, &failed_cutoff],
            )
            .map_err(|e| queue_err_with("Failed to clean jobs", e))?;
        Ok(removed)
    }

    #[allow(clippy::type_complexity)]
    fn map_job_row(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<(
        String,
        String,
        String,
        Option<String>,
        i64,
        String,
        u32,
        u32,
        i64,
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
    )> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
            row.get(10)?,
            row.get(11)?,
            row.get(12)?,
            row.get(13)?,
            row.get(14)?,
        ))
    }

    #[allow(clippy::type_complexity)]
    fn row_to_job(
        row: (
            String,
            String,
            String,
            Option<String>,
            i64,
            String,
            u32,
            u32,
            i64,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
        ),
    ) -> Result<QueuedJob> {
        let (
            id,
            queue,
            task_json,
            context_json,
            priority,
            state,
            attempts_made,
            max_attempts,
            backoff_base_ms,
            eligible_at,
            created_at,
            updated_at,
            completed_at,
            result_json,
            failed_reason,
        ) = row;

        let state = match state.as_str() {
            "waiting" => JobState::Waiting,
            "active" => JobState::Active,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            other => return Err(queue_err(format!("Unknown job state in broker: {}", other))),
        };

        Ok(QueuedJob {
            id,
            queue,
            task: serde_json::from_str(&task_json)?,
            context: context_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            priority,
            state,
            attempts_made,
            max_attempts,
            backoff_base_ms: backoff_base_ms as u64,
            eligible_at: parse_timestamp(&eligible_at)?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
            result: result_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            failed_reason,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| queue_err_with("Failed to parse timestamp", e))
}
