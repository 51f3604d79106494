//! Transfers task ownership between agents, in-process or via isolated
//! terminal workers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::registry::AgentRegistry;
use super::terminal::{TerminalInstance, TerminalOverrides, TerminalStatus, build_launch_spec};
use crate::bus::{MessageBus, MessageDraft, MessagePayload, MessageType};
use crate::config::TerminalConfig;
use crate::error::{FlowError, Result};
use crate::spawn::{WorkerExit, WorkerSpawner};
use crate::task::{AgentContext, AgentTask, TaskStatus};

/// A proposed transfer of one task between two agents.
#[derive(Debug, Clone)]
pub struct AgentHandoff {
    pub from_agent: String,
    pub to_agent: String,
    pub task: AgentTask,
    pub context: AgentContext,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl AgentHandoff {
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        task: AgentTask,
        context: AgentContext,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            task,
            context,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffKind {
    InProcess,
    Terminal,
}

/// Append-only audit record of one transfer.
#[derive(Debug, Clone, Serialize)]
pub struct HandoffRecord {
    pub task_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub reason: String,
    pub kind: HandoffKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct HandoffFilter {
    pub agent: Option<String>,
    pub task_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AgentHandoffCounts {
    pub sent: usize,
    pub received: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandoffStats {
    pub total_handoffs: usize,
    pub pending: usize,
    pub by_agent: HashMap<String, AgentHandoffCounts>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TerminalStats {
    pub idle: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

struct ActiveTerminal {
    task: AgentTask,
    context: AgentContext,
    instance: TerminalInstance,
}

/// Orchestrates task ownership transfer. One pending handoff may exist per
/// task id; check-then-remove on accept/reject is a single critical section
/// per task id. Construct explicitly at startup; `reset()` between test
/// runs, `close()` at shutdown.
pub struct HandoffManager {
    bus: MessageBus,
    registry: Arc<dyn AgentRegistry>,
    spawner: Arc<dyn WorkerSpawner>,
    terminal_defaults: TerminalConfig,
    pending: Mutex<HashMap<String, AgentHandoff>>,
    history: RwLock<Vec<HandoffRecord>>,
    terminals: Arc<DashMap<String, ActiveTerminal>>,
    terminal_archive: Arc<RwLock<Vec<TerminalInstance>>>,
}

impl HandoffManager {
    pub fn new(
        bus: MessageBus,
        registry: Arc<dyn AgentRegistry>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        Self {
            bus,
            registry,
            spawner,
            terminal_defaults: TerminalConfig::default(),
            pending: Mutex::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            terminals: Arc::new(DashMap::new()),
            terminal_archive: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_terminal_defaults(mut self, defaults: TerminalConfig) -> Self {
        self.terminal_defaults = defaults;
        self
    }

    /// Record a handoff as pending and notify the bus. A second handoff for
    /// the same task id overwrites the pending entry (the newest proposal
    /// wins); the superseded one remains in history.
    pub async fn handoff(&self, mut handoff: AgentHandoff) -> Result<()> {
        if self.registry.get_agent(&handoff.to_agent).is_none() {
            return Err(FlowError::UnknownAgent(handoff.to_agent));
        }

        handoff.task.source_agent = handoff.from_agent.clone();
        handoff.task.target_agent = handoff.to_agent.clone();
        handoff.task.status = TaskStatus::Pending;

        self.history.write().push(HandoffRecord {
            task_id: handoff.task.id.clone(),
            from_agent: handoff.from_agent.clone(),
            to_agent: handoff.to_agent.clone(),
            reason: handoff.reason.clone(),
            kind: HandoffKind::InProcess,
            created_at: handoff.created_at,
        });

        let draft = MessageDraft::new(
            MessageType::AgentHandoff,
            handoff.from_agent.clone(),
            MessagePayload::Handoff {
                task_id: handoff.task.id.clone(),
                from_agent: handoff.from_agent.clone(),
                to_agent: handoff.to_agent.clone(),
                reason: handoff.reason.clone(),
            },
        )
        .to_agent(handoff.to_agent.clone())
        .with_context(handoff.context.clone());

        {
            let mut pending = self.pending.lock();
            if let Some(superseded) = pending.insert(handoff.task.id.clone(), handoff) {
                warn!(
                    task_id = %superseded.task.id,
                    superseded_target = %superseded.to_agent,
                    "Pending handoff overwritten by newer proposal"
                );
            }
        }

        self.bus.publish(draft).await;
        Ok(())
    }

    /// Claim a pending handoff. Returns the task, now in progress, for
    /// execution by the caller.
    pub async fn accept_handoff(&self, task_id: &str, agent_id: &str) -> Result<AgentTask> {
        let handoff = self.take_pending(task_id, agent_id)?;

        let mut task = handoff.task;
        task.start();
        info!(task_id = %task.id, agent = %agent_id, "Handoff accepted");
        Ok(task)
    }

    /// Decline a pending handoff. The task fails with the given reason and a
    /// failure message is addressed back to the original sender.
    pub async fn reject_handoff(
        &self,
        task_id: &str,
        agent_id: &str,
        reason: &str,
    ) -> Result<AgentTask> {
        let handoff = self.take_pending(task_id, agent_id)?;

        let mut task = handoff.task;
        task.fail(reason);
        info!(task_id = %task.id, agent = %agent_id, reason = %reason, "Handoff rejected");

        self.bus
            .publish(
                MessageDraft::new(
                    MessageType::TaskFailed,
                    handoff.to_agent.clone(),
                    MessagePayload::TaskUpdate {
                        task_id: task.id.clone(),
                        status: TaskStatus::Failed,
                        error: Some(reason.to_string()),
                    },
                )
                .to_agent(handoff.from_agent.clone())
                .with_context(handoff.context.clone()),
            )
            .await;

        Ok(task)
    }

    /// The exists-then-remove critical section shared by accept and reject.
    fn take_pending(&self, task_id: &str, agent_id: &str) -> Result<AgentHandoff> {
        let mut pending = self.pending.lock();
        let Some(handoff) = pending.remove(task_id) else {
            return Err(FlowError::NoPendingHandoff(task_id.to_string()));
        };
        if handoff.to_agent != agent_id {
            let expected = handoff.to_agent.clone();
            pending.insert(task_id.to_string(), handoff);
            return Err(FlowError::WrongRecipient {
                task_id: task_id.to_string(),
                expected,
                actual: agent_id.to_string(),
            });
        }
        Ok(handoff)
    }

    /// Delegate a task to an isolated out-of-process worker. Returns a
    /// snapshot of the tracked terminal instance.
    pub async fn handoff_to_terminal(
        &self,
        mut task: AgentTask,
        overrides: TerminalOverrides,
        context: AgentContext,
    ) -> Result<TerminalInstance> {
        let spec = build_launch_spec(&task, &overrides, &context, &self.terminal_defaults);

        self.history.write().push(HandoffRecord {
            task_id: task.id.clone(),
            from_agent: task.source_agent.clone(),
            to_agent: task.target_agent.clone(),
            reason: format!("terminal:{}", spec.agent_kind),
            kind: HandoffKind::Terminal,
            created_at: Utc::now(),
        });

        let worker = match self.spawner.spawn(spec.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                task.fail(format!("worker spawn failed: {}", e));
                self.bus
                    .publish(
                        MessageDraft::new(
                            MessageType::TaskFailed,
                            task.target_agent.clone(),
                            MessagePayload::TaskUpdate {
                                task_id: task.id.clone(),
                                status: TaskStatus::Failed,
                                error: task.error.clone(),
                            },
                        )
                        .to_agent(task.source_agent.clone())
                        .with_context(context),
                    )
                    .await;
                return Err(FlowError::Spawn(e.to_string()));
            }
        };

        task.start();

        let instance = TerminalInstance {
            id: worker.id.clone(),
            pid: worker.pid,
            status: TerminalStatus::Running,
            task_id: task.id.clone(),
            agent_kind: spec.agent_kind.clone(),
            branch: spec.branch.clone(),
            worktree_path: worker.worktree_path.clone(),
            spawned_at: Utc::now(),
            output: String::new(),
            errors: String::new(),
        };

        self.bus
            .publish(
                MessageDraft::new(
                    MessageType::TerminalSpawned,
                    task.source_agent.clone(),
                    MessagePayload::TerminalLifecycle {
                        task_id: task.id.clone(),
                        terminal_id: instance.id.clone(),
                        exit_code: None,
                        output: None,
                        errors: None,
                    },
                )
                .to_agent(task.target_agent.clone())
                .with_context(context.clone()),
            )
            .await;

        let snapshot = instance.clone();
        let task_id = task.id.clone();
        self.terminals.insert(
            task_id.clone(),
            ActiveTerminal {
                task,
                context,
                instance,
            },
        );

        // One-shot exit watcher, private to this worker handle.
        let terminals = Arc::clone(&self.terminals);
        let archive = Arc::clone(&self.terminal_archive);
        let bus = self.bus.clone();
        let exit_rx = worker.exit;
        tokio::spawn(async move {
            let exit = exit_rx.await.unwrap_or_else(|_| WorkerExit {
                exit_code: None,
                output: String::new(),
                errors: "worker exited without reporting".to_string(),
            });
            Self::resolve_terminal_exit(&terminals, &archive, &bus, &task_id, exit).await;
        });

        Ok(snapshot)
    }

    async fn resolve_terminal_exit(
        terminals: &DashMap<String, ActiveTerminal>,
        archive: &RwLock<Vec<TerminalInstance>>,
        bus: &MessageBus,
        task_id: &str,
        exit: WorkerExit,
    ) {
        let Some((_, mut entry)) = terminals.remove(task_id) else {
            // Already resolved by an explicit terminate.
            debug!(task_id = %task_id, "Terminal exit for untracked task");
            return;
        };

        entry.instance.output = exit.output.clone();
        entry.instance.errors = exit.errors.clone();

        let message_type = if exit.success() {
            entry.task.complete();
            entry.instance.status = TerminalStatus::Completed;
            MessageType::TerminalCompleted
        } else {
            entry
                .task
                .fail(format!("terminal worker exited with code {:?}", exit.exit_code));
            entry.instance.status = TerminalStatus::Failed;
            MessageType::TerminalFailed
        };

        info!(
            task_id = %task_id,
            terminal_id = %entry.instance.id,
            exit_code = ?exit.exit_code,
            "Terminal worker exited"
        );

        bus.publish(
            MessageDraft::new(
                message_type,
                entry.task.target_agent.clone(),
                MessagePayload::TerminalLifecycle {
                    task_id: task_id.to_string(),
                    terminal_id: entry.instance.id.clone(),
                    exit_code: exit.exit_code,
                    output: Some(exit.output),
                    errors: Some(exit.errors),
                },
            )
            .to_agent(entry.task.source_agent.clone())
            .with_context(entry.context.clone()),
        )
        .await;

        archive.write().push(entry.instance);
    }

    /// Fan a batch of tasks out to terminal workers concurrently. A failed
    /// spawn is logged and skipped; the result maps only the task ids that
    /// succeeded.
    pub async fn batch_handoff_to_terminals(
        &self,
        tasks: Vec<AgentTask>,
        context: &AgentContext,
    ) -> HashMap<String, TerminalInstance> {
        let futures: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let task_id = task.id.clone();
                let context = context.clone();
                async move {
                    let result = self
                        .handoff_to_terminal(task, TerminalOverrides::default(), context)
                        .await;
                    (task_id, result)
                }
            })
            .collect();

        let mut spawned = HashMap::new();
        for (task_id, result) in join_all(futures).await {
            match result {
                Ok(instance) => {
                    spawned.insert(task_id, instance);
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Batch terminal handoff failed for task");
                }
            }
        }
        spawned
    }

    /// Forcibly stop the worker executing a task.
    pub async fn terminate_terminal_handoff(
        &self,
        task_id: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let worker_id = self
            .terminals
            .get(task_id)
            .map(|entry| entry.instance.id.clone())
            .ok_or_else(|| FlowError::NoTerminalForTask(task_id.to_string()))?;

        self.spawner.terminate(&worker_id, reason).await?;

        // The exit watcher skips entries we remove here, so termination and
        // natural exit cannot both publish.
        let Some((_, mut entry)) = self.terminals.remove(task_id) else {
            return Ok(());
        };

        let reason = reason.unwrap_or("terminated").to_string();
        entry.task.fail(format!("terminal handoff terminated: {}", reason));
        entry.instance.status = TerminalStatus::Failed;

        self.bus
            .publish(
                MessageDraft::new(
                    MessageType::TerminalTerminated,
                    entry.task.target_agent.clone(),
                    MessagePayload::TerminalLifecycle {
                        task_id: task_id.to_string(),
                        terminal_id: entry.instance.id.clone(),
                        exit_code: None,
                        output: None,
                        errors: Some(reason),
                    },
                )
                .to_agent(entry.task.source_agent.clone())
                .with_context(entry.context.clone()),
            )
            .await;

        self.terminal_archive.write().push(entry.instance);
        Ok(())
    }

    pub fn pending_handoffs(&self, agent_id: &str) -> Vec<AgentHandoff> {
        self.pending
            .lock()
            .values()
            .filter(|h| h.to_agent == agent_id)
            .cloned()
            .collect()
    }

    pub fn history(&self, filter: Option<&HandoffFilter>) -> Vec<HandoffRecord> {
        let history = self.history.read();
        let mut records: Vec<HandoffRecord> = history
            .iter()
            .filter(|r| match filter.and_then(|f| f.agent.as_deref()) {
                Some(agent) => r.from_agent == agent || r.to_agent == agent,
                None => true,
            })
            .filter(|r| match filter.and_then(|f| f.task_id.as_deref()) {
                Some(task_id) => r.task_id == task_id,
                None => true,
            })
            .cloned()
            .collect();

        if let Some(limit) = filter.and_then(|f| f.limit)
            && records.len() > limit
        {
            records.drain(..records.len() - limit);
        }
        records
    }

    pub fn stats(&self) -> HandoffStats {
        let history = self.history.read();
        let mut by_agent: HashMap<String, AgentHandoffCounts> = HashMap::new();
        for record in history.iter() {
            by_agent.entry(record.from_agent.clone()).or_default().sent += 1;
            by_agent
                .entry(record.to_agent.clone())
                .or_default()
                .received += 1;
        }

        HandoffStats {
            total_handoffs: history.len(),
            pending: self.pending.lock().len(),
            by_agent,
        }
    }

    pub fn terminal_stats(&self) -> TerminalStats {
        let mut stats = TerminalStats::default();
        let mut count = |status: TerminalStatus| match status {
            TerminalStatus::Idle => stats.idle += 1,
            TerminalStatus::Running => stats.running += 1,
            TerminalStatus::Completed => stats.completed += 1,
            TerminalStatus::Failed => stats.failed += 1,
        };

        for entry in self.terminals.iter() {
            count(entry.instance.status);
        }
        for instance in self.terminal_archive.read().iter() {
            count(instance.status);
        }
        stats
    }

    /// Workers currently in the running state.
    pub fn active_terminal_handoffs(&self) -> Vec<TerminalInstance> {
        self.terminals
            .iter()
            .filter(|entry| entry.instance.status == TerminalStatus::Running)
            .map(|entry| entry.instance.clone())
            .collect()
    }

    /// Clear all in-memory state. For shutdown or between test runs.
    pub fn reset(&self) {
        self.pending.lock().clear();
        self.history.write().clear();
        self.terminals.clear();
        self.terminal_archive.write().clear();
    }

    /// Terminate any still-active workers, then clear tracking state.
    pub async fn close(&self) {
        let task_ids: Vec<String> = self.terminals.iter().map(|e| e.key().clone()).collect();
        for task_id in task_ids {
            if let Err(e) = self
                .terminate_terminal_handoff(&task_id, Some("shutdown"))
                .await
            {
                debug!(task_id = %task_id, error = %e, "Terminal already resolved during close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use super::*;
    use crate::bus::MessageFilter;
    use crate::handoff::registry::{AgentDescriptor, InMemoryAgentRegistry};
    use crate::spawn::{SpawnedWorker, TerminalLaunchSpec};

    /// Spawner double: workers never really run; tests trigger exits by
    /// task id.
    #[derive(Default)]
    struct MockSpawner {
        fail_task_ids: Vec<String>,
        exits: Mutex<HashMap<String, oneshot::Sender<WorkerExit>>>,
    }

    impl MockSpawner {
        fn failing_for(task_ids: &[&str]) -> Self {
            Self {
                fail_task_ids: task_ids.iter().map(|s| s.to_string()).collect(),
                exits: Mutex::new(HashMap::new()),
            }
        }

        fn finish(&self, task_id: &str, exit: WorkerExit) {
            let sender = self
                .exits
                .lock()
                .remove(task_id)
                .expect("no tracked worker for task");
            let _ = sender.send(exit);
        }
    }

    #[async_trait]
    impl WorkerSpawner for MockSpawner {
        async fn spawn(&self, spec: TerminalLaunchSpec) -> Result<SpawnedWorker> {
            let task_id = spec
                .env
                .get("CHARTERFLOW_TASK_ID")
                .cloned()
                .unwrap_or_default();
            if self.fail_task_ids.contains(&task_id) {
                return Err(FlowError::Spawn("workspace provisioning failed".into()));
            }

            let (tx, rx) = oneshot::channel();
            self.exits.lock().insert(task_id, tx);
            Ok(SpawnedWorker {
                id: spec.worker_id,
                pid: Some(4242),
                worktree_path: None,
                exit: rx,
            })
        }

        async fn terminate(&self, _worker_id: &str, _reason: Option<&str>) -> Result<()> {
            Ok(())
        }
    }

    fn registry_with(agents: &[&str]) -> Arc<InMemoryAgentRegistry> {
        let registry = InMemoryAgentRegistry::new();
        for agent in agents {
            registry
                .register(AgentDescriptor::new(*agent, *agent))
                .unwrap();
        }
        Arc::new(registry)
    }

    fn manager_with(spawner: Arc<MockSpawner>) -> HandoffManager {
        let registry = registry_with(&["orchestrator", "flight-search", "client-data"]);
        HandoffManager::new(MessageBus::new(), registry, spawner)
    }

    fn sample_handoff(task_id: &str, to_agent: &str) -> AgentHandoff {
        let task = AgentTask::new("flight_search", "orchestrator", to_agent).with_id(task_id);
        AgentHandoff::new(
            "orchestrator",
            to_agent,
            task,
            AgentContext::new("req-1", "sess-1"),
            "needs flight options",
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_handoff_to_unknown_agent_fails() {
        let manager = manager_with(Arc::new(MockSpawner::default()));

        let err = manager
            .handoff(sample_handoff("t-1", "no-such-agent"))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::UnknownAgent(_)));
        assert!(manager.pending_handoffs("no-such-agent").is_empty());
    }

    #[tokio::test]
    async fn test_handoff_accept_lifecycle() {
        let manager = manager_with(Arc::new(MockSpawner::default()));

        manager
            .handoff(sample_handoff("t-1", "flight-search"))
            .await
            .unwrap();

        let pending = manager.pending_handoffs("flight-search");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task.status, TaskStatus::Pending);

        let task = manager.accept_handoff("t-1", "flight-search").await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(manager.pending_handoffs("flight-search").is_empty());

        let stats = manager.stats();
        assert_eq!(stats.total_handoffs, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.by_agent.get("orchestrator").unwrap().sent, 1);
        assert_eq!(stats.by_agent.get("flight-search").unwrap().received, 1);

        let published = manager
            .bus
            .get_history(&MessageFilter::new().with_type(MessageType::AgentHandoff));
        assert_eq!(published.len(), 1);

        // Pending entry is gone: a second accept fails.
        let err = manager
            .accept_handoff("t-1", "flight-search")
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::NoPendingHandoff(_)));
    }

    #[tokio::test]
    async fn test_accept_by_wrong_recipient_fails() {
        let manager = manager_with(Arc::new(MockSpawner::default()));
        manager
            .handoff(sample_handoff("t-1", "flight-search"))
            .await
            .unwrap();

        let err = manager
            .accept_handoff("t-1", "client-data")
            .await
            .unwrap_err();
        match err {
            FlowError::WrongRecipient {
                expected, actual, ..
            } => {
                assert_eq!(expected, "flight-search");
                assert_eq!(actual, "client-data");
            }
            other => panic!("expected WrongRecipient, got {:?}", other),
        }

        // Guard failure leaves the pending entry intact.
        assert_eq!(manager.pending_handoffs("flight-search").len(), 1);
    }

    #[tokio::test]
    async fn test_reject_fails_task_and_notifies_sender() {
        let manager = manager_with(Arc::new(MockSpawner::default()));
        manager
            .handoff(sample_handoff("t-1", "flight-search"))
            .await
            .unwrap();

        let task = manager
            .reject_handoff("t-1", "flight-search", "no availability on route")
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("no availability on route"));

        let failures = manager
            .bus
            .get_history(&MessageFilter::new().with_type(MessageType::TaskFailed));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].target_agent.as_deref(), Some("orchestrator"));

        let err = manager
            .reject_handoff("t-1", "flight-search", "again")
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::NoPendingHandoff(_)));
    }

    /// Pins the chosen overwrite semantics for re-handoff of a task id.
    #[tokio::test]
    async fn test_second_handoff_overwrites_pending() {
        let manager = manager_with(Arc::new(MockSpawner::default()));

        manager
            .handoff(sample_handoff("t-1", "flight-search"))
            .await
            .unwrap();
        manager
            .handoff(sample_handoff("t-1", "client-data"))
            .await
            .unwrap();

        assert!(manager.pending_handoffs("flight-search").is_empty());
        let pending = manager.pending_handoffs("client-data");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task.id, "t-1");

        // Both proposals stay in the audit history.
        assert_eq!(manager.history(None).len(), 2);

        let err = manager
            .accept_handoff("t-1", "flight-search")
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::WrongRecipient { .. }));
        assert!(manager.accept_handoff("t-1", "client-data").await.is_ok());
    }

    #[tokio::test]
    async fn test_terminal_handoff_completion() {
        let spawner = Arc::new(MockSpawner::default());
        let manager = manager_with(Arc::clone(&spawner));

        let task = AgentTask::new("flight_search", "orchestrator", "terminal").with_id("t-term");
        let instance = manager
            .handoff_to_terminal(
                task,
                TerminalOverrides::new().with_agent_kind("searcher"),
                AgentContext::new("req-1", "sess-1"),
            )
            .await
            .unwrap();

        assert_eq!(instance.status, TerminalStatus::Running);
        assert_eq!(instance.pid, Some(4242));
        assert_eq!(manager.active_terminal_handoffs().len(), 1);
        assert_eq!(manager.terminal_stats().running, 1);

        let spawned = manager
            .bus
            .get_history(&MessageFilter::new().with_type(MessageType::TerminalSpawned));
        assert_eq!(spawned.len(), 1);

        spawner.finish(
            "t-term",
            WorkerExit {
                exit_code: Some(0),
                output: "3 options found".to_string(),
                errors: String::new(),
            },
        );

        wait_until(|| manager.active_terminal_handoffs().is_empty()).await;

        let stats = manager.terminal_stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.completed, 1);

        let completed = manager
            .bus
            .get_history(&MessageFilter::new().with_type(MessageType::TerminalCompleted));
        assert_eq!(completed.len(), 1);
        match &completed[0].payload {
            MessagePayload::TerminalLifecycle {
                exit_code, output, ..
            } => {
                assert_eq!(*exit_code, Some(0));
                assert_eq!(output.as_deref(), Some("3 options found"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_handoff_nonzero_exit_fails_task() {
        let spawner = Arc::new(MockSpawner::default());
        let manager = manager_with(Arc::clone(&spawner));

        let task = AgentTask::new("scoring", "orchestrator", "terminal").with_id("t-bad");
        manager
            .handoff_to_terminal(
                task,
                TerminalOverrides::default(),
                AgentContext::new("req-1", "sess-1"),
            )
            .await
            .unwrap();

        spawner.finish(
            "t-bad",
            WorkerExit {
                exit_code: Some(2),
                output: String::new(),
                errors: "scorer crashed".to_string(),
            },
        );

        wait_until(|| manager.terminal_stats().failed == 1).await;

        let failed = manager
            .bus
            .get_history(&MessageFilter::new().with_type(MessageType::TerminalFailed));
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_task_failed_and_propagates() {
        let spawner = Arc::new(MockSpawner::failing_for(&["t-doomed"]));
        let manager = manager_with(spawner);

        let task = AgentTask::new("scoring", "orchestrator", "terminal").with_id("t-doomed");
        let err = manager
            .handoff_to_terminal(
                task,
                TerminalOverrides::default(),
                AgentContext::new("req-1", "sess-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Spawn(_)));

        assert!(manager.active_terminal_handoffs().is_empty());
        let failures = manager
            .bus
            .get_history(&MessageFilter::new().with_type(MessageType::TaskFailed));
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_handoff_skips_failures() {
        let spawner = Arc::new(MockSpawner::failing_for(&["t-2"]));
        let manager = manager_with(Arc::clone(&spawner));

        let tasks = vec![
            AgentTask::new("a", "orchestrator", "terminal").with_id("t-1"),
            AgentTask::new("b", "orchestrator", "terminal").with_id("t-2"),
            AgentTask::new("c", "orchestrator", "terminal").with_id("t-3"),
        ];

        let spawned = manager
            .batch_handoff_to_terminals(tasks, &AgentContext::new("req-1", "sess-1"))
            .await;

        assert_eq!(spawned.len(), 2);
        assert!(spawned.contains_key("t-1"));
        assert!(!spawned.contains_key("t-2"));
        assert!(spawned.contains_key("t-3"));
        assert_eq!(manager.active_terminal_handoffs().len(), 2);
    }

    #[tokio::test]
    async fn test_terminate_terminal_handoff() {
        let spawner = Arc::new(MockSpawner::default());
        let manager = manager_with(Arc::clone(&spawner));

        let err = manager
            .terminate_terminal_handoff("t-none", None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::NoTerminalForTask(_)));

        let task = AgentTask::new("search", "orchestrator", "terminal").with_id("t-kill");
        manager
            .handoff_to_terminal(
                task,
                TerminalOverrides::default(),
                AgentContext::new("req-1", "sess-1"),
            )
            .await
            .unwrap();

        manager
            .terminate_terminal_handoff("t-kill", Some("taking too long"))
            .await
            .unwrap();

        assert!(manager.active_terminal_handoffs().is_empty());
        assert_eq!(manager.terminal_stats().failed, 1);

        let terminated = manager
            .bus
            .get_history(&MessageFilter::new().with_type(MessageType::TerminalTerminated));
        assert_eq!(terminated.len(), 1);
    }

    #[tokio::test]
    async fn test_history_filters() {
        let manager = manager_with(Arc::new(MockSpawner::default()));

        manager
            .handoff(sample_handoff("t-1", "flight-search"))
            .await
            .unwrap();
        manager
            .handoff(sample_handoff("t-2", "client-data"))
            .await
            .unwrap();

        let all = manager.history(None);
        assert_eq!(all.len(), 2);

        let filter = HandoffFilter {
            agent: Some("client-data".to_string()),
            ..HandoffFilter::default()
        };
        let for_agent = manager.history(Some(&filter));
        assert_eq!(for_agent.len(), 1);
        assert_eq!(for_agent[0].task_id, "t-2");

        let filter = HandoffFilter {
            task_id: Some("t-1".to_string()),
            ..HandoffFilter::default()
        };
        assert_eq!(manager.history(Some(&filter)).len(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let manager = manager_with(Arc::new(MockSpawner::default()));
        manager
            .handoff(sample_handoff("t-1", "flight-search"))
            .await
            .unwrap();

        manager.reset();
        assert!(manager.pending_handoffs("flight-search").is_empty());
        assert!(manager.history(None).is_empty());
        assert_eq!(manager.stats().total_handoffs, 0);
    }
}
