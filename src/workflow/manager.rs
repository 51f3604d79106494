use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use super::machine::WorkflowStateMachine;
use super::state::WorkflowState;
use crate::error::{FlowError, Result};

/// Shared handle to one workflow machine. The mutex keeps each instance
/// single-writer; callers hold it across a read-check-transition sequence.
pub type SharedWorkflow = Arc<Mutex<WorkflowStateMachine>>;

/// Owns the keyed collection of workflow state machines for one
/// orchestrator process. Construct at startup; `reset()` between test runs.
#[derive(Default)]
pub struct WorkflowManager {
    workflows: RwLock<HashMap<String, SharedWorkflow>>,
}

impl WorkflowManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_workflow(&self, workflow_id: impl Into<String>) -> Result<SharedWorkflow> {
        let workflow_id = workflow_id.into();
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow_id) {
            return Err(FlowError::WorkflowAlreadyExists(workflow_id));
        }

        let machine = Arc::new(Mutex::new(WorkflowStateMachine::new(&workflow_id)));
        workflows.insert(workflow_id.clone(), Arc::clone(&machine));
        debug!(workflow_id = %workflow_id, "Workflow created");
        Ok(machine)
    }

    /// Insert an already-built machine, e.g. one rehydrated from a snapshot.
    pub fn restore(&self, machine: WorkflowStateMachine) -> Result<SharedWorkflow> {
        let workflow_id = machine.workflow_id().to_string();
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow_id) {
            return Err(FlowError::WorkflowAlreadyExists(workflow_id));
        }

        let machine = Arc::new(Mutex::new(machine));
        workflows.insert(workflow_id, Arc::clone(&machine));
        Ok(machine)
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<SharedWorkflow> {
        self.workflows.read().get(workflow_id).cloned()
    }

    pub fn delete_workflow(&self, workflow_id: &str) -> bool {
        self.workflows.write().remove(workflow_id).is_some()
    }

    pub fn workflows_by_state(&self, state: WorkflowState) -> Vec<SharedWorkflow> {
        self.workflows
            .read()
            .values()
            .filter(|m| m.lock().current_state() == state)
            .cloned()
            .collect()
    }

    /// Remove terminal workflows whose self-reported duration (first-to-last
    /// history delta) exceeds the threshold. Note this is not wall-clock age
    /// since completion; see DESIGN.md for why the distinction is kept.
    pub fn cleanup_completed(&self, older_than: Duration) -> usize {
        let mut workflows = self.workflows.write();
        let before = workflows.len();
        workflows.retain(|_, m| {
            let machine = m.lock();
            !(machine.is_terminal() && machine.duration() > older_than)
        });
        let removed = before - workflows.len();
        if removed > 0 {
            debug!(removed, "Cleaned up terminal workflows");
        }
        removed
    }

    pub fn stats(&self) -> WorkflowStats {
        let workflows = self.workflows.read();
        let mut by_state: HashMap<String, usize> = HashMap::new();
        let mut in_progress = 0;
        let mut completed = 0;

        for machine in workflows.values() {
            let machine = machine.lock();
            *by_state
                .entry(machine.current_state().to_string())
                .or_default() += 1;
            if machine.is_in_progress() {
                in_progress += 1;
            }
            if machine.current_state() == WorkflowState::Completed {
                completed += 1;
            }
        }

        WorkflowStats {
            total: workflows.len(),
            by_state,
            in_progress,
            completed,
        }
    }

    pub fn reset(&self) {
        self.workflows.write().clear();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStats {
    pub total: usize,
    pub by_state: HashMap<String, usize>,
    pub in_progress: usize,
    pub completed: usize,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::workflow::machine::WorkflowSnapshot;
    use crate::workflow::TransitionRecord;

    #[test]
    fn test_create_and_get() {
        let manager = WorkflowManager::new();
        manager.create_workflow("wf-1").unwrap();

        assert!(manager.get_workflow("wf-1").is_some());
        assert!(manager.get_workflow("wf-2").is_none());
    }

    #[test]
    fn test_duplicate_create_fails() {
        let manager = WorkflowManager::new();
        manager.create_workflow("wf-1").unwrap();

        let err = manager.create_workflow("wf-1").unwrap_err();
        assert!(matches!(err, FlowError::WorkflowAlreadyExists(_)));
    }

    #[test]
    fn test_delete() {
        let manager = WorkflowManager::new();
        manager.create_workflow("wf-1").unwrap();

        assert!(manager.delete_workflow("wf-1"));
        assert!(!manager.delete_workflow("wf-1"));
    }

    #[test]
    fn test_workflows_by_state() {
        let manager = WorkflowManager::new();
        let wf = manager.create_workflow("wf-1").unwrap();
        manager.create_workflow("wf-2").unwrap();

        wf.lock()
            .transition(WorkflowState::Analyzing, None, None)
            .unwrap();

        assert_eq!(manager.workflows_by_state(WorkflowState::Analyzing).len(), 1);
        assert_eq!(manager.workflows_by_state(WorkflowState::Created).len(), 1);
        assert_eq!(manager.workflows_by_state(WorkflowState::Failed).len(), 0);
    }

    /// Backdated terminal snapshot with a long first-to-last span.
    fn terminal_machine_with_duration(id: &str, span: Duration) -> WorkflowStateMachine {
        let start = Utc::now() - span;
        let snapshot = WorkflowSnapshot {
            workflow_id: id.to_string(),
            current_state: WorkflowState::Failed,
            is_terminal: true,
            duration_ms: span.num_milliseconds(),
            history: vec![
                TransitionRecord {
                    from: WorkflowState::Created,
                    to: WorkflowState::Created,
                    timestamp: start,
                    triggered_by: None,
                    metadata: None,
                },
                TransitionRecord {
                    from: WorkflowState::Created,
                    to: WorkflowState::Failed,
                    timestamp: start + span,
                    triggered_by: None,
                    metadata: None,
                },
            ],
        };
        WorkflowStateMachine::from_snapshot(snapshot).unwrap()
    }

    /// Pins the inherited semantics: cleanup compares self-reported duration,
    /// not wall-clock age since completion. A workflow that ran for ten
    /// seconds and finished moments ago is already collected by a one-second
    /// threshold; a fast workflow is retained no matter how old.
    #[test]
    fn test_cleanup_uses_duration_not_completion_age() {
        let manager = WorkflowManager::new();
        manager
            .restore(terminal_machine_with_duration(
                "wf-slow",
                Duration::seconds(10),
            ))
            .unwrap();
        manager
            .restore(terminal_machine_with_duration(
                "wf-fast",
                Duration::milliseconds(5),
            ))
            .unwrap();

        let removed = manager.cleanup_completed(Duration::seconds(1));

        assert_eq!(removed, 1);
        assert!(manager.get_workflow("wf-slow").is_none());
        assert!(manager.get_workflow("wf-fast").is_some());
    }

    #[test]
    fn test_cleanup_skips_non_terminal() {
        let manager = WorkflowManager::new();
        let wf = manager.create_workflow("wf-1").unwrap();
        wf.lock()
            .transition(WorkflowState::Analyzing, None, None)
            .unwrap();

        assert_eq!(manager.cleanup_completed(Duration::zero()), 0);
        assert!(manager.get_workflow("wf-1").is_some());
    }

    #[test]
    fn test_stats_single_pass() {
        let manager = WorkflowManager::new();
        manager.create_workflow("wf-1").unwrap();
        let wf2 = manager.create_workflow("wf-2").unwrap();
        let wf3 = manager.create_workflow("wf-3").unwrap();

        wf2.lock()
            .transition(WorkflowState::Analyzing, None, None)
            .unwrap();
        {
            let mut m = wf3.lock();
            m.transition(WorkflowState::Analyzing, None, None).unwrap();
            m.transition(WorkflowState::Cancelled, None, None).unwrap();
        }

        let stats = manager.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.by_state.get("created"), Some(&1));
        assert_eq!(stats.by_state.get("analyzing"), Some(&1));
        assert_eq!(stats.by_state.get("cancelled"), Some(&1));
    }
}
