use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::state::WorkflowState;
use crate::error::{FlowError, Result};

/// One entry in a workflow's append-only transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// State machine for a single charter request workflow.
///
/// Invariant: `current_state` always equals the `to` of the last history
/// entry. The first entry is a synthetic self-transition recording
/// initialization. Instances are single-writer; wrap in a lock when shared.
#[derive(Debug, Clone)]
pub struct WorkflowStateMachine {
    workflow_id: String,
    current_state: WorkflowState,
    history: Vec<TransitionRecord>,
}

impl WorkflowStateMachine {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        let initial = WorkflowState::Created;
        Self {
            workflow_id: workflow_id.into(),
            current_state: initial,
            history: vec![TransitionRecord {
                from: initial,
                to: initial,
                timestamp: Utc::now(),
                triggered_by: None,
                metadata: None,
            }],
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn current_state(&self) -> WorkflowState {
        self.current_state
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn can_transition(&self, to: WorkflowState) -> bool {
        self.current_state.can_transition_to(to)
    }

    /// Apply a transition. Fails without mutating anything when the edge is
    /// not in the adjacency table; the error reports the legal alternatives.
    pub fn transition(
        &mut self,
        to: WorkflowState,
        triggered_by: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        if !self.current_state.can_transition_to(to) {
            return Err(FlowError::InvalidTransition {
                from: self.current_state.to_string(),
                to: to.to_string(),
                allowed: self
                    .current_state
                    .allowed_transitions()
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        self.history.push(TransitionRecord {
            from: self.current_state,
            to,
            timestamp: Utc::now(),
            triggered_by,
            metadata,
        });
        self.current_state = to;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    pub fn is_in_progress(&self) -> bool {
        !self.is_terminal() && self.current_state != WorkflowState::Created
    }

    /// First-to-last history timestamp delta.
    pub fn duration(&self) -> Duration {
        match (self.history.first(), self.history.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => Duration::zero(),
        }
    }

    /// Per-state dwell time, from pairwise-adjacent history deltas. Each
    /// delta is attributed to the state entered by the later record.
    pub fn state_timings(&self) -> HashMap<WorkflowState, Duration> {
        let mut timings: HashMap<WorkflowState, Duration> = HashMap::new();
        for pair in self.history.windows(2) {
            let delta = pair[1].timestamp - pair[0].timestamp;
            let slot = timings.entry(pair[1].to).or_insert_with(Duration::zero);
            *slot = *slot + delta;
        }
        timings
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: self.workflow_id.clone(),
            current_state: self.current_state,
            is_terminal: self.is_terminal(),
            duration_ms: self.duration().num_milliseconds(),
            history: self.history.clone(),
        }
    }

    /// Reconstruct from a snapshot. `is_terminal` and `duration_ms` are
    /// recomputed from the history, never trusted from the wire.
    pub fn from_snapshot(snapshot: WorkflowSnapshot) -> Result<Self> {
        let Some(last) = snapshot.history.last() else {
            return Err(FlowError::Other(format!(
                "workflow snapshot {} has empty history",
                snapshot.workflow_id
            )));
        };
        if last.to != snapshot.current_state {
            return Err(FlowError::Other(format!(
                "workflow snapshot {} is inconsistent: current_state {} does not match last history entry {}",
                snapshot.workflow_id, snapshot.current_state, last.to
            )));
        }

        Ok(Self {
            workflow_id: snapshot.workflow_id,
            current_state: snapshot.current_state,
            history: snapshot.history,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_snapshot(serde_json::from_str(json)?)
    }
}

/// Wire format for a workflow machine. `is_terminal` and `duration_ms` are
/// convenience fields for consumers; reconstruction recomputes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    pub current_state: WorkflowState,
    pub is_terminal: bool,
    pub duration_ms: i64,
    pub history: Vec<TransitionRecord>,
}
