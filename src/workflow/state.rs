use std::fmt;

use serde::{Deserialize, Serialize};

/// States of one charter request workflow. The transition graph is defined
/// once, here, for every instance; terminal states return empty slices so
/// the absence of outgoing edges is structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    #[default]
    Created,
    Analyzing,
    FetchingClientData,
    SearchingFlights,
    ScoringResults,
    ComposingEmail,
    AwaitingApproval,
    Sending,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn allowed_transitions(&self) -> &'static [WorkflowState] {
        use WorkflowState::*;
        match self {
            Created => &[Analyzing, Failed, Cancelled],
            Analyzing => &[FetchingClientData, Failed, Cancelled],
            FetchingClientData => &[SearchingFlights, Failed, Cancelled],
            SearchingFlights => &[ScoringResults, Failed, Cancelled],
            ScoringResults => &[ComposingEmail, Failed, Cancelled],
            ComposingEmail => &[AwaitingApproval, Failed, Cancelled],
            // Approval can send the email back for another revision pass.
            AwaitingApproval => &[Sending, ComposingEmail, Failed, Cancelled],
            Sending => &[Completed, Failed, Cancelled],
            Completed => &[],
            Failed => &[],
            Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: WorkflowState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Analyzing => "analyzing",
            Self::FetchingClientData => "fetching_client_data",
            Self::SearchingFlights => "searching_flights",
            Self::ScoringResults => "scoring_results",
            Self::ComposingEmail => "composing_email",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Sending => "sending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}
