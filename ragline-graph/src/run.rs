use ragline_core::{Checkpoint, ConversationState, RunStatus};
use serde::{Deserialize, Serialize};

/// Identity of a run and the last step it committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub conversation_id: String,
    pub run_id: String,
    pub last_step: u64,
}

impl RunHandle {
    pub fn new(conversation_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            run_id: run_id.into(),
            last_step: 0,
        }
    }

    /// A new run with a random id and nothing committed yet.
    pub fn fresh(conversation_id: impl Into<String>) -> Self {
        Self::new(conversation_id, uuid::Uuid::new_v4().to_string())
    }
}

/// In-memory view of a run between two committed steps.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveRun {
    pub handle: RunHandle,
    pub state: ConversationState,
    pub next_node: String,
}

impl ActiveRun {
    pub fn fresh(handle: RunHandle, supervisor_id: impl Into<String>) -> Self {
        Self {
            handle,
            state: ConversationState::new(),
            next_node: supervisor_id.into(),
        }
    }

    pub fn from_checkpoint(checkpoint: Checkpoint) -> (Self, RunStatus) {
        let handle = RunHandle {
            conversation_id: checkpoint.conversation_id,
            run_id: checkpoint.run_id,
            last_step: checkpoint.step,
        };
        let run = Self {
            handle,
            state: checkpoint.state,
            next_node: checkpoint.next_node,
        };
        (run, checkpoint.status)
    }
}

/// Where an activation stopped without failing.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOutcome {
    pub handle: RunHandle,
    pub status: RunStatus,
    pub reply: Option<String>,
    pub state: ConversationState,
    pub next_node: String,
}

impl RunOutcome {
    pub fn into_active(self) -> ActiveRun {
        ActiveRun {
            handle: self.handle,
            state: self.state,
            next_node: self.next_node,
        }
    }
}
