use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{ConversationState, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuspendReason {
    AwaitingTool { call_id: String, tool: String },
    Requested { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Suspended { reason: SuspendReason },
    Completed,
    Failed { reason: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed { .. })
    }

    pub fn awaiting_tool(&self) -> Option<(&str, &str)> {
        match self {
            RunStatus::Suspended {
                reason: SuspendReason::AwaitingTool { call_id, tool },
            } => Some((call_id, tool)),
            _ => None,
        }
    }
}

/// Immutable snapshot of a run after a committed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub run_id: String,
    pub conversation_id: String,
    pub step: u64,
    pub state: ConversationState,
    pub next_node: String,
    pub status: RunStatus,
    pub created_at: String,
}

impl Checkpoint {
    pub fn new(
        run_id: impl Into<String>,
        conversation_id: impl Into<String>,
        state: ConversationState,
        next_node: impl Into<String>,
        status: RunStatus,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            conversation_id: conversation_id.into(),
            step: state.step,
            state,
            next_node: next_node.into(),
            status,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn state_blob(&self) -> Result<String, StoreError> {
        Ok(self.state.to_blob()?)
    }

    pub fn status_blob(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(&self.status)?)
    }

    /// Payload equality used for idempotent re-writes; `created_at` is ignored.
    pub fn same_payload(&self, other: &Checkpoint) -> Result<bool, StoreError> {
        Ok(self.conversation_id == other.conversation_id
            && self.next_node == other.next_node
            && self.state_blob()? == other.state_blob()?
            && self.status_blob()? == other.status_blob()?)
    }

    pub fn metadata(&self) -> CheckpointMetadata {
        CheckpointMetadata {
            step: self.step,
            created_at: self.created_at.clone(),
            next_node: self.next_node.clone(),
            status: self.status.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMetadata {
    pub step: u64,
    pub created_at: String,
    pub next_node: String,
    pub status: RunStatus,
}

/// Durable record that a run stopped on an error. A marked run does not advance
/// until the mark is cleared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureMark {
    pub run_id: String,
    /// Last committed step when the run failed.
    pub step: u64,
    pub reason: String,
    pub created_at: String,
}

impl FailureMark {
    pub fn new(run_id: impl Into<String>, step: u64, reason: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            step,
            reason: reason.into(),
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    Insert,
    AlreadyCommitted,
}

impl WriteDecision {
    /// Shared write rules for every backend: steps are gapless and start at 1, and a
    /// re-write of a committed step is accepted only when its payload is identical.
    pub fn check(
        incoming: &Checkpoint,
        existing: Option<&Checkpoint>,
        latest_step: Option<u64>,
    ) -> Result<Self, StoreError> {
        if incoming.step != incoming.state.step {
            return Err(StoreError::Backend(format!(
                "checkpoint step {} disagrees with state step {}",
                incoming.step, incoming.state.step
            )));
        }
        if let Some(existing) = existing {
            return if existing.same_payload(incoming)? {
                Ok(WriteDecision::AlreadyCommitted)
            } else {
                Err(StoreError::Conflict {
                    run_id: incoming.run_id.clone(),
                    step: incoming.step,
                })
            };
        }
        let expected = latest_step.map_or(1, |latest| latest + 1);
        if incoming.step != expected {
            return Err(StoreError::OutOfOrder {
                run_id: incoming.run_id.clone(),
                expected,
                got: incoming.step,
            });
        }
        Ok(WriteDecision::Insert)
    }
}

/// Durable key-value persistence of run state keyed by `(run_id, step)`.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
    async fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, StoreError>;
    async fn load_at(&self, run_id: &str, step: u64) -> Result<Option<Checkpoint>, StoreError>;
    async fn latest_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Checkpoint>, StoreError>;
    async fn history(&self, run_id: &str) -> Result<Vec<CheckpointMetadata>, StoreError>;
    /// Records (or replaces) the failure mark of a run.
    async fn mark_failed(&self, mark: &FailureMark) -> Result<(), StoreError>;
    async fn failure(&self, run_id: &str) -> Result<Option<FailureMark>, StoreError>;
    /// Removes the failure mark; clearing an unmarked run is a no-op.
    async fn clear_failure(&self, run_id: &str) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        (**self).save(checkpoint).await
    }

    async fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        (**self).load_latest(run_id).await
    }

    async fn load_at(&self, run_id: &str, step: u64) -> Result<Option<Checkpoint>, StoreError> {
        (**self).load_at(run_id, step).await
    }

    async fn latest_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        (**self).latest_for_conversation(conversation_id).await
    }

    async fn history(&self, run_id: &str) -> Result<Vec<CheckpointMetadata>, StoreError> {
        (**self).history(run_id).await
    }

    async fn mark_failed(&self, mark: &FailureMark) -> Result<(), StoreError> {
        (**self).mark_failed(mark).await
    }

    async fn failure(&self, run_id: &str) -> Result<Option<FailureMark>, StoreError> {
        (**self).failure(run_id).await
    }

    async fn clear_failure(&self, run_id: &str) -> Result<(), StoreError> {
        (**self).clear_failure(run_id).await
    }
}

#[derive(Default)]
struct MemoryInner {
    runs: HashMap<String, BTreeMap<u64, Checkpoint>>,
    conversations: HashMap<String, String>,
    failures: HashMap<String, FailureMark>,
}

#[derive(Default, Clone)]
pub struct InMemoryCheckpointStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("lock".into())
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| poisoned())?;
        let history = guard.runs.entry(checkpoint.run_id.clone()).or_default();
        let latest = history.keys().next_back().copied();
        match WriteDecision::check(checkpoint, history.get(&checkpoint.step), latest)? {
            WriteDecision::AlreadyCommitted => return Ok(()),
            WriteDecision::Insert => {
                history.insert(checkpoint.step, checkpoint.clone());
            }
        }
        if checkpoint.step == 1 {
            guard.conversations.insert(
                checkpoint.conversation_id.clone(),
                checkpoint.run_id.clone(),
            );
        }
        Ok(())
    }

    async fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let guard = self.inner.read().map_err(|_| poisoned())?;
        Ok(guard
            .runs
            .get(run_id)
            .and_then(|history| history.values().next_back().cloned()))
    }

    async fn load_at(&self, run_id: &str, step: u64) -> Result<Option<Checkpoint>, StoreError> {
        let guard = self.inner.read().map_err(|_| poisoned())?;
        Ok(guard
            .runs
            .get(run_id)
            .and_then(|history| history.get(&step).cloned()))
    }

    async fn latest_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let run_id = {
            let guard = self.inner.read().map_err(|_| poisoned())?;
            guard.conversations.get(conversation_id).cloned()
        };
        match run_id {
            Some(run_id) => self.load_latest(&run_id).await,
            None => Ok(None),
        }
    }

    async fn history(&self, run_id: &str) -> Result<Vec<CheckpointMetadata>, StoreError> {
        let guard = self.inner.read().map_err(|_| poisoned())?;
        Ok(guard
            .runs
            .get(run_id)
            .map(|history| history.values().map(Checkpoint::metadata).collect())
            .unwrap_or_default())
    }

    async fn mark_failed(&self, mark: &FailureMark) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| poisoned())?;
        guard.failures.insert(mark.run_id.clone(), mark.clone());
        Ok(())
    }

    async fn failure(&self, run_id: &str) -> Result<Option<FailureMark>, StoreError> {
        let guard = self.inner.read().map_err(|_| poisoned())?;
        Ok(guard.failures.get(run_id).cloned())
    }

    async fn clear_failure(&self, run_id: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| poisoned())?;
        guard.failures.remove(run_id);
        Ok(())
    }
}
