use ragline_core::{ConversationState, Message, RunStatus, SuspendReason, ToolCall};
use serde_json::json;

use crate::node::scratch_keys::LAST_ERROR;
use crate::{NodeError, NodeOutput, NodeUpdate};

/// Result of applying one node output to the pre-step state.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub state: ConversationState,
    pub next_node: String,
    pub status: RunStatus,
    pub reply: Option<String>,
}

/// Inputs shared by every transition of one step.
#[derive(Clone, Copy, Debug)]
pub struct StepFrame<'a> {
    pub run_id: &'a str,
    pub step: u64,
    pub supervisor_id: &'a str,
    /// Cancellation was requested while the step was in flight.
    pub cancelled: bool,
}

impl StepFrame<'_> {
    /// Deterministic tool call id, so replaying a step yields the same checkpoint.
    pub fn call_id(&self) -> String {
        format!("{}:{}", self.run_id, self.step)
    }

    fn continuing(&self) -> RunStatus {
        if self.cancelled {
            RunStatus::Suspended {
                reason: SuspendReason::Cancelled,
            }
        } else {
            RunStatus::Running
        }
    }
}

/// Pure state transition for a successful node invocation.
pub fn apply_update(
    state: &ConversationState,
    frame: StepFrame<'_>,
    update: NodeUpdate,
) -> Transition {
    let mut next = state.clone();
    next.step = frame.step;
    next.remove_scratch(LAST_ERROR);
    for (key, value) in update.scratch {
        next.set_scratch(key, value);
    }

    let supervisor = frame.supervisor_id.to_string();
    match update.output {
        NodeOutput::Respond { text } => {
            next.push_message(Message::assistant(text.clone()));
            Transition {
                state: next,
                next_node: supervisor,
                status: RunStatus::Completed,
                reply: Some(text),
            }
        }
        NodeOutput::Invoke { tool, args } => {
            let call_id = frame.call_id();
            next.push_message(Message::tool_call(ToolCall {
                id: call_id.clone(),
                name: tool.clone(),
                args,
            }));
            Transition {
                state: next,
                next_node: supervisor,
                status: RunStatus::Suspended {
                    reason: SuspendReason::AwaitingTool { call_id, tool },
                },
                reply: None,
            }
        }
        NodeOutput::Route { target } => Transition {
            state: next,
            next_node: target,
            status: frame.continuing(),
            reply: None,
        },
        NodeOutput::Suspend { reason } => Transition {
            state: next,
            next_node: supervisor,
            status: RunStatus::Suspended {
                reason: SuspendReason::Requested { reason },
            },
            reply: None,
        },
    }
}

/// Records a recoverable node failure in state and hands control back to the supervisor.
pub fn absorb_failure(
    state: &ConversationState,
    frame: StepFrame<'_>,
    node_id: &str,
    error: &NodeError,
) -> Transition {
    let mut next = state.clone();
    next.step = frame.step;
    next.push_message(Message::system(format!("node '{node_id}' failed: {error}")));
    next.set_scratch(
        LAST_ERROR,
        json!({ "node": node_id, "error": error.to_string(), "step": frame.step }),
    );
    Transition {
        state: next,
        next_node: frame.supervisor_id.to_string(),
        status: frame.continuing(),
        reply: None,
    }
}
