use std::collections::BTreeMap;

use async_trait::async_trait;
use ragline_core::{ConversationState, Value};
use serde::{Deserialize, Serialize};

use crate::NodeError;

/// Default id of the supervising node.
pub const SUPERVISOR: &str = "supervisor";

/// Well-known scratch keys shared between nodes and the session layer.
pub mod scratch_keys {
    pub const LAST_ERROR: &str = "last_error";
    pub const RETRIEVED_CHUNKS: &str = "retrieved_chunks";
    pub const RETRIEVAL_DEGRADED: &str = "retrieval_degraded";
    pub const UPLOADED_FILES: &str = "uploaded_files";
    pub const TOOL_ERROR: &str = "tool_error";
}

/// What a node asks the executor to do next.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeOutput {
    /// Final text for the user; the run completes.
    Respond { text: String },
    /// External tool call; the run suspends until the result arrives.
    Invoke { tool: String, args: Value },
    /// Hand control to another node.
    Route { target: String },
    /// Stop without an answer, e.g. waiting for more user input.
    Suspend { reason: String },
}

impl NodeOutput {
    pub fn respond(text: impl Into<String>) -> Self {
        NodeOutput::Respond { text: text.into() }
    }

    pub fn invoke(tool: impl Into<String>, args: Value) -> Self {
        NodeOutput::Invoke {
            tool: tool.into(),
            args,
        }
    }

    pub fn route(target: impl Into<String>) -> Self {
        NodeOutput::Route {
            target: target.into(),
        }
    }

    pub fn suspend(reason: impl Into<String>) -> Self {
        NodeOutput::Suspend {
            reason: reason.into(),
        }
    }
}

/// A node's output plus the scratch entries it wants written.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeUpdate {
    pub output: NodeOutput,
    pub scratch: BTreeMap<String, Value>,
}

impl NodeUpdate {
    pub fn new(output: NodeOutput) -> Self {
        Self {
            output,
            scratch: BTreeMap::new(),
        }
    }

    pub fn with_scratch(mut self, key: impl Into<String>, value: Value) -> Self {
        self.scratch.insert(key.into(), value);
        self
    }
}

impl From<NodeOutput> for NodeUpdate {
    fn from(output: NodeOutput) -> Self {
        NodeUpdate::new(output)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeContext {
    pub run_id: String,
    pub conversation_id: String,
    pub node_id: String,
    /// Step this invocation will commit as.
    pub step: u64,
    /// 1-based attempt number within the node retry budget.
    pub attempt: u32,
}

/// A unit of work in the agent graph. Nodes never mutate state directly; the
/// executor applies the returned update.
#[async_trait]
pub trait AgentNode: Send + Sync {
    async fn execute(
        &self,
        state: &ConversationState,
        ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError>;

    /// Node ids this node may route to, checked when the graph is built.
    fn routes(&self) -> Vec<String> {
        Vec::new()
    }
}
