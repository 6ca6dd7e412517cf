use std::sync::Arc;

use async_trait::async_trait;
use ragline_core::{ConversationState, Value};
use serde_json::json;

use crate::{AgentNode, NodeContext, NodeError, NodeOutput, NodeUpdate};

type ArgsFn = Arc<dyn Fn(&ConversationState) -> Value + Send + Sync>;

/// Deterministically requests one external tool call built from the current state.
///
/// By default the tool receives `{"query": <latest user message>}`.
#[derive(Clone)]
pub struct ToolCallNode {
    tool: String,
    args: ArgsFn,
}

impl ToolCallNode {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: Arc::new(|state: &ConversationState| {
                let query = state
                    .latest_user_message()
                    .map(|message| message.content.clone())
                    .unwrap_or_default();
                json!({ "query": query })
            }),
        }
    }

    pub fn with_args<F>(mut self, args: F) -> Self
    where
        F: Fn(&ConversationState) -> Value + Send + Sync + 'static,
    {
        self.args = Arc::new(args);
        self
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }
}

#[async_trait]
impl AgentNode for ToolCallNode {
    async fn execute(
        &self,
        state: &ConversationState,
        _ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError> {
        Ok(NodeOutput::invoke(self.tool.clone(), (self.args)(state)).into())
    }
}
