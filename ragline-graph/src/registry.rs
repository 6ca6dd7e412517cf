use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ragline_core::ConversationState;

use crate::{
    AgentNode, LlmSupervisor, NodeContext, NodeError, NodeUpdate, RetrievalResponderNode,
    RuleSupervisor, ToolCallNode,
};

/// The node kinds a graph can hold. `Custom` admits user-provided agents.
pub enum RegisteredNode {
    RuleSupervisor(RuleSupervisor),
    LlmSupervisor(LlmSupervisor),
    Responder(RetrievalResponderNode),
    ToolCall(ToolCallNode),
    Custom(Arc<dyn AgentNode>),
}

impl RegisteredNode {
    pub fn kind(&self) -> &'static str {
        match self {
            RegisteredNode::RuleSupervisor(_) => "rule_supervisor",
            RegisteredNode::LlmSupervisor(_) => "llm_supervisor",
            RegisteredNode::Responder(_) => "responder",
            RegisteredNode::ToolCall(_) => "tool_call",
            RegisteredNode::Custom(_) => "custom",
        }
    }

    fn as_node(&self) -> &dyn AgentNode {
        match self {
            RegisteredNode::RuleSupervisor(node) => node,
            RegisteredNode::LlmSupervisor(node) => node,
            RegisteredNode::Responder(node) => node,
            RegisteredNode::ToolCall(node) => node,
            RegisteredNode::Custom(node) => node.as_ref(),
        }
    }
}

#[async_trait]
impl AgentNode for RegisteredNode {
    async fn execute(
        &self,
        state: &ConversationState,
        ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError> {
        self.as_node().execute(state, ctx).await
    }

    fn routes(&self) -> Vec<String> {
        self.as_node().routes()
    }
}

impl From<RuleSupervisor> for RegisteredNode {
    fn from(node: RuleSupervisor) -> Self {
        RegisteredNode::RuleSupervisor(node)
    }
}

impl From<LlmSupervisor> for RegisteredNode {
    fn from(node: LlmSupervisor) -> Self {
        RegisteredNode::LlmSupervisor(node)
    }
}

impl From<RetrievalResponderNode> for RegisteredNode {
    fn from(node: RetrievalResponderNode) -> Self {
        RegisteredNode::Responder(node)
    }
}

impl From<ToolCallNode> for RegisteredNode {
    fn from(node: ToolCallNode) -> Self {
        RegisteredNode::ToolCall(node)
    }
}

impl From<Arc<dyn AgentNode>> for RegisteredNode {
    fn from(node: Arc<dyn AgentNode>) -> Self {
        RegisteredNode::Custom(node)
    }
}

/// Node id to node lookup, fixed once the graph is built.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, RegisteredNode>,
}

impl NodeRegistry {
    pub(crate) fn insert(&mut self, id: String, node: RegisteredNode) -> Option<RegisteredNode> {
        self.nodes.insert(id, node)
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &RegisteredNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }
}
