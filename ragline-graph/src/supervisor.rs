use std::sync::Arc;

use async_trait::async_trait;
use ragline_core::{ConversationState, LlmRequest, Message, Role, ToolCallingLlm, ToolSpec};
use serde_json::json;

use crate::node::scratch_keys::LAST_ERROR;
use crate::{AgentNode, NodeContext, NodeError, NodeOutput, NodeUpdate};

const AWAITING_USER: &str = "awaiting user input";
const DEFAULT_FALLBACK: &str =
    "Sorry, I could not complete that request right now. Please try again.";
const TRANSFER_PREFIX: &str = "transfer_to_";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorRule {
    pub keywords: Vec<String>,
    pub target: String,
}

impl SupervisorRule {
    fn matches(&self, text: &str) -> bool {
        self.keywords
            .iter()
            .any(|keyword| text.contains(keyword.as_str()))
    }
}

/// Deterministic supervisor that routes on message roles and keyword rules.
///
/// Decision order: a recorded node failure is answered with the fallback reply,
/// a fresh tool result goes to the `after_tool` node, a user turn is matched
/// against the rules (first match wins, else the default target), and anything
/// else waits for the user.
#[derive(Clone, Debug)]
pub struct RuleSupervisor {
    rules: Vec<SupervisorRule>,
    default_target: String,
    after_tool: String,
    fallback_reply: String,
}

impl RuleSupervisor {
    pub fn new(default_target: impl Into<String>) -> Self {
        let default_target = default_target.into();
        Self {
            rules: Vec::new(),
            after_tool: default_target.clone(),
            default_target,
            fallback_reply: DEFAULT_FALLBACK.to_string(),
        }
    }

    pub fn route_when(mut self, keywords: &[&str], target: impl Into<String>) -> Self {
        self.rules.push(SupervisorRule {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            target: target.into(),
        });
        self
    }

    pub fn after_tool(mut self, target: impl Into<String>) -> Self {
        self.after_tool = target.into();
        self
    }

    pub fn fallback_reply(mut self, text: impl Into<String>) -> Self {
        self.fallback_reply = text.into();
        self
    }

    fn decide(&self, state: &ConversationState) -> NodeOutput {
        if state.scratch(LAST_ERROR).is_some() {
            return NodeOutput::respond(self.fallback_reply.clone());
        }
        match state.last_message() {
            Some(message) if message.role == Role::Tool => {
                NodeOutput::route(self.after_tool.clone())
            }
            Some(message) if message.role == Role::User => {
                let text = message.content.to_lowercase();
                let target = self
                    .rules
                    .iter()
                    .find(|rule| rule.matches(&text))
                    .map_or(&self.default_target, |rule| &rule.target);
                NodeOutput::route(target.clone())
            }
            _ => NodeOutput::suspend(AWAITING_USER),
        }
    }
}

#[async_trait]
impl AgentNode for RuleSupervisor {
    async fn execute(
        &self,
        state: &ConversationState,
        _ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError> {
        Ok(self.decide(state).into())
    }

    fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.rules.iter().map(|rule| rule.target.clone()).collect();
        routes.push(self.default_target.clone());
        routes.push(self.after_tool.clone());
        routes.sort();
        routes.dedup();
        routes
    }
}

/// Supervisor that lets a model pick the next agent through `transfer_to_<node>` tools.
///
/// Runs at temperature 0. A plain-text answer is treated as the final reply.
pub struct LlmSupervisor {
    llm: Arc<dyn ToolCallingLlm>,
    model: String,
    prompt: String,
    targets: Vec<(String, String)>,
}

impl LlmSupervisor {
    pub fn new(llm: Arc<dyn ToolCallingLlm>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            prompt: "You coordinate a team of agents. Hand the conversation to the agent best \
                     suited to answer, or reply directly when no agent is needed."
                .to_string(),
            targets: Vec::new(),
        }
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn target(mut self, node_id: impl Into<String>, description: impl Into<String>) -> Self {
        self.targets.push((node_id.into(), description.into()));
        self
    }

    fn transfer_tools(&self) -> Vec<ToolSpec> {
        self.targets
            .iter()
            .map(|(node_id, description)| ToolSpec {
                name: format!("{TRANSFER_PREFIX}{node_id}"),
                description: description.clone(),
                parameters: json!({ "type": "object", "properties": {} }),
            })
            .collect()
    }

    fn target_for(&self, tool_name: &str) -> Option<&str> {
        let node_id = tool_name.strip_prefix(TRANSFER_PREFIX)?;
        self.targets
            .iter()
            .find(|(id, _)| id == node_id)
            .map(|(id, _)| id.as_str())
    }
}

#[async_trait]
impl AgentNode for LlmSupervisor {
    async fn execute(
        &self,
        state: &ConversationState,
        _ctx: &NodeContext,
    ) -> Result<NodeUpdate, NodeError> {
        if state.scratch(LAST_ERROR).is_some() {
            return Ok(NodeOutput::respond(DEFAULT_FALLBACK).into());
        }
        if matches!(state.last_message(), None | Some(Message { role: Role::Assistant, .. })) {
            return Ok(NodeOutput::suspend(AWAITING_USER).into());
        }

        let mut messages = vec![Message::system(self.prompt.clone())];
        messages.extend(state.messages.iter().cloned());
        let response = self
            .llm
            .invoke(LlmRequest {
                model: self.model.clone(),
                messages,
                tools: self.transfer_tools(),
                temperature: Some(0.0),
            })
            .await?;

        if let Some(call) = response.tool_calls.first() {
            return match self.target_for(&call.name) {
                Some(target) => Ok(NodeOutput::route(target).into()),
                None => Err(NodeError::Recoverable(format!(
                    "supervisor chose unknown hand-off '{}'",
                    call.name
                ))),
            };
        }
        if response.content.trim().is_empty() {
            return Err(NodeError::Recoverable(
                "supervisor returned neither a hand-off nor a reply".to_string(),
            ));
        }
        Ok(NodeOutput::respond(response.content).into())
    }

    fn routes(&self) -> Vec<String> {
        self.targets.iter().map(|(id, _)| id.clone()).collect()
    }
}
