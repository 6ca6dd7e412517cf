use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{Message, Role, ToolCall, Value};

/// Shared state of one conversation run.
///
/// Scratch variables live in an ordered map so two equal states always serialize
/// to identical bytes; checkpoint idempotence relies on that.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub scratch: BTreeMap<String, Value>,
    #[serde(default)]
    pub step: u64,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn latest_user_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
    }

    pub fn scratch(&self, key: &str) -> Option<&Value> {
        self.scratch.get(key)
    }

    pub fn scratch_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.scratch
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn set_scratch(&mut self, key: impl Into<String>, value: Value) {
        self.scratch.insert(key.into(), value);
    }

    pub fn remove_scratch(&mut self, key: &str) -> Option<Value> {
        self.scratch.remove(key)
    }

    /// The most recent tool call that has no matching tool result yet.
    pub fn pending_tool_call(&self) -> Option<&ToolCall> {
        for (idx, message) in self.messages.iter().enumerate().rev() {
            if message.tool_calls.is_empty() {
                continue;
            }
            let answered = |call: &ToolCall| {
                self.messages[idx + 1..].iter().any(|later| {
                    later.role == Role::Tool && later.tool_call_id.as_deref() == Some(&call.id)
                })
            };
            return message.tool_calls.iter().find(|call| !answered(call));
        }
        None
    }

    pub fn to_blob(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_blob(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod state_tests;
