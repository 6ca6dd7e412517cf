use ragline_core::{StoreError, ToolError};
use ragline_graph::{GraphError, NodeError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Error categories reported to callers of the session API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Store,
    RetrievalUnavailable,
    Tool,
    StepLimitExceeded,
    Conflict,
    NotFound,
    RunFailed,
    AwaitingTool,
    Node,
    InvalidRequest,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no run found for conversation '{0}'")]
    NotFound(String),
    #[error("conversation '{conversation_id}' is waiting for tool '{tool}' (call {call_id})")]
    AwaitingTool {
        conversation_id: String,
        call_id: String,
        tool: String,
    },
    #[error("conversation '{0}' is not waiting for a tool result")]
    NotAwaitingTool(String),
    #[error("tool result for call '{got}' does not match pending call '{expected}'")]
    UnexpectedToolResult { expected: String, got: String },
    #[error("run for conversation '{conversation_id}' failed and must be replayed: {reason}")]
    RunFailed {
        conversation_id: String,
        reason: String,
    },
    #[error("critical tool '{tool}' failed: {source}")]
    Tool {
        tool: String,
        #[source]
        source: ToolError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidRequest(_)
            | SessionError::NotAwaitingTool(_)
            | SessionError::UnexpectedToolResult { .. }
            | SessionError::Config(_) => ErrorKind::InvalidRequest,
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::AwaitingTool { .. } => ErrorKind::AwaitingTool,
            SessionError::RunFailed { .. } => ErrorKind::RunFailed,
            SessionError::Tool { .. } => ErrorKind::Tool,
            SessionError::Store(err) => store_kind(err),
            SessionError::Graph(err) => match err {
                GraphError::Store(err) => store_kind(err),
                GraphError::StepLimitExceeded { .. } => ErrorKind::StepLimitExceeded,
                GraphError::NodeFailed {
                    source: NodeError::RetrievalUnavailable(_),
                    ..
                } => ErrorKind::RetrievalUnavailable,
                _ => ErrorKind::Node,
            },
        }
    }
}

fn store_kind(err: &StoreError) -> ErrorKind {
    match err {
        StoreError::Conflict { .. } => ErrorKind::Conflict,
        _ => ErrorKind::Store,
    }
}
