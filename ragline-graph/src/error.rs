use std::time::Duration;

use ragline_core::{RaglineError, StoreError};
use ragline_retrieval::RetrievalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("recoverable node failure: {0}")]
    Recoverable(String),
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("node timed out after {0:?}")]
    Timeout(Duration),
    #[error("fatal node failure: {0}")]
    Fatal(String),
}

impl NodeError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, NodeError::Fatal(_))
    }
}

impl From<RaglineError> for NodeError {
    fn from(err: RaglineError) -> Self {
        match err {
            RaglineError::Timeout(duration) => NodeError::Timeout(duration),
            RaglineError::InvalidConfig(_) | RaglineError::Serde(_) => {
                NodeError::Fatal(err.to_string())
            }
            other => NodeError::Recoverable(other.to_string()),
        }
    }
}

impl From<RetrievalError> for NodeError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::Unavailable(message) => NodeError::RetrievalUnavailable(message),
            RetrievalError::Index(_) => NodeError::Fatal(err.to_string()),
            other => NodeError::Recoverable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Fatal(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("checkpoint failed: {0}")]
    Store(#[from] StoreError),
    #[error("node '{node}' failed: {source}")]
    NodeFailed { node: String, source: NodeError },
    #[error("unknown node: {node}")]
    UnknownNode { node: String },
    #[error("invalid route from '{from}' to '{to}'")]
    InvalidRoute { from: String, to: String },
    #[error("step limit exceeded: {steps} steps ran without a stopping point (limit {limit})")]
    StepLimitExceeded { limit: usize, steps: usize },
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
}
