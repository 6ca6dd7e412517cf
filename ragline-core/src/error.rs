use std::{error::Error as StdError, fmt, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaglineError {
    #[error("LLM provider failed: {0}")]
    LlmProvider(String),
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Custom(String),
}

impl From<EmbeddingError> for RaglineError {
    fn from(err: EmbeddingError) -> Self {
        RaglineError::Custom(err.to_string())
    }
}

impl From<IndexError> for RaglineError {
    fn from(err: IndexError) -> Self {
        RaglineError::Custom(err.to_string())
    }
}

#[derive(Debug)]
pub enum EmbeddingError {
    InvalidResponse(String),
    RateLimited { retry_after: Option<Duration> },
    Timeout(Duration),
    Provider(String),
    Other(Box<dyn StdError + Send + Sync>),
}

impl fmt::Display for EmbeddingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddingError::InvalidResponse(message) => {
                write!(f, "Embedding invalid response: {message}")
            }
            EmbeddingError::RateLimited { retry_after } => match retry_after {
                Some(duration) => write!(f, "Embedding rate limited (retry_after={duration:?})"),
                None => write!(f, "Embedding rate limited (retry_after=unknown)"),
            },
            EmbeddingError::Timeout(duration) => write!(f, "Embedding timeout after {duration:?}"),
            EmbeddingError::Provider(message) => write!(f, "Embedding provider error: {message}"),
            EmbeddingError::Other(error) => write!(f, "Embedding error: {error}"),
        }
    }
}

impl StdError for EmbeddingError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            EmbeddingError::Other(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

/// Failures of the vector index backing retrieval.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("invalid document id: {0}")]
    InvalidId(String),
    #[error("missing embedding for document '{0}'")]
    MissingEmbedding(String),
    #[error("vector index unreachable: {0}")]
    Unreachable(String),
    #[error("Index error: {0}")]
    Internal(#[source] Box<dyn StdError + Send + Sync>),
}

/// Failures of the checkpoint persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
    #[error("checkpoint store unavailable after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("checkpoint conflict for run '{run_id}' at step {step}")]
    Conflict { run_id: String, step: u64 },
    #[error("checkpoint out of order for run '{run_id}': expected step {expected}, got {got}")]
    OutOfOrder {
        run_id: String,
        expected: u64,
        got: u64,
    },
    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("checkpoint backend failed: {0}")]
    Backend(String),
}

impl StoreError {
    /// Connectivity-style failures that are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
