use ragline_core::{EmbeddingError, IndexError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("retrieval unavailable: {0}")]
    Unavailable(String),
    #[error("embedding error: {0}")]
    Embedding(EmbeddingError),
    #[error("index rejected query: {0}")]
    Index(IndexError),
    #[error("invalid search request: {0}")]
    InvalidRequest(String),
}

impl From<IndexError> for RetrievalError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Unreachable(message) => RetrievalError::Unavailable(message),
            IndexError::Internal(source) => RetrievalError::Unavailable(source.to_string()),
            other => RetrievalError::Index(other),
        }
    }
}

/// Timeouts, rate limits and provider outages are transport trouble and count
/// as the retriever being unavailable; malformed embeddings stay embedding errors.
impl From<EmbeddingError> for RetrievalError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::Timeout(_)
            | EmbeddingError::RateLimited { .. }
            | EmbeddingError::Provider(_) => RetrievalError::Unavailable(err.to_string()),
            other => RetrievalError::Embedding(other),
        }
    }
}

impl RetrievalError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RetrievalError::Unavailable(_))
    }
}
