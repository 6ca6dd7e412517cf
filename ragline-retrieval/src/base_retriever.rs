use async_trait::async_trait;

use crate::{RetrievalError, RetrievedChunk, SearchRequest};

/// Query-text retrieval seam used by agent nodes.
///
/// Implementations return at most `request.k` chunks, most relevant first.
#[async_trait]
pub trait BaseRetriever: Send + Sync {
    async fn search(
        &self,
        query: &str,
        request: &SearchRequest,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError>;
}
