use async_trait::async_trait;

use crate::{Document, IndexError, MetadataFilter};

#[derive(Clone, Debug)]
pub struct SearchResult {
    pub document: Document,
    pub score: f32,
}

/// Nearest-neighbour search over embedded documents.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(&self, docs: Vec<Document>) -> Result<(), IndexError>;
    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, IndexError>;
    async fn delete(&self, ids: &[String]) -> Result<(), IndexError>;
}
