use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use ragline_core::{Document, IndexError, MetadataFilter, SearchResult, VectorStore};
use tokio::sync::RwLock;

#[derive(Default)]
struct StoreInner {
    docs: Vec<Option<Document>>,
    embeddings: Vec<Option<Vec<f32>>>,
    id_map: HashMap<String, usize>,
    dimension: Option<usize>,
}

/// Brute-force cosine index held in memory.
#[derive(Clone, Default)]
pub struct InMemoryVectorStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.id_map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, docs: Vec<Document>) -> Result<(), IndexError> {
        let mut inner = self.inner.write().await;
        for mut doc in docs {
            if doc.id.trim().is_empty() {
                return Err(IndexError::InvalidId(doc.id));
            }

            let embedding = doc
                .embedding
                .take()
                .ok_or_else(|| IndexError::MissingEmbedding(doc.id.clone()))?;
            let dimension = embedding.len();
            match inner.dimension {
                Some(expected) if expected != dimension => {
                    return Err(IndexError::DimensionMismatch {
                        expected,
                        got: dimension,
                    });
                }
                None => inner.dimension = Some(dimension),
                _ => {}
            }

            if let Some(&index) = inner.id_map.get(&doc.id) {
                inner.docs[index] = Some(doc);
                inner.embeddings[index] = Some(embedding);
            } else {
                let index = inner.docs.len();
                inner.id_map.insert(doc.id.clone(), index);
                inner.docs.push(Some(doc));
                inner.embeddings.push(Some(embedding));
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        let inner = self.inner.read().await;
        let expected = inner.dimension.unwrap_or(query_embedding.len());
        if expected != query_embedding.len() {
            return Err(IndexError::DimensionMismatch {
                expected,
                got: query_embedding.len(),
            });
        }

        let mut scored = Vec::new();
        for (idx, embedding) in inner.embeddings.iter().enumerate() {
            let Some(embedding) = embedding else { continue };
            let Some(doc) = inner.docs[idx].as_ref() else {
                continue;
            };
            if let Some(filter) = filter {
                if !filter.matches(&doc.metadata) {
                    continue;
                }
            }
            let mut score = cosine_similarity(query_embedding, embedding);
            if score.is_nan() {
                score = f32::NEG_INFINITY;
            }
            scored.push(SearchResult {
                document: doc.clone(),
                score,
            });
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), IndexError> {
        let mut inner = self.inner.write().await;
        for id in ids {
            if let Some(idx) = inner.id_map.remove(id) {
                inner.docs[idx] = None;
                inner.embeddings[idx] = None;
            }
        }
        Ok(())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
