use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ragline_core::{Embedding, MetadataFilter, SearchResult, Value, VectorStore};

use crate::{keyword_score, rank_chunks, BaseRetriever, RetrievalError, RetrievedChunk, SearchMode};

/// Metadata key that ties a chunk to the uploaded file it came from.
pub const FILE_ID_METADATA_KEY: &str = "file_id";

const DEFAULT_CANDIDATE_MULTIPLIER: usize = 4;

#[derive(Clone, Debug, PartialEq)]
pub struct SearchRequest {
    pub k: usize,
    pub mode: SearchMode,
    pub filter: Option<MetadataFilter>,
    pub score_threshold: Option<f32>,
    pub file_scope: Option<Vec<String>>,
}

impl SearchRequest {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            mode: SearchMode::Dense,
            filter: None,
            score_threshold: None,
            file_scope: None,
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    /// Restricts results to chunks whose `file_id` is one of `files`.
    pub fn with_file_scope(mut self, files: Vec<String>) -> Self {
        self.file_scope = Some(files);
        self
    }

    fn scope_is_empty(&self) -> bool {
        matches!(&self.file_scope, Some(files) if files.is_empty())
    }

    fn effective_filter(&self) -> Option<MetadataFilter> {
        let scope = self.file_scope.as_ref().map(|files| {
            MetadataFilter::In(
                FILE_ID_METADATA_KEY.to_string(),
                files.iter().cloned().map(Value::String).collect(),
            )
        });
        match (scope, self.filter.clone()) {
            (Some(scope), Some(filter)) => Some(MetadataFilter::All(vec![scope, filter])),
            (Some(scope), None) => Some(scope),
            (None, filter) => filter,
        }
    }
}

/// Embeds queries and ranks hits from a vector index.
///
/// Sparse and hybrid modes re-score a dense candidate pool of
/// `k * candidate_multiplier` hits with keyword overlap.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedding>,
    store: Arc<dyn VectorStore>,
    candidate_multiplier: usize,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedding>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            store,
            candidate_multiplier: DEFAULT_CANDIDATE_MULTIPLIER,
        }
    }

    pub fn with_candidate_multiplier(mut self, multiplier: usize) -> Self {
        self.candidate_multiplier = multiplier.max(1);
        self
    }

    /// Dense top-`k` lookup for an already embedded query.
    pub async fn retrieve(
        &self,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let results = self.store.search(query_embedding, k, None).await?;
        let chunks = results
            .into_iter()
            .map(|result| to_chunk(result, None))
            .collect();
        Ok(rank_chunks(chunks, k))
    }

    /// Runs the same query under every search mode, keyed by mode name.
    pub async fn compare_modes(
        &self,
        query: &str,
        k: usize,
    ) -> Result<BTreeMap<String, Vec<RetrievedChunk>>, RetrievalError> {
        let embedding = self.embedder.embed(query).await?;
        let mut out = BTreeMap::new();
        for mode in [
            SearchMode::Dense,
            SearchMode::Sparse,
            SearchMode::default(),
        ] {
            let request = SearchRequest::new(k).with_mode(mode);
            let chunks = self.search_embedded(query, &embedding, &request).await?;
            out.insert(mode.name().to_string(), chunks);
        }
        Ok(out)
    }

    async fn search_embedded(
        &self,
        query: &str,
        embedding: &[f32],
        request: &SearchRequest,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let pool = if request.mode.needs_keywords() {
            request.k.saturating_mul(self.candidate_multiplier)
        } else {
            request.k
        };
        let filter = request.effective_filter();
        let results = self.store.search(embedding, pool, filter.as_ref()).await?;

        let mut chunks = Vec::with_capacity(results.len());
        for result in results {
            let chunk = if request.mode.needs_keywords() {
                let sparse = keyword_score(query, &result.document.content);
                if request.mode == SearchMode::Sparse && sparse == 0.0 {
                    continue;
                }
                to_chunk(result, Some((request.mode, sparse)))
            } else {
                to_chunk(result, None)
            };
            chunks.push(chunk);
        }
        if let Some(threshold) = request.score_threshold {
            chunks.retain(|chunk| chunk.score >= threshold);
        }

        let ranked = rank_chunks(chunks, request.k);
        tracing::debug!(
            mode = request.mode.name(),
            k = request.k,
            pool,
            returned = ranked.len(),
            "retrieval complete"
        );
        Ok(ranked)
    }
}

fn to_chunk(result: SearchResult, blend: Option<(SearchMode, f32)>) -> RetrievedChunk {
    let dense = result.score;
    let score = match blend {
        Some((mode, sparse)) => mode.blend(dense, sparse),
        None => dense,
    };
    RetrievedChunk {
        document_id: result.document.id,
        text: result.document.content,
        score,
        distance: 1.0 - dense,
    }
}

#[async_trait]
impl BaseRetriever for Retriever {
    async fn search(
        &self,
        query: &str,
        request: &SearchRequest,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        if request.k == 0 || request.scope_is_empty() {
            return Ok(Vec::new());
        }
        if query.trim().is_empty() {
            return Err(RetrievalError::InvalidRequest("empty query".to_string()));
        }
        let embedding = self.embedder.embed(query).await?;
        self.search_embedded(query, &embedding, request).await
    }
}
