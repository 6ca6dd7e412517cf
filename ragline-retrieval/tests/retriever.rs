use std::sync::Arc;

use ragline_core::{Document, IndexError, MetadataFilter, SearchResult, VectorStore};
use ragline_retrieval::{
    BaseRetriever, HashEmbedder, InMemoryVectorStore, RetrievalError, Retriever, SearchMode,
    SearchRequest,
};

fn doc(id: &str, content: &str, embedding: Vec<f32>) -> Document {
    Document::new(id, content).with_embedding(embedding)
}

struct UnreachableStore;

#[async_trait::async_trait]
impl VectorStore for UnreachableStore {
    async fn add(&self, _docs: Vec<Document>) -> Result<(), IndexError> {
        Err(IndexError::Unreachable("connection refused".to_string()))
    }

    async fn search(
        &self,
        _query_embedding: &[f32],
        _top_k: usize,
        _filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        Err(IndexError::Unreachable("connection refused".to_string()))
    }

    async fn delete(&self, _ids: &[String]) -> Result<(), IndexError> {
        Ok(())
    }
}

async fn text_index(embedder: &HashEmbedder, docs: &[(&str, &str, &str)]) -> InMemoryVectorStore {
    use ragline_core::Embedding;

    let store = InMemoryVectorStore::new();
    let mut indexed = Vec::new();
    for (id, file, text) in docs {
        let embedding = embedder.embed(text).await.unwrap();
        indexed.push(
            Document::new(*id, *text)
                .with_metadata("file_id", *file)
                .with_embedding(embedding),
        );
    }
    store.add(indexed).await.unwrap();
    store
}

#[tokio::test]
async fn retrieve_orders_by_score_and_breaks_ties_by_id() {
    let store = InMemoryVectorStore::new();
    store
        .add(vec![
            doc("c", "c", vec![1.0, 0.0]),
            doc("a", "a", vec![1.0, 0.0]),
            doc("b", "b", vec![0.0, 1.0]),
            doc("d", "d", vec![0.7, 0.7]),
        ])
        .await
        .unwrap();
    let retriever = Retriever::new(Arc::new(HashEmbedder::new(2)), Arc::new(store));

    let chunks = retriever.retrieve(&[1.0, 0.0], 3).await.unwrap();
    let ids: Vec<_> = chunks.iter().map(|c| c.document_id.as_str()).collect();

    assert_eq!(ids, vec!["a", "c", "d"]);
    assert!(chunks.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(chunks[0].distance.abs() < 1e-6);
}

#[tokio::test]
async fn retrieve_returns_fewer_when_index_is_small() {
    let store = InMemoryVectorStore::new();
    store.add(vec![doc("only", "only", vec![1.0, 0.0])]).await.unwrap();
    let retriever = Retriever::new(Arc::new(HashEmbedder::new(2)), Arc::new(store));

    assert_eq!(retriever.retrieve(&[1.0, 0.0], 5).await.unwrap().len(), 1);
    assert!(retriever.retrieve(&[1.0, 0.0], 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn retrieve_is_deterministic_for_a_fixed_snapshot() {
    let embedder = HashEmbedder::new(64);
    let store = text_index(
        &embedder,
        &[
            ("policy.md#0", "policy.md", "Refunds are accepted within 30 days of purchase."),
            ("policy.md#1", "policy.md", "Shipping takes five business days."),
            ("faq.md#0", "faq.md", "Contact support for refund questions."),
        ],
    )
    .await;
    let retriever = Retriever::new(Arc::new(embedder), Arc::new(store));
    let request = SearchRequest::new(2).with_mode(SearchMode::default());

    let first = retriever.search("What is the refund policy?", &request).await.unwrap();
    let second = retriever.search("What is the refund policy?", &request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}

#[tokio::test]
async fn unreachable_index_is_retrieval_unavailable() {
    let retriever = Retriever::new(Arc::new(HashEmbedder::new(8)), Arc::new(UnreachableStore));

    let err = retriever
        .search("anything", &SearchRequest::new(3))
        .await
        .unwrap_err();
    assert!(err.is_unavailable(), "got {err}");

    let err = retriever.retrieve(&[0.0; 8], 3).await.unwrap_err();
    assert!(matches!(err, RetrievalError::Unavailable(_)));
}

#[tokio::test]
async fn file_scope_restricts_results() {
    let embedder = HashEmbedder::new(64);
    let store = text_index(
        &embedder,
        &[
            ("a#0", "a.pdf", "refund rules for store a"),
            ("b#0", "b.pdf", "refund rules for store b"),
        ],
    )
    .await;
    let retriever = Retriever::new(Arc::new(embedder), Arc::new(store));

    let scoped = retriever
        .search(
            "refund rules",
            &SearchRequest::new(5).with_file_scope(vec!["b.pdf".to_string()]),
        )
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].document_id, "b#0");

    let none = retriever
        .search("refund rules", &SearchRequest::new(5).with_file_scope(Vec::new()))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn sparse_mode_drops_chunks_without_keyword_hits() {
    let embedder = HashEmbedder::new(64);
    let store = text_index(
        &embedder,
        &[
            ("hit", "f", "invoice number INV-42 was refunded"),
            ("miss", "f", "weather is sunny today"),
        ],
    )
    .await;
    let retriever = Retriever::new(Arc::new(embedder), Arc::new(store));

    let chunks = retriever
        .search("invoice", &SearchRequest::new(5).with_mode(SearchMode::Sparse))
        .await
        .unwrap();
    let ids: Vec<_> = chunks.iter().map(|c| c.document_id.as_str()).collect();
    assert_eq!(ids, vec!["hit"]);
    assert_eq!(chunks[0].score, 1.0);
}

#[tokio::test]
async fn compare_modes_reports_every_mode() {
    let embedder = HashEmbedder::new(64);
    let store = text_index(&embedder, &[("x", "f", "refund window thirty days")]).await;
    let retriever = Retriever::new(Arc::new(embedder), Arc::new(store));

    let compared = retriever.compare_modes("refund window", 2).await.unwrap();
    let modes: Vec<_> = compared.keys().map(String::as_str).collect();
    assert_eq!(modes, vec!["dense", "hybrid", "sparse"]);
    assert!(compared.values().all(|chunks| chunks.len() == 1));
}

#[tokio::test]
async fn score_threshold_filters_weak_hits() {
    let store = InMemoryVectorStore::new();
    store
        .add(vec![
            doc("strong", "strong", vec![1.0, 0.0]),
            doc("weak", "weak", vec![0.0, 1.0]),
        ])
        .await
        .unwrap();
    let retriever = Retriever::new(Arc::new(FixedEmbedder), Arc::new(store));

    let chunks = retriever
        .search("q", &SearchRequest::new(5).with_score_threshold(0.5))
        .await
        .unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].document_id, "strong");
}

struct FixedEmbedder;

#[async_trait::async_trait]
impl ragline_core::Embedding for FixedEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ragline_core::EmbeddingError> {
        Ok(vec![1.0, 0.0])
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ragline_core::EmbeddingError> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }

    fn dimension(&self) -> usize {
        2
    }
}

struct FailingEmbedder(fn() -> ragline_core::EmbeddingError);

#[async_trait::async_trait]
impl ragline_core::Embedding for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ragline_core::EmbeddingError> {
        Err((self.0)())
    }

    async fn embed_batch(
        &self,
        _texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ragline_core::EmbeddingError> {
        Err((self.0)())
    }

    fn dimension(&self) -> usize {
        2
    }
}

#[tokio::test]
async fn embedding_transport_failures_are_retrieval_unavailable() {
    let timed_out = Retriever::new(
        Arc::new(FailingEmbedder(|| {
            ragline_core::EmbeddingError::Timeout(std::time::Duration::from_secs(5))
        })),
        Arc::new(InMemoryVectorStore::new()),
    );
    let err = timed_out
        .search("refunds", &SearchRequest::new(3))
        .await
        .unwrap_err();
    assert!(err.is_unavailable(), "got {err}");

    let provider_down = Retriever::new(
        Arc::new(FailingEmbedder(|| {
            ragline_core::EmbeddingError::Provider("503 service unavailable".to_string())
        })),
        Arc::new(InMemoryVectorStore::new()),
    );
    let err = provider_down
        .search("refunds", &SearchRequest::new(3))
        .await
        .unwrap_err();
    assert!(err.is_unavailable(), "got {err}");

    let malformed = Retriever::new(
        Arc::new(FailingEmbedder(|| {
            ragline_core::EmbeddingError::InvalidResponse("empty vector".to_string())
        })),
        Arc::new(InMemoryVectorStore::new()),
    );
    let err = malformed
        .search("refunds", &SearchRequest::new(3))
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::Embedding(_)), "got {err}");
}
