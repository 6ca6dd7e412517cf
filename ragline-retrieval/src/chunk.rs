use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// One ranked hit from a retrieval call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetrievedChunk {
    pub document_id: String,
    pub text: String,
    pub score: f32,
    pub distance: f32,
}

fn comparable(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}

/// Orders by descending score with ties broken by ascending document id, then keeps `k`.
pub fn rank_chunks(mut chunks: Vec<RetrievedChunk>, k: usize) -> Vec<RetrievedChunk> {
    chunks.sort_by(|a, b| {
        comparable(b.score)
            .partial_cmp(&comparable(a.score))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
    chunks.truncate(k);
    chunks
}
