use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// How relevance is scored.
///
/// `Dense` uses vector similarity only, `Sparse` keyword overlap only, and `Hybrid`
/// blends them as `alpha * dense + (1 - alpha) * sparse`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchMode {
    Dense,
    Sparse,
    Hybrid { alpha: f32 },
}

impl Default for SearchMode {
    fn default() -> Self {
        SearchMode::Hybrid { alpha: 0.5 }
    }
}

impl SearchMode {
    pub fn alpha(&self) -> f32 {
        match self {
            SearchMode::Dense => 1.0,
            SearchMode::Sparse => 0.0,
            SearchMode::Hybrid { alpha } => alpha.clamp(0.0, 1.0),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SearchMode::Dense => "dense",
            SearchMode::Sparse => "sparse",
            SearchMode::Hybrid { .. } => "hybrid",
        }
    }

    pub fn needs_keywords(&self) -> bool {
        self.alpha() < 1.0
    }

    pub fn blend(&self, dense: f32, sparse: f32) -> f32 {
        let alpha = self.alpha();
        alpha * dense + (1.0 - alpha) * sparse
    }
}

fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|term| term.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of distinct query terms present in `text`, in `[0, 1]`.
pub fn keyword_score(query: &str, text: &str) -> f32 {
    let query_terms = terms(query);
    if query_terms.is_empty() {
        return 0.0;
    }
    let text_terms = terms(text);
    let hits = query_terms
        .iter()
        .filter(|term| text_terms.contains(*term))
        .count();
    hits as f32 / query_terms.len() as f32
}
