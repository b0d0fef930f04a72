//! Lexical search over the loaded knowledge corpus.
//!
//! Scoring is intentionally simple: each query token contributes the
//! number of times its truncated stem occurs in a document's normalized
//! text. Stemming to the first few characters tolerates Japanese
//! inflection ("申請する" still matches "申請"). Documents scoring zero
//! are dropped, ranking is stable, and the result never exceeds `top_k`.

use std::collections::HashSet;

use crate::knowledge::Document;
use crate::util::{normalize, tokenize, truncate_chars};

/// Stem length in characters. Tokens shorter than this are used whole.
const STEM_CHARS: usize = 4;

fn stem(token: &str) -> &str {
    truncate_chars(token, STEM_CHARS)
}

/// Rank documents against a query. `restrict_to` limits candidates to the
/// given source identifiers; when a restricted search yields nothing the
/// caller decides whether to retry unrestricted. No implicit fallback
/// happens here.
pub fn search<'a>(
    docs: &'a [Document],
    query: &str,
    top_k: usize,
    restrict_to: Option<&HashSet<&str>>,
) -> Vec<&'a Document> {
    let q = normalize(query);
    let tokens = tokenize(&q);
    if tokens.is_empty() {
        return Vec::new();
    }
    let stems: Vec<&str> = tokens.iter().map(|t| stem(t)).collect();

    let mut scored: Vec<(&Document, usize)> = docs
        .iter()
        .filter(|d| {
            restrict_to
                .map(|set| set.contains(d.source.as_str()))
                .unwrap_or(true)
        })
        .map(|d| {
            let score: usize = stems
                .iter()
                .map(|s| d.normalized.matches(s).count())
                .sum();
            (d, score)
        })
        .filter(|(_, score)| *score > 0)
        .collect();

    // Stable sort keeps corpus order for equal scores.
    scored.sort_by(|a, b| b.1.cmp(&a.1));
    scored.truncate(top_k);
    scored.into_iter().map(|(d, _)| d).collect()
}

/// Move the scope's preferred document to the front of a result list
/// without re-scoring. Biases the evidence toward the user's selected
/// topic while keeping the other hits.
pub fn prioritize<'a>(mut hits: Vec<&'a Document>, preferred_source: &str) -> Vec<&'a Document> {
    if let Some(pos) = hits.iter().position(|d| d.source == preferred_source) {
        let doc = hits.remove(pos);
        hits.insert(0, doc);
    }
    hits
}
