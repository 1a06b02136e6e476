//! Vector similarity and ranking utilities.
//!
//! Pure-Rust implementations of:
//! - Cosine similarity
//! - Ranking a scope's chunks against a query vector

use lorekeep_core::error::StoreError;
use lorekeep_core::index::{ScoredChunk, TextChunk};
use std::cmp::Ordering;

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length or empty.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Rank chunks by cosine similarity to a query embedding.
///
/// Returns at most `top_k` chunks, descending by score, ties broken by
/// `chunk_index` so the order is total. Chunks below `similarity_floor` are
/// excluded. A query whose dimension differs from the chunks' is an error
/// rather than a silent all-zero ranking.
pub fn rank_chunks<'a, I>(
    chunks: I,
    query: &[f32],
    top_k: usize,
    similarity_floor: f32,
) -> Result<Vec<ScoredChunk>, StoreError>
where
    I: IntoIterator<Item = &'a TextChunk>,
{
    let mut scored = Vec::new();
    for chunk in chunks {
        if chunk.embedding.len() != query.len() {
            return Err(StoreError::QueryFailed(format!(
                "query has {} dimensions, chunk {} of {} has {}",
                query.len(),
                chunk.chunk_index,
                chunk.scope,
                chunk.embedding.len()
            )));
        }
        let score = cosine_similarity(&chunk.embedding, query);
        if score >= similarity_floor {
            scored.push(ScoredChunk {
                chunk: chunk.clone(),
                score,
            });
        }
    }

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
    });
    scored.truncate(top_k);
    Ok(scored)
}
