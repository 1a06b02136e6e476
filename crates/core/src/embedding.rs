//! Embedder trait: maps text to fixed-length vectors.

use async_trait::async_trait;

use crate::error::EmbeddingError;

/// Trait for embedding text into vectors.
///
/// Implementations must be deterministic for a fixed model version:
/// embedding the same text twice yields bit-identical vectors, and
/// `embed_batch` returns exactly what per-item `embed` calls would.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embed a single text (default: calls `embed_batch` with one item).
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let results = self.embed_batch(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Inference("empty result".into()))
    }

    /// Output embedding dimensions.
    fn dimensions(&self) -> usize;

    /// Identifier of the model version producing the vectors.
    fn model_id(&self) -> &str;
}
