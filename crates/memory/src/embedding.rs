//! Embedding generators and the process-wide shared embedder.
//!
//! - [`HashEmbedder`]: deterministic feature-hashed bag of words. Works
//!   offline and is the stand-in model for tests.
//! - [`ProviderEmbedder`]: any OpenAI-compatible `/embeddings` endpoint.
//! - [`BoundedEmbedder`]: caps concurrent inference on a wrapped embedder.
//!
//! The model is loaded once per process through [`shared_embedder`] and
//! never torn down.

use async_trait::async_trait;
use lorekeep_core::embedding::Embedder;
use lorekeep_core::error::EmbeddingError;
use lorekeep_core::provider::{EmbeddingRequest, Provider};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info};

/// Scale `v` to unit length in place. A zero vector is left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x = (f64::from(*x) / norm) as f32;
        }
    }
}

/// Lower-cased alphanumeric tokens of `text`.
fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Deterministic embedding by feature hashing.
///
/// Each lower-cased word and each adjacent word pair is hashed with
/// SHA-256; the hash picks a bucket and a sign. The bucket counts are
/// L2-normalised, so texts sharing vocabulary have high cosine similarity.
pub struct HashEmbedder {
    dims: usize,
    model_id: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            model_id: format!("feature-hash-v1/{}", dims.max(1)),
        }
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let hash = Sha256::digest(feature.as_bytes());
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&hash[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
        let sign = if hash[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }

    fn hash_to_vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let words: Vec<String> = tokens(text).collect();
        for word in &words {
            self.add_feature(&mut v, word, 1.0);
        }
        for pair in words.windows(2) {
            self.add_feature(&mut v, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.hash_to_vector(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Embeddings from a remote provider.
pub struct ProviderEmbedder {
    provider: Arc<dyn Provider>,
    model: String,
    dims: usize,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, dims: usize) -> Self {
        Self {
            provider,
            model: model.into(),
            dims,
        }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .provider
            .embed(EmbeddingRequest {
                model: self.model.clone(),
                inputs: texts.to_vec(),
            })
            .await
            .map_err(|e| EmbeddingError::Inference(e.to_string()))?;

        if response.embeddings.len() != texts.len() {
            return Err(EmbeddingError::Inference(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        let mut out = Vec::with_capacity(texts.len());
        for mut v in response.embeddings {
            if v.len() != self.dims {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dims,
                    actual: v.len(),
                });
            }
            l2_normalize(&mut v);
            out.push(v);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Wraps an embedder so at most `max_concurrency` inference calls run at once.
pub struct BoundedEmbedder {
    inner: Arc<dyn Embedder>,
    permits: Semaphore,
}

impl BoundedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, max_concurrency: usize) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_concurrency.max(1)),
        }
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl Embedder for BoundedEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EmbeddingError::NotReady)?;
        debug!(count = texts.len(), model = self.inner.model_id(), "Embedding batch");
        self.inner.embed_batch(texts).await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

static SHARED_EMBEDDER: OnceCell<Arc<dyn Embedder>> = OnceCell::const_new();

/// The process-wide embedder, initialised on first use.
///
/// `init` runs at most once even under concurrent callers; later calls get
/// the already-loaded model and ignore their `init`. A failed
/// initialisation leaves the cell empty so the next call can retry.
pub async fn shared_embedder<F, Fut>(init: F) -> Result<Arc<dyn Embedder>, EmbeddingError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Arc<dyn Embedder>, EmbeddingError>>,
{
    SHARED_EMBEDDER
        .get_or_try_init(|| async move {
            let embedder = init().await?;
            info!(
                model = embedder.model_id(),
                dimensions = embedder.dimensions(),
                "Embedding model loaded"
            );
            Ok::<_, EmbeddingError>(embedder)
        })
        .await
        .cloned()
}
