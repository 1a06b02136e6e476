//! Backstory and document retrieval.
//!
//! Both sources share one contract over different owner scopes: a source
//! is saved as a whole (chunked, embedded and swapped in atomically), and
//! read back either as the chunks most relevant to a query or, when the
//! source is small enough that ranking adds nothing, as its full text.

use chrono::Utc;
use lorekeep_config::RetrievalConfig;
use lorekeep_core::embedding::Embedder;
use lorekeep_core::error::{EmbeddingError, Error, Result, RetrievalError};
use lorekeep_core::index::{OwnerKind, OwnerScope, ScopeSnapshot, ScoredChunk, TextChunk, VectorIndex};
use lorekeep_core::token::estimate_tokens;
use lorekeep_memory::{paragraphs, Chunker};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Retrieval over one kind of owner scope.
pub struct Retriever {
    kind: OwnerKind,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    chunker: Chunker,
    settings: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        kind: OwnerKind,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        chunker: Chunker,
        settings: RetrievalConfig,
    ) -> Self {
        Self {
            kind,
            index,
            embedder,
            chunker,
            settings,
        }
    }

    /// Retriever over character backstories.
    pub fn backstory(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        chunker: Chunker,
        settings: RetrievalConfig,
    ) -> Self {
        Self::new(OwnerKind::Backstory, index, embedder, chunker, settings)
    }

    /// Retriever over uploaded documents.
    pub fn documents(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        chunker: Chunker,
        settings: RetrievalConfig,
    ) -> Self {
        Self::new(OwnerKind::Document, index, embedder, chunker, settings)
    }

    pub fn kind(&self) -> OwnerKind {
        self.kind
    }

    fn scope(&self, owner_id: &str, user_id: &str) -> OwnerScope {
        OwnerScope::new(self.kind, owner_id, user_id)
    }

    /// Chunk, embed and atomically replace everything stored for the owner.
    ///
    /// Called on every edit of the source. Returns the number of chunks
    /// stored. A failed save leaves the previous version in place; retry
    /// the full save.
    pub async fn save(&self, owner_id: &str, user_id: &str, text: &str) -> Result<usize> {
        let scope = self.scope(owner_id, user_id);
        let pieces = self.chunker.chunk(text)?;
        let vectors = self.embedder.embed_batch(&pieces).await?;
        if vectors.len() != pieces.len() {
            return Err(Error::Embedding(EmbeddingError::Inference(format!(
                "expected {} embeddings, got {}",
                pieces.len(),
                vectors.len()
            ))));
        }

        let now = Utc::now();
        let chunks = pieces
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(chunk_index, (text, embedding))| TextChunk {
                id: uuid::Uuid::new_v4().to_string(),
                scope: scope.clone(),
                chunk_index,
                text,
                embedding,
                created_at: now,
            })
            .collect();

        let stored = self
            .index
            .upsert(
                &scope,
                ScopeSnapshot {
                    source_text: text.to_string(),
                    chunks,
                },
            )
            .await?;
        info!(scope = %scope, chunks = stored, model = self.embedder.model_id(), "Source indexed");
        Ok(stored)
    }

    /// Drop the owner's source and chunks. Returns false if nothing was stored.
    pub async fn remove(&self, owner_id: &str, user_id: &str) -> Result<bool> {
        let scope = self.scope(owner_id, user_id);
        let removed = self.index.remove(&scope).await?;
        debug!(scope = %scope, removed, "Source removed");
        Ok(removed)
    }

    /// The chunk texts most relevant to `query`, most relevant first.
    pub async fn get_relevant(
        &self,
        owner_id: &str,
        user_id: &str,
        query: &str,
        top_k: usize,
    ) -> std::result::Result<Vec<String>, RetrievalError> {
        let vector = self.embed_query(query).await?;
        let ranked = self.ranked(&self.scope(owner_id, user_id), &vector, top_k).await?;
        Ok(ranked.into_iter().map(|s| s.chunk.text).collect())
    }

    /// The full source text last saved for the owner.
    pub async fn get_full(
        &self,
        owner_id: &str,
        user_id: &str,
    ) -> std::result::Result<Option<String>, RetrievalError> {
        self.index
            .source_text(&self.scope(owner_id, user_id))
            .await
            .map_err(|e| RetrievalError::Query(e.to_string()))
    }

    /// Context pieces for a turn across one or more owners.
    ///
    /// Small sources (at most `small_source_tokens`) contribute their full
    /// text, one piece per paragraph, in owner order. Larger sources are
    /// ranked against `query` with a single query embedding; their chunks
    /// are merged by score and cut to `top_k`.
    pub async fn gather(
        &self,
        owner_ids: &[String],
        user_id: &str,
        query: &str,
    ) -> std::result::Result<Vec<String>, RetrievalError> {
        let mut pieces = Vec::new();
        let mut large = Vec::new();
        for owner_id in owner_ids {
            let scope = self.scope(owner_id, user_id);
            let source = self
                .index
                .source_text(&scope)
                .await
                .map_err(|e| RetrievalError::Query(e.to_string()))?;
            match source {
                None => continue,
                Some(text) if estimate_tokens(&text) <= self.settings.small_source_tokens => {
                    pieces.extend(paragraphs(&text).into_iter().map(String::from));
                }
                Some(_) => large.push(scope),
            }
        }
        if large.is_empty() || query.trim().is_empty() {
            return Ok(pieces);
        }

        let vector = self.embed_query(query).await?;
        let mut scored: Vec<(usize, ScoredChunk)> = Vec::new();
        for (position, scope) in large.iter().enumerate() {
            let ranked = self.ranked(scope, &vector, self.settings.top_k).await?;
            scored.extend(ranked.into_iter().map(|s| (position, s)));
        }
        scored.sort_by(|(pa, a), (pb, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| pa.cmp(pb))
                .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
        });
        scored.truncate(self.settings.top_k);

        debug!(
            kind = self.kind.as_str(),
            full_sources = owner_ids.len() - large.len(),
            ranked_chunks = scored.len(),
            "Gathered retrieval context"
        );
        pieces.extend(scored.into_iter().map(|(_, s)| s.chunk.text));
        Ok(pieces)
    }

    async fn embed_query(&self, query: &str) -> std::result::Result<Vec<f32>, RetrievalError> {
        self.embedder
            .embed(query)
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))
    }

    /// Ranked chunks for one scope, deduplicated by chunk index.
    async fn ranked(
        &self,
        scope: &OwnerScope,
        vector: &[f32],
        top_k: usize,
    ) -> std::result::Result<Vec<ScoredChunk>, RetrievalError> {
        let hits = self
            .index
            .query(scope, vector, top_k, self.settings.similarity_floor)
            .await
            .map_err(|e| RetrievalError::Query(e.to_string()))?;
        let mut seen = HashSet::new();
        Ok(hits
            .into_iter()
            .filter(|h| seen.insert(h.chunk.chunk_index))
            .collect())
    }
}
