//! Vector index trait: owner-scoped storage of embedded text chunks.
//!
//! Every chunk belongs to exactly one [`OwnerScope`]. Scopes are part of
//! the storage key in every implementation: a query for one scope can never
//! return another scope's chunks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::StoreError;

/// Which kind of source a scope holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    /// Free-form character backstory, owned by a character.
    Backstory,
    /// Parsed text of an uploaded document, owned by a document.
    Document,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Backstory => "backstory",
            OwnerKind::Document => "document",
        }
    }
}

/// The isolation unit for chunks: (kind, character-or-document id, user id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerScope {
    pub kind: OwnerKind,
    pub owner_id: String,
    pub user_id: String,
}

impl OwnerScope {
    pub fn new(kind: OwnerKind, owner_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            kind,
            owner_id: owner_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn backstory(character_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(OwnerKind::Backstory, character_id, user_id)
    }

    pub fn document(document_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(OwnerKind::Document, document_id, user_id)
    }
}

impl std::fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.kind.as_str(), self.owner_id, self.user_id)
    }
}

/// A bounded slice of a longer source, embedded independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub id: String,
    pub scope: OwnerScope,
    /// Position within the source; unique within the scope.
    pub chunk_index: usize,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// A chunk returned by a query together with its cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: TextChunk,
    pub score: f32,
}

/// The complete replacement state of one scope.
///
/// Upserting a snapshot replaces everything previously stored for the scope
/// in one step: readers observe either the old set or the new one.
#[derive(Debug, Clone, Default)]
pub struct ScopeSnapshot {
    /// The full source text the chunks were cut from.
    pub source_text: String,
    pub chunks: Vec<TextChunk>,
}

impl ScopeSnapshot {
    /// Check that every chunk belongs to `scope`, chunk indexes are unique
    /// and all embeddings share one dimension.
    pub fn validate_for(&self, scope: &OwnerScope) -> std::result::Result<(), StoreError> {
        let mut seen = HashSet::new();
        let dims = self.chunks.first().map(|c| c.embedding.len());
        for chunk in &self.chunks {
            if &chunk.scope != scope {
                return Err(StoreError::Consistency(format!(
                    "chunk {} belongs to {}, not {}",
                    chunk.chunk_index, chunk.scope, scope
                )));
            }
            if !seen.insert(chunk.chunk_index) {
                return Err(StoreError::Consistency(format!(
                    "duplicate chunk_index {} in {}",
                    chunk.chunk_index, scope
                )));
            }
            if Some(chunk.embedding.len()) != dims || chunk.embedding.is_empty() {
                return Err(StoreError::Consistency(format!(
                    "chunk {} in {} has an inconsistent embedding",
                    chunk.chunk_index, scope
                )));
            }
        }
        Ok(())
    }
}

/// The core VectorIndex trait.
///
/// Implementations: in-memory (for tests and ephemeral use), SQLite.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Atomically replace all chunks of `scope`. Returns the number stored.
    async fn upsert(
        &self,
        scope: &OwnerScope,
        snapshot: ScopeSnapshot,
    ) -> std::result::Result<usize, StoreError>;

    /// Rank the scope's chunks by similarity to `vector`, descending.
    /// Chunks scoring below `similarity_floor` are excluded. An unknown or
    /// empty scope yields an empty list.
    async fn query(
        &self,
        scope: &OwnerScope,
        vector: &[f32],
        top_k: usize,
        similarity_floor: f32,
    ) -> std::result::Result<Vec<ScoredChunk>, StoreError>;

    /// The full source text last saved for the scope.
    async fn source_text(&self, scope: &OwnerScope) -> std::result::Result<Option<String>, StoreError>;

    /// Drop everything stored for the scope.
    async fn remove(&self, scope: &OwnerScope) -> std::result::Result<bool, StoreError>;

    /// Number of chunks stored for the scope.
    async fn chunk_count(&self, scope: &OwnerScope) -> std::result::Result<usize, StoreError>;
}

/// Lists the documents a user attached to a character.
#[async_trait]
pub trait DocumentDirectory: Send + Sync {
    async fn documents_for(
        &self,
        user_id: &str,
        character_id: &str,
    ) -> std::result::Result<Vec<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(scope: &OwnerScope, index: usize, dims: usize) -> TextChunk {
        TextChunk {
            id: format!("c{index}"),
            scope: scope.clone(),
            chunk_index: index,
            text: format!("chunk {index}"),
            embedding: vec![0.5; dims],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn scope_display() {
        let scope = OwnerScope::backstory("char_1", "user_9");
        assert_eq!(scope.to_string(), "backstory:char_1@user_9");
    }

    #[test]
    fn snapshot_accepts_consistent_chunks() {
        let scope = OwnerScope::document("doc", "u");
        let snapshot = ScopeSnapshot {
            source_text: "text".into(),
            chunks: vec![chunk(&scope, 0, 4), chunk(&scope, 1, 4)],
        };
        assert!(snapshot.validate_for(&scope).is_ok());
    }

    #[test]
    fn snapshot_rejects_foreign_scope() {
        let scope = OwnerScope::document("doc", "u");
        let other = OwnerScope::document("doc", "someone_else");
        let snapshot = ScopeSnapshot {
            source_text: String::new(),
            chunks: vec![chunk(&other, 0, 4)],
        };
        assert!(matches!(
            snapshot.validate_for(&scope),
            Err(StoreError::Consistency(_))
        ));
    }

    #[test]
    fn snapshot_rejects_duplicate_index() {
        let scope = OwnerScope::backstory("c", "u");
        let snapshot = ScopeSnapshot {
            source_text: String::new(),
            chunks: vec![chunk(&scope, 0, 4), chunk(&scope, 0, 4)],
        };
        assert!(snapshot.validate_for(&scope).is_err());
    }

    #[test]
    fn snapshot_rejects_mixed_dimensions() {
        let scope = OwnerScope::backstory("c", "u");
        let snapshot = ScopeSnapshot {
            source_text: String::new(),
            chunks: vec![chunk(&scope, 0, 4), chunk(&scope, 1, 8)],
        };
        assert!(snapshot.validate_for(&scope).is_err());
    }
}
