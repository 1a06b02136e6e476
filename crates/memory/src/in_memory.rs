//! In-memory backends: useful for testing and ephemeral sessions.
//!
//! Besides the vector index and fact store, this module provides simple
//! in-memory stand-ins for the collaborators the surrounding application
//! normally owns: conversation history, character settings and the
//! document directory.

use async_trait::async_trait;
use chrono::Utc;
use lorekeep_core::error::StoreError;
use lorekeep_core::fact::{
    FactCandidate, FactProvenance, FactStore, FactWrite, LearnedFact, order_for_context,
};
use lorekeep_core::index::{DocumentDirectory, OwnerScope, ScopeSnapshot, ScoredChunk, VectorIndex};
use lorekeep_core::message::{ConversationTurn, HistoryReader};
use lorekeep_core::setting::{SettingRecord, SettingSource};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::vector::rank_chunks;

/// A vector index holding one immutable snapshot per scope.
///
/// Upsert swaps the scope's `Arc` under the write lock, so readers see
/// either the previous snapshot or the new one, never a mix.
pub struct InMemoryVectorIndex {
    scopes: Arc<RwLock<HashMap<OwnerScope, Arc<ScopeSnapshot>>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            scopes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn snapshot(&self, scope: &OwnerScope) -> Option<Arc<ScopeSnapshot>> {
        self.scopes.read().await.get(scope).cloned()
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn upsert(&self, scope: &OwnerScope, snapshot: ScopeSnapshot) -> Result<usize, StoreError> {
        snapshot.validate_for(scope)?;
        let count = snapshot.chunks.len();
        self.scopes
            .write()
            .await
            .insert(scope.clone(), Arc::new(snapshot));
        Ok(count)
    }

    async fn query(
        &self,
        scope: &OwnerScope,
        vector: &[f32],
        top_k: usize,
        similarity_floor: f32,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        match self.snapshot(scope).await {
            Some(snapshot) => rank_chunks(&snapshot.chunks, vector, top_k, similarity_floor),
            None => Ok(Vec::new()),
        }
    }

    async fn source_text(&self, scope: &OwnerScope) -> Result<Option<String>, StoreError> {
        Ok(self.snapshot(scope).await.map(|s| s.source_text.clone()))
    }

    async fn remove(&self, scope: &OwnerScope) -> Result<bool, StoreError> {
        Ok(self.scopes.write().await.remove(scope).is_some())
    }

    async fn chunk_count(&self, scope: &OwnerScope) -> Result<usize, StoreError> {
        Ok(self.snapshot(scope).await.map(|s| s.chunks.len()).unwrap_or(0))
    }
}

/// An in-memory fact store.
pub struct InMemoryFactStore {
    facts: Arc<RwLock<Vec<LearnedFact>>>,
}

impl InMemoryFactStore {
    pub fn new() -> Self {
        Self {
            facts: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Every stored fact including inactive ones.
    pub async fn all(&self) -> Vec<LearnedFact> {
        self.facts.read().await.clone()
    }
}

impl Default for InMemoryFactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn record_batch(
        &self,
        user_id: &str,
        character_id: Option<&str>,
        candidates: &[FactCandidate],
        confidence: f32,
        provenance: &FactProvenance,
    ) -> Result<Vec<FactWrite>, StoreError> {
        // Stage on a copy and swap it in, so a failure commits nothing.
        let mut facts = self.facts.write().await;
        let mut staged = facts.clone();
        let mut writes = Vec::with_capacity(candidates.len());
        let now = Utc::now();

        for candidate in candidates {
            if candidate.fact_key.is_empty() {
                return Err(StoreError::QueryFailed("fact_key must not be empty".into()));
            }
            let existing = staged.iter_mut().find(|f| {
                f.is_active
                    && f.user_id == user_id
                    && f.character_id.as_deref() == character_id
                    && f.fact_key == candidate.fact_key
            });
            match existing {
                Some(fact) => {
                    let previous_value =
                        std::mem::replace(&mut fact.fact_value, candidate.fact_value.clone());
                    fact.fact_type = candidate.fact_type;
                    fact.confidence = confidence;
                    fact.source_conversation_id = provenance.conversation_id.clone();
                    fact.source_message_id = provenance.message_id.clone();
                    fact.updated_at = now;
                    writes.push(FactWrite::Updated {
                        previous_value,
                        fact: fact.clone(),
                    });
                }
                None => {
                    let fact = LearnedFact {
                        id: Uuid::new_v4().to_string(),
                        user_id: user_id.to_string(),
                        character_id: character_id.map(String::from),
                        fact_type: candidate.fact_type,
                        fact_key: candidate.fact_key.clone(),
                        fact_value: candidate.fact_value.clone(),
                        confidence,
                        source_conversation_id: provenance.conversation_id.clone(),
                        source_message_id: provenance.message_id.clone(),
                        is_active: true,
                        created_at: now,
                        updated_at: now,
                    };
                    staged.push(fact.clone());
                    writes.push(FactWrite::Inserted(fact));
                }
            }
        }

        *facts = staged;
        Ok(writes)
    }

    async fn active_facts(
        &self,
        user_id: &str,
        character_id: Option<&str>,
    ) -> Result<Vec<LearnedFact>, StoreError> {
        let facts = self.facts.read().await;
        let visible = facts.iter().filter(|f| f.is_active && f.user_id == user_id);
        let (scoped, global): (Vec<LearnedFact>, Vec<LearnedFact>) = visible
            .filter(|f| f.character_id.is_none() || f.character_id.as_deref() == character_id)
            .cloned()
            .partition(|f| f.character_id.is_some());
        Ok(order_for_context(scoped, global))
    }

    async fn get(&self, id: &str) -> Result<Option<LearnedFact>, StoreError> {
        Ok(self.facts.read().await.iter().find(|f| f.id == id).cloned())
    }

    async fn update_fact(&self, id: &str, value: &str) -> Result<LearnedFact, StoreError> {
        let mut facts = self.facts.write().await;
        let fact = facts
            .iter_mut()
            .find(|f| f.id == id && f.is_active)
            .ok_or_else(|| StoreError::NotFound(format!("active fact {id}")))?;
        fact.fact_value = value.to_string();
        fact.updated_at = Utc::now();
        Ok(fact.clone())
    }

    async fn delete_fact(&self, id: &str) -> Result<bool, StoreError> {
        let mut facts = self.facts.write().await;
        match facts.iter_mut().find(|f| f.id == id && f.is_active) {
            Some(fact) => {
                fact.is_active = false;
                fact.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Append-only conversation turns keyed by session.
#[derive(Default)]
pub struct InMemoryHistory {
    sessions: RwLock<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, turn: ConversationTurn) {
        self.sessions
            .write()
            .await
            .entry(turn.session_id.clone())
            .or_default()
            .push(turn);
    }
}

#[async_trait]
impl HistoryReader for InMemoryHistory {
    async fn recent_turns(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, StoreError> {
        let sessions = self.sessions.read().await;
        let turns = sessions.get(session_id).map(Vec::as_slice).unwrap_or_default();
        let start = turns.len().saturating_sub(limit);
        Ok(turns[start..].to_vec())
    }
}

/// Setting records keyed by character.
#[derive(Default)]
pub struct InMemorySettings {
    records: RwLock<HashMap<String, SettingRecord>>,
}

impl InMemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, record: SettingRecord) {
        self.records
            .write()
            .await
            .insert(record.character_id.clone(), record);
    }
}

#[async_trait]
impl SettingSource for InMemorySettings {
    async fn setting(&self, character_id: &str) -> Result<Option<SettingRecord>, StoreError> {
        Ok(self.records.read().await.get(character_id).cloned())
    }
}

/// Documents attached to a (user, character) pair.
#[derive(Default)]
pub struct InMemoryDocuments {
    attached: RwLock<HashMap<(String, String), Vec<String>>>,
}

impl InMemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, user_id: &str, character_id: &str, document_id: &str) {
        let mut attached = self.attached.write().await;
        let docs = attached
            .entry((user_id.to_string(), character_id.to_string()))
            .or_default();
        if !docs.iter().any(|d| d == document_id) {
            docs.push(document_id.to_string());
        }
    }
}

#[async_trait]
impl DocumentDirectory for InMemoryDocuments {
    async fn documents_for(&self, user_id: &str, character_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .attached
            .read()
            .await
            .get(&(user_id.to_string(), character_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
