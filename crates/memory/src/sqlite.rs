//! SQLite persistence for the vector index and the fact store.
//!
//! Tables:
//! - `indexed_sources`: one row per owner scope with the full source text
//! - `text_chunks`: the scope's chunks with little-endian f32 embedding blobs
//! - `learned_facts`: facts; a partial unique index allows a single active
//!   row per `(user_id, character_id, fact_key)`
//!
//! Every query filters on the full `(owner_kind, owner_id, user_id)` key, so
//! scoping is part of storage access rather than a filter on results.

use crate::vector;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lorekeep_core::error::StoreError;
use lorekeep_core::fact::{
    FactCandidate, FactProvenance, FactStore, FactType, FactWrite, LearnedFact, order_for_context,
};
use lorekeep_core::index::{OwnerScope, ScopeSnapshot, ScoredChunk, TextChunk, VectorIndex};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Open (creating if needed) a SQLite pool.
///
/// Pass `"sqlite::memory:"` for an in-process ephemeral database (useful for tests).
pub async fn open_pool(path: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(path)
        .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .pragma("foreign_keys", "ON");

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

    info!("SQLite store opened at {path}");
    Ok(pool)
}

/// Serialize an embedding vector to bytes.
fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn column<'r, T>(row: &'r sqlx::sqlite::SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

/// A SQLite-backed vector index.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
    /// Serialises upserts per scope; different scopes proceed in parallel.
    scope_locks: Mutex<HashMap<OwnerScope, Arc<Mutex<()>>>>,
}

impl SqliteVectorIndex {
    /// Open the index at `path`, creating tables as needed.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        Self::from_pool(open_pool(path).await?).await
    }

    /// Create from an existing pool (shared with the fact store).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let index = Self {
            pool,
            scope_locks: Mutex::new(HashMap::new()),
        };
        index.run_migrations().await?;
        Ok(index)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS indexed_sources (
                owner_kind   TEXT NOT NULL,
                owner_id     TEXT NOT NULL,
                user_id      TEXT NOT NULL,
                source_text  TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                PRIMARY KEY (owner_kind, owner_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("indexed_sources table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS text_chunks (
                id           TEXT PRIMARY KEY,
                owner_kind   TEXT NOT NULL,
                owner_id     TEXT NOT NULL,
                user_id      TEXT NOT NULL,
                chunk_index  INTEGER NOT NULL,
                text         TEXT NOT NULL,
                embedding    BLOB NOT NULL,
                created_at   TEXT NOT NULL,
                UNIQUE (owner_kind, owner_id, user_id, chunk_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("text_chunks table: {e}")))?;

        debug!("Vector index migrations complete");
        Ok(())
    }

    async fn scope_lock(&self, scope: &OwnerScope) -> Arc<Mutex<()>> {
        self.scope_locks
            .lock()
            .await
            .entry(scope.clone())
            .or_default()
            .clone()
    }

    /// Drop the scope's lock entry once no writer holds or awaits it.
    ///
    /// Clones are only handed out under the map lock, so a strong count of
    /// one means the map owns the last reference.
    async fn release_scope_lock(&self, scope: &OwnerScope) {
        let mut locks = self.scope_locks.lock().await;
        if locks.get(scope).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(scope);
        }
    }

    /// Run `write` while holding the scope's lock, then prune the entry.
    async fn with_scope_lock<T, F>(&self, scope: &OwnerScope, write: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        let lock = self.scope_lock(scope).await;
        let result = {
            let _guard = lock.lock().await;
            write.await
        };
        drop(lock);
        self.release_scope_lock(scope).await;
        result
    }

    fn row_to_chunk(scope: &OwnerScope, row: &sqlx::sqlite::SqliteRow) -> Result<TextChunk, StoreError> {
        let chunk_index: i64 = column(row, "chunk_index")?;
        let blob: Vec<u8> = column(row, "embedding")?;
        let created_at: String = column(row, "created_at")?;
        Ok(TextChunk {
            id: column(row, "id")?,
            scope: scope.clone(),
            chunk_index: chunk_index as usize,
            text: column(row, "text")?,
            embedding: blob_to_embedding(&blob),
            created_at: parse_timestamp(&created_at),
        })
    }

    async fn write_snapshot(&self, scope: &OwnerScope, snapshot: &ScopeSnapshot) -> Result<usize, StoreError> {
        // Any failure inside the transaction rolls it back; the scope keeps
        // its previous contents and the caller must retry the full save.
        let interrupted = |stage: &str, e: sqlx::Error| {
            StoreError::Consistency(format!("upsert of {scope} interrupted at {stage}: {e}"))
        };

        let mut tx = self.pool.begin().await.map_err(|e| interrupted("begin", e))?;

        sqlx::query("DELETE FROM text_chunks WHERE owner_kind = ?1 AND owner_id = ?2 AND user_id = ?3")
            .bind(scope.kind.as_str())
            .bind(&scope.owner_id)
            .bind(&scope.user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| interrupted("delete", e))?;

        sqlx::query(
            r#"
            INSERT INTO indexed_sources (owner_kind, owner_id, user_id, source_text, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(owner_kind, owner_id, user_id) DO UPDATE SET
                source_text = excluded.source_text,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(scope.kind.as_str())
        .bind(&scope.owner_id)
        .bind(&scope.user_id)
        .bind(&snapshot.source_text)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| interrupted("source", e))?;

        for chunk in &snapshot.chunks {
            sqlx::query(
                r#"
                INSERT INTO text_chunks (id, owner_kind, owner_id, user_id, chunk_index, text, embedding, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(&chunk.id)
            .bind(scope.kind.as_str())
            .bind(&scope.owner_id)
            .bind(&scope.user_id)
            .bind(chunk.chunk_index as i64)
            .bind(&chunk.text)
            .bind(embedding_to_blob(&chunk.embedding))
            .bind(chunk.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| interrupted("insert", e))?;
        }

        tx.commit().await.map_err(|e| interrupted("commit", e))?;

        debug!(scope = %scope, chunks = snapshot.chunks.len(), "Upserted scope");
        Ok(snapshot.chunks.len())
    }

    async fn delete_scope(&self, scope: &OwnerScope) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("begin: {e}")))?;

        sqlx::query("DELETE FROM text_chunks WHERE owner_kind = ?1 AND owner_id = ?2 AND user_id = ?3")
            .bind(scope.kind.as_str())
            .bind(&scope.owner_id)
            .bind(&scope.user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE chunks failed: {e}")))?;

        let result = sqlx::query(
            "DELETE FROM indexed_sources WHERE owner_kind = ?1 AND owner_id = ?2 AND user_id = ?3",
        )
        .bind(scope.kind.as_str())
        .bind(&scope.owner_id)
        .bind(&scope.user_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("DELETE source failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("commit: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert(&self, scope: &OwnerScope, snapshot: ScopeSnapshot) -> Result<usize, StoreError> {
        snapshot.validate_for(scope)?;
        self.with_scope_lock(scope, self.write_snapshot(scope, &snapshot)).await
    }

    async fn query(
        &self,
        scope: &OwnerScope,
        vector: &[f32],
        top_k: usize,
        similarity_floor: f32,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, chunk_index, text, embedding, created_at
            FROM text_chunks
            WHERE owner_kind = ?1 AND owner_id = ?2 AND user_id = ?3
            ORDER BY chunk_index
            "#,
        )
        .bind(scope.kind.as_str())
        .bind(&scope.owner_id)
        .bind(&scope.user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("chunk scan: {e}")))?;

        let chunks = rows
            .iter()
            .map(|row| Self::row_to_chunk(scope, row))
            .collect::<Result<Vec<_>, _>>()?;

        vector::rank_chunks(&chunks, vector, top_k, similarity_floor)
    }

    async fn source_text(&self, scope: &OwnerScope) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT source_text FROM indexed_sources WHERE owner_kind = ?1 AND owner_id = ?2 AND user_id = ?3",
        )
        .bind(scope.kind.as_str())
        .bind(&scope.owner_id)
        .bind(&scope.user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("source lookup: {e}")))?;

        row.map(|r| column(&r, "source_text")).transpose()
    }

    async fn remove(&self, scope: &OwnerScope) -> Result<bool, StoreError> {
        self.with_scope_lock(scope, self.delete_scope(scope)).await
    }

    async fn chunk_count(&self, scope: &OwnerScope) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM text_chunks WHERE owner_kind = ?1 AND owner_id = ?2 AND user_id = ?3",
        )
        .bind(scope.kind.as_str())
        .bind(&scope.owner_id)
        .bind(&scope.user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("COUNT failed: {e}")))?;

        let count: i64 = column(&row, "cnt")?;
        Ok(count as usize)
    }
}

/// A SQLite-backed fact store.
///
/// Global facts are stored with an empty `character_id` so the unique
/// index covers them too (SQLite treats NULLs as distinct).
pub struct SqliteFactStore {
    pool: SqlitePool,
    /// Serialises batch writes so the active-key lookup and the insert that
    /// follows it see the same rows.
    batch_lock: Mutex<()>,
}

impl SqliteFactStore {
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        Self::from_pool(open_pool(path).await?).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            batch_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS learned_facts (
                id                      TEXT PRIMARY KEY,
                user_id                 TEXT NOT NULL,
                character_id            TEXT NOT NULL DEFAULT '',
                fact_type               TEXT NOT NULL,
                fact_key                TEXT NOT NULL,
                fact_value              TEXT NOT NULL,
                confidence              REAL NOT NULL,
                source_conversation_id  TEXT,
                source_message_id       TEXT,
                is_active               INTEGER NOT NULL DEFAULT 1,
                created_at              TEXT NOT NULL,
                updated_at              TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("learned_facts table: {e}")))?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_facts_active_key
            ON learned_facts(user_id, character_id, fact_key)
            WHERE is_active = 1
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("active key index: {e}")))?;

        debug!("Fact store migrations complete");
        Ok(())
    }

    fn row_to_fact(row: &sqlx::sqlite::SqliteRow) -> Result<LearnedFact, StoreError> {
        let character_id: String = column(row, "character_id")?;
        let fact_type: String = column(row, "fact_type")?;
        let confidence: f64 = column(row, "confidence")?;
        let is_active: i64 = column(row, "is_active")?;
        let created_at: String = column(row, "created_at")?;
        let updated_at: String = column(row, "updated_at")?;

        Ok(LearnedFact {
            id: column(row, "id")?,
            user_id: column(row, "user_id")?,
            character_id: (!character_id.is_empty()).then_some(character_id),
            fact_type: FactType::parse(&fact_type).ok_or_else(|| {
                StoreError::QueryFailed(format!("unknown fact_type '{fact_type}' in store"))
            })?,
            fact_key: column(row, "fact_key")?,
            fact_value: column(row, "fact_value")?,
            confidence: confidence as f32,
            source_conversation_id: column(row, "source_conversation_id")?,
            source_message_id: column(row, "source_message_id")?,
            is_active: is_active != 0,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    async fn active_for(&self, user_id: &str, character_key: &str) -> Result<Vec<LearnedFact>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM learned_facts WHERE user_id = ?1 AND character_id = ?2 AND is_active = 1",
        )
        .bind(user_id)
        .bind(character_key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("active facts: {e}")))?;

        rows.iter().map(Self::row_to_fact).collect()
    }
}

#[async_trait]
impl FactStore for SqliteFactStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn record_batch(
        &self,
        user_id: &str,
        character_id: Option<&str>,
        candidates: &[FactCandidate],
        confidence: f32,
        provenance: &FactProvenance,
    ) -> Result<Vec<FactWrite>, StoreError> {
        if candidates.iter().any(|c| c.fact_key.is_empty()) {
            return Err(StoreError::QueryFailed("fact_key must not be empty".into()));
        }

        let character_key = character_id.unwrap_or_default();
        let now = Utc::now();
        let mut writes = Vec::with_capacity(candidates.len());

        let _batch = self.batch_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("begin: {e}")))?;

        for candidate in candidates {
            let existing = sqlx::query(
                r#"
                SELECT * FROM learned_facts
                WHERE user_id = ?1 AND character_id = ?2 AND fact_key = ?3 AND is_active = 1
                "#,
            )
            .bind(user_id)
            .bind(character_key)
            .bind(&candidate.fact_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("fact lookup: {e}")))?;

            match existing {
                Some(row) => {
                    let mut fact = Self::row_to_fact(&row)?;
                    let previous_value =
                        std::mem::replace(&mut fact.fact_value, candidate.fact_value.clone());
                    fact.fact_type = candidate.fact_type;
                    fact.confidence = confidence;
                    fact.source_conversation_id = provenance.conversation_id.clone();
                    fact.source_message_id = provenance.message_id.clone();
                    fact.updated_at = now;

                    sqlx::query(
                        r#"
                        UPDATE learned_facts SET
                            fact_type = ?2, fact_value = ?3, confidence = ?4,
                            source_conversation_id = ?5, source_message_id = ?6, updated_at = ?7
                        WHERE id = ?1
                        "#,
                    )
                    .bind(&fact.id)
                    .bind(fact.fact_type.as_str())
                    .bind(&fact.fact_value)
                    .bind(f64::from(confidence))
                    .bind(&fact.source_conversation_id)
                    .bind(&fact.source_message_id)
                    .bind(now.to_rfc3339())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Storage(format!("UPDATE fact failed: {e}")))?;

                    writes.push(FactWrite::Updated {
                        previous_value,
                        fact,
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

                    sqlx::query(
                        r#"
                        INSERT INTO learned_facts (
                            id, user_id, character_id, fact_type, fact_key, fact_value, confidence,
                            source_conversation_id, source_message_id, is_active, created_at, updated_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?10)
                        "#,
                    )
                    .bind(&fact.id)
                    .bind(user_id)
                    .bind(character_key)
                    .bind(fact.fact_type.as_str())
                    .bind(&fact.fact_key)
                    .bind(&fact.fact_value)
                    .bind(f64::from(confidence))
                    .bind(&fact.source_conversation_id)
                    .bind(&fact.source_message_id)
                    .bind(now.to_rfc3339())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Storage(format!("INSERT fact failed: {e}")))?;

                    writes.push(FactWrite::Inserted(fact));
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("commit: {e}")))?;

        debug!(user_id, writes = writes.len(), "Recorded fact batch");
        Ok(writes)
    }

    async fn active_facts(
        &self,
        user_id: &str,
        character_id: Option<&str>,
    ) -> Result<Vec<LearnedFact>, StoreError> {
        let global = self.active_for(user_id, "").await?;
        let scoped = match character_id {
            Some(id) if !id.is_empty() => self.active_for(user_id, id).await?,
            _ => Vec::new(),
        };
        Ok(order_for_context(scoped, global))
    }

    async fn get(&self, id: &str) -> Result<Option<LearnedFact>, StoreError> {
        let row = sqlx::query("SELECT * FROM learned_facts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET fact failed: {e}")))?;

        row.as_ref().map(Self::row_to_fact).transpose()
    }

    async fn update_fact(&self, id: &str, value: &str) -> Result<LearnedFact, StoreError> {
        let result = sqlx::query(
            "UPDATE learned_facts SET fact_value = ?2, updated_at = ?3 WHERE id = ?1 AND is_active = 1",
        )
        .bind(id)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE fact failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("active fact {id}")));
        }
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("fact {id}")))
    }

    async fn delete_fact(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE learned_facts SET is_active = 0, updated_at = ?2 WHERE id = ?1 AND is_active = 1",
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("deactivate fact failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}
