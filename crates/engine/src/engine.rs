//! The context engine: the two entry points the surrounding application
//! calls around every model invocation.
//!
//! - [`ContextEngine::build_context`] runs right before the model call. The
//!   five sources are read concurrently, each under its own deadline; a
//!   source that times out or fails contributes nothing and its share of
//!   the budget goes to the others.
//! - [`ContextEngine::on_exchange_complete`] runs after the reply. It queues
//!   the exchange for background fact extraction and returns immediately.

use crate::context::{AssembledContext, ContextAssembler, ContextSource, DegradedSource, SourceMaterial};
use crate::extraction::{ExtractionJob, ExtractionQueue, FactExtractor};
use crate::retrieval::Retriever;
use lorekeep_config::{EmbeddingConfig, EngineConfig, RetrievalConfig};
use lorekeep_core::embedding::Embedder;
use lorekeep_core::error::{EmbeddingError, Error, Result, RetrievalError, StoreError};
use lorekeep_core::fact::{FactCandidate, FactProvenance, FactStore, FactWrite, LearnedFact};
use lorekeep_core::index::{DocumentDirectory, VectorIndex};
use lorekeep_core::message::HistoryReader;
use lorekeep_core::provider::Provider;
use lorekeep_core::setting::SettingSource;
use lorekeep_memory::{
    open_pool, shared_embedder, BoundedEmbedder, Chunker, HashEmbedder, InMemoryFactStore, InMemoryVectorIndex,
    ProviderEmbedder, SqliteFactStore, SqliteVectorIndex,
};
use lorekeep_providers::OpenAiCompatProvider;
use lorekeep_security::Sanitizer;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Confidence of a fact the user set directly.
const USER_STATED_CONFIDENCE: f32 = 1.0;

/// Storage and model collaborators the engine runs on.
pub struct Collaborators {
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub facts: Arc<dyn FactStore>,
    pub history: Arc<dyn HistoryReader>,
    pub settings: Arc<dyn SettingSource>,
    pub documents: Arc<dyn DocumentDirectory>,
    /// Model used for fact extraction; `None` disables extraction.
    pub extraction_model: Option<Arc<dyn Provider>>,
}

/// Sources owned by the surrounding application.
pub struct ExternalSources {
    pub history: Arc<dyn HistoryReader>,
    pub settings: Arc<dyn SettingSource>,
    pub documents: Arc<dyn DocumentDirectory>,
}

/// Orchestrates retrieval, budgeting, sanitizing and extraction.
pub struct ContextEngine {
    backstory: Retriever,
    documents: Retriever,
    facts: Arc<dyn FactStore>,
    history: Arc<dyn HistoryReader>,
    settings: Arc<dyn SettingSource>,
    directory: Arc<dyn DocumentDirectory>,
    assembler: ContextAssembler,
    extraction: Option<ExtractionQueue>,
    retrieval: RetrievalConfig,
    default_ceiling: usize,
}

impl ContextEngine {
    /// Create an engine over explicit collaborators.
    ///
    /// Starts the extraction worker when a model is supplied and extraction
    /// is enabled, so it must then be called within a Tokio runtime.
    pub fn new(config: &EngineConfig, parts: Collaborators) -> Result<Self> {
        let chunker = Chunker::new(config.chunking.max_tokens, config.chunking.overlap_tokens)?
            .with_min_chunk_tokens(config.chunking.min_chunk_tokens);

        let extraction = match (config.extraction.enabled, parts.extraction_model) {
            (true, Some(provider)) => {
                let extractor = FactExtractor::new(provider, parts.facts.clone(), &config.extraction);
                Some(ExtractionQueue::spawn(
                    Arc::new(extractor),
                    config.extraction.queue_capacity,
                ))
            }
            (true, None) => {
                info!("No extraction model configured, fact extraction disabled");
                None
            }
            (false, _) => None,
        };

        Ok(Self {
            backstory: Retriever::backstory(
                parts.index.clone(),
                parts.embedder.clone(),
                chunker,
                config.retrieval.clone(),
            ),
            documents: Retriever::documents(parts.index, parts.embedder, chunker, config.retrieval.clone()),
            facts: parts.facts,
            history: parts.history,
            settings: parts.settings,
            directory: parts.documents,
            assembler: ContextAssembler::new(Arc::new(Sanitizer::new())),
            extraction,
            retrieval: config.retrieval.clone(),
            default_ceiling: config.budget.default_ceiling,
        })
    }

    /// Create an engine from configuration: the shared embedder, the
    /// configured storage backend and, when a key is available, the
    /// extraction model.
    pub async fn from_config(config: &EngineConfig, external: ExternalSources) -> Result<Self> {
        let embedding = config.embedding.clone();
        let embedder = shared_embedder(move || async move { build_embedder(&embedding) }).await?;
        let (index, facts) = open_storage(config).await?;

        let extraction_model: Option<Arc<dyn Provider>> = if config.extraction.enabled {
            match OpenAiCompatProvider::from_extraction_config(&config.extraction) {
                Ok(provider) => Some(Arc::new(provider)),
                Err(e) => {
                    warn!(error = %e, "Fact extraction disabled");
                    None
                }
            }
        } else {
            None
        };

        Self::new(
            config,
            Collaborators {
                index,
                embedder,
                facts,
                history: external.history,
                settings: external.settings,
                documents: external.documents,
                extraction_model,
            },
        )
    }

    /// Replace the sanitizer, e.g. to share an audit log.
    pub fn with_sanitizer(mut self, sanitizer: Arc<Sanitizer>) -> Self {
        self.assembler = ContextAssembler::new(sanitizer);
        self
    }

    pub fn sanitizer(&self) -> &Arc<Sanitizer> {
        self.assembler.sanitizer()
    }

    /// The configured ceiling for callers without their own.
    pub fn default_ceiling(&self) -> usize {
        self.default_ceiling
    }

    pub fn extraction_enabled(&self) -> bool {
        self.extraction.is_some()
    }

    // ── Entry points ──────────────────────────────────────────────────────

    /// Assemble the context for the next model call.
    ///
    /// Never fails because of a single source: a source that errors or
    /// misses its deadline is reported in `degraded` and left out. Only
    /// missing identifiers are rejected.
    pub async fn build_context(
        &self,
        user_id: &str,
        character_id: &str,
        session_id: &str,
        current_message: &str,
        token_ceiling: usize,
    ) -> Result<AssembledContext> {
        if user_id.trim().is_empty() || character_id.trim().is_empty() {
            return Err(Error::Input("user_id and character_id are required".into()));
        }

        let limit = Duration::from_millis(self.retrieval.per_source_timeout_ms);
        let (setting, facts, backstory, documents, history) = tokio::join!(
            bounded(ContextSource::Setting, limit, async {
                Ok::<_, Error>(self.settings.setting(character_id).await?)
            }),
            bounded(ContextSource::Facts, limit, async {
                Ok::<_, Error>(self.facts.active_facts(user_id, Some(character_id)).await?)
            }),
            bounded(ContextSource::Backstory, limit, async {
                Ok::<_, Error>(self
                    .backstory
                    .gather(&[character_id.to_string()], user_id, current_message)
                    .await?)
            }),
            bounded(ContextSource::Documents, limit, async {
                let document_ids = self.directory.documents_for(user_id, character_id).await?;
                Ok::<_, Error>(self.documents.gather(&document_ids, user_id, current_message).await?)
            }),
            bounded(ContextSource::History, limit, async {
                Ok::<_, Error>(self.history.recent_turns(session_id, self.retrieval.history_turns).await?)
            }),
        );

        let mut degraded = Vec::new();
        let material = SourceMaterial {
            setting: settle(setting, &mut degraded).flatten(),
            facts: settle(facts, &mut degraded).unwrap_or_default(),
            backstory: settle(backstory, &mut degraded).unwrap_or_default(),
            documents: settle(documents, &mut degraded).unwrap_or_default(),
            history: settle(history, &mut degraded).unwrap_or_default(),
        };

        let mut assembled = self.assembler.assemble(&material, current_message, token_ceiling);
        assembled.degraded = degraded;
        debug!(
            user_id,
            character_id,
            ceiling = token_ceiling,
            used = assembled.total_tokens(),
            turns = assembled.turns.len(),
            degraded = assembled.degraded.len(),
            "Context assembled"
        );
        Ok(assembled)
    }

    /// Queue a finished exchange for fact extraction and return at once.
    ///
    /// Returns false when extraction is disabled or the queue is full.
    pub fn on_exchange_complete(
        &self,
        user_id: &str,
        character_id: &str,
        session_id: &str,
        user_message: &str,
        assistant_reply: &str,
    ) -> bool {
        let Some(queue) = &self.extraction else {
            return false;
        };
        queue.submit(ExtractionJob {
            user_id: user_id.to_string(),
            character_id: Some(character_id.to_string()),
            session_id: Some(session_id.to_string()),
            user_message: user_message.to_string(),
            assistant_reply: assistant_reply.to_string(),
        })
    }

    /// Stop the extraction worker, waiting up to `grace` for queued jobs.
    pub async fn shutdown(self, grace: Duration) -> bool {
        match self.extraction {
            Some(queue) => queue.shutdown(grace).await,
            None => true,
        }
    }

    // ── Source maintenance ────────────────────────────────────────────────

    /// Re-index a character's backstory after an edit.
    pub async fn save_backstory(&self, character_id: &str, user_id: &str, text: &str) -> Result<usize> {
        self.backstory.save(character_id, user_id, text).await
    }

    pub async fn remove_backstory(&self, character_id: &str, user_id: &str) -> Result<bool> {
        self.backstory.remove(character_id, user_id).await
    }

    /// Re-index a parsed document after upload or edit.
    pub async fn save_document(&self, document_id: &str, user_id: &str, text: &str) -> Result<usize> {
        self.documents.save(document_id, user_id, text).await
    }

    pub async fn remove_document(&self, document_id: &str, user_id: &str) -> Result<bool> {
        self.documents.remove(document_id, user_id).await
    }

    pub fn backstory_retriever(&self) -> &Retriever {
        &self.backstory
    }

    pub fn document_retriever(&self) -> &Retriever {
        &self.documents
    }

    // ── Facts ─────────────────────────────────────────────────────────────

    /// Active facts: character-scoped first, then global.
    pub async fn get_user_facts(&self, user_id: &str, character_id: Option<&str>) -> Result<Vec<LearnedFact>> {
        Ok(self.facts.active_facts(user_id, character_id).await?)
    }

    /// Record a fact the user stated directly, bypassing extraction.
    pub async fn remember_fact(
        &self,
        user_id: &str,
        character_id: Option<&str>,
        candidate: FactCandidate,
    ) -> Result<FactWrite> {
        let mut writes = self
            .facts
            .record_batch(
                user_id,
                character_id,
                std::slice::from_ref(&candidate),
                USER_STATED_CONFIDENCE,
                &FactProvenance::default(),
            )
            .await?;
        writes
            .pop()
            .ok_or_else(|| Error::Store(StoreError::Consistency(format!("no write for {}", candidate.fact_key))))
    }

    /// Direct user correction of a fact's value.
    pub async fn update_fact(&self, id: &str, value: &str) -> Result<LearnedFact> {
        if value.trim().is_empty() {
            return Err(Error::Input("fact value must not be empty".into()));
        }
        Ok(self.facts.update_fact(id, value.trim()).await?)
    }

    /// Direct user deletion of a fact.
    pub async fn delete_fact(&self, id: &str) -> Result<bool> {
        Ok(self.facts.delete_fact(id).await?)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

type Settled<T> = (Option<T>, Option<DegradedSource>);

/// Run one source read under a deadline, turning failure into a note.
async fn bounded<T, F>(source: ContextSource, limit: Duration, work: F) -> Settled<T>
where
    F: Future<Output = Result<T>>,
{
    let reason = match tokio::time::timeout(limit, work).await {
        Ok(Ok(value)) => return (Some(value), None),
        Ok(Err(e)) => e.to_string(),
        Err(_) => RetrievalError::Timeout {
            source_name: source.to_string(),
            after_ms: limit.as_millis() as u64,
        }
        .to_string(),
    };
    warn!(source = %source, %reason, "Context source unavailable, continuing without it");
    (None, Some(DegradedSource { source, reason }))
}

fn settle<T>(settled: Settled<T>, degraded: &mut Vec<DegradedSource>) -> Option<T> {
    let (value, note) = settled;
    degraded.extend(note);
    value
}

/// The embedder named by configuration, capped at `max_concurrency`.
fn build_embedder(config: &EmbeddingConfig) -> std::result::Result<Arc<dyn Embedder>, EmbeddingError> {
    let inner: Arc<dyn Embedder> = match config.provider.as_str() {
        "hash" => Arc::new(HashEmbedder::new(config.dimensions)),
        _ => {
            let provider = OpenAiCompatProvider::from_embedding_config(config)
                .map_err(|e| EmbeddingError::Inference(e.to_string()))?;
            Arc::new(ProviderEmbedder::new(Arc::new(provider), config.model.clone(), config.dimensions))
        }
    };
    Ok(Arc::new(BoundedEmbedder::new(inner, config.max_concurrency)))
}

async fn open_storage(config: &EngineConfig) -> Result<(Arc<dyn VectorIndex>, Arc<dyn FactStore>)> {
    match config.storage.backend.as_str() {
        "memory" => Ok((Arc::new(InMemoryVectorIndex::new()), Arc::new(InMemoryFactStore::new()))),
        "sqlite" => {
            let path = config.storage.database_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Storage(format!("{}: {e}", parent.display())))?;
            }
            let pool = open_pool(&path.to_string_lossy()).await?;
            let index = SqliteVectorIndex::from_pool(pool.clone()).await?;
            let facts = SqliteFactStore::from_pool(pool).await?;
            Ok((Arc::new(index), Arc::new(facts)))
        }
        other => Err(Error::Config {
            message: format!("unknown storage backend '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedProvider;
    use lorekeep_core::fact::FactType;
    use lorekeep_core::message::ConversationTurn;
    use lorekeep_core::setting::SettingRecord;
    use lorekeep_memory::{InMemoryDocuments, InMemoryHistory, InMemorySettings};

    struct SlowHistory;

    #[async_trait::async_trait]
    impl HistoryReader for SlowHistory {
        async fn recent_turns(
            &self,
            session_id: &str,
            _limit: usize,
        ) -> std::result::Result<Vec<ConversationTurn>, StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![ConversationTurn::user(session_id, "too late")])
        }
    }

    struct BrokenSettings;

    #[async_trait::async_trait]
    impl SettingSource for BrokenSettings {
        async fn setting(&self, _character_id: &str) -> std::result::Result<Option<SettingRecord>, StoreError> {
            Err(StoreError::Storage("settings table missing".into()))
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.chunking.max_tokens = 40;
        config.chunking.overlap_tokens = 8;
        config
    }

    fn parts(provider: Option<Arc<dyn Provider>>) -> Collaborators {
        Collaborators {
            index: Arc::new(InMemoryVectorIndex::new()),
            embedder: Arc::new(HashEmbedder::new(128)),
            facts: Arc::new(InMemoryFactStore::new()),
            history: Arc::new(InMemoryHistory::new()),
            settings: Arc::new(InMemorySettings::new()),
            documents: Arc::new(InMemoryDocuments::new()),
            extraction_model: provider,
        }
    }

    #[tokio::test]
    async fn missing_ids_are_input_errors() {
        let engine = ContextEngine::new(&config(), parts(None)).unwrap();
        assert!(matches!(
            engine.build_context("", "mira", "s1", "hi", 1000).await,
            Err(Error::Input(_))
        ));
    }

    #[tokio::test]
    async fn backstory_reaches_the_prompt() {
        let engine = ContextEngine::new(&config(), parts(None)).unwrap();
        engine
            .save_backstory("mira", "u1", "Mira keeps the north lighthouse.")
            .await
            .unwrap();
        let ctx = engine.build_context("u1", "mira", "s1", "Who are you?", 2048).await.unwrap();
        assert!(ctx.prompt.contains("Mira keeps the north lighthouse."));
        assert!(ctx.degraded.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out_to_empty() {
        let mut p = parts(None);
        p.history = Arc::new(SlowHistory);
        let engine = ContextEngine::new(&config(), p).unwrap();
        engine.save_backstory("mira", "u1", "Mira keeps the lighthouse.").await.unwrap();

        let ctx = engine.build_context("u1", "mira", "s1", "hello", 2048).await.unwrap();
        assert_eq!(ctx.degraded.len(), 1);
        assert_eq!(ctx.degraded[0].source, ContextSource::History);
        assert!(ctx.degraded[0].reason.contains("750ms"));
        assert!(ctx.turns.is_empty());
        assert!(ctx.prompt.contains("Mira keeps the lighthouse."));
    }

    #[tokio::test]
    async fn failing_source_degrades_instead_of_failing() {
        let mut p = parts(None);
        p.settings = Arc::new(BrokenSettings);
        let engine = ContextEngine::new(&config(), p).unwrap();

        let ctx = engine.build_context("u1", "mira", "s1", "hello", 2048).await.unwrap();
        assert_eq!(ctx.degraded.len(), 1);
        assert_eq!(ctx.degraded[0].source, ContextSource::Setting);
        assert!(ctx.degraded[0].reason.contains("settings table missing"));
    }

    #[tokio::test]
    async fn exchange_completion_feeds_the_next_context() {
        let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new(vec![
            r#"[{"fact_type": "name", "fact_key": "user_name", "fact_value": "Jason"}]"#,
        ]));
        let p = parts(Some(provider));
        let facts = p.facts.clone();
        let engine = ContextEngine::new(&config(), p).unwrap();
        assert!(engine.extraction_enabled());

        assert!(engine.on_exchange_complete("u1", "mira", "s1", "My name is Jason, hello!", "Hi Jason."));
        // wait for the worker by polling the store
        for _ in 0..100 {
            if !facts.active_facts("u1", Some("mira")).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let ctx = engine.build_context("u1", "mira", "s1", "What's my name?", 2048).await.unwrap();
        assert!(ctx.prompt.contains("- user_name: Jason"));
        assert!(engine.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn extraction_disabled_without_model() {
        let engine = ContextEngine::new(&config(), parts(None)).unwrap();
        assert!(!engine.extraction_enabled());
        assert!(!engine.on_exchange_complete("u1", "mira", "s1", "My name is Jason", "Hi"));
    }

    #[tokio::test]
    async fn direct_fact_corrections() {
        let engine = ContextEngine::new(&config(), parts(None)).unwrap();
        let write = engine
            .remember_fact("u1", None, FactCandidate::new(FactType::Preference, "drink", "coffee"))
            .await
            .unwrap();
        let id = write.fact().id.clone();
        assert_eq!(write.fact().confidence, 1.0);

        let updated = engine.update_fact(&id, "tea").await.unwrap();
        assert_eq!(updated.fact_value, "tea");
        assert!(matches!(engine.update_fact(&id, "  ").await, Err(Error::Input(_))));

        assert!(engine.delete_fact(&id).await.unwrap());
        assert!(engine.get_user_facts("u1", Some("mira")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_backend_is_validated() {
        let mut config = config();
        config.storage.backend = "cassandra".into();
        assert!(matches!(open_storage(&config).await, Err(Error::Config { .. })));

        config.storage.backend = "memory".into();
        assert!(open_storage(&config).await.is_ok());
    }
}
