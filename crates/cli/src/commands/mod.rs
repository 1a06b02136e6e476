pub mod chunk;
pub mod context;
pub mod facts;
pub mod ingest;
pub mod onboard;
pub mod sanitize;

use lorekeep_config::EngineConfig;
use lorekeep_engine::{ContextEngine, ExternalSources};
use lorekeep_memory::{InMemoryDocuments, InMemoryHistory, InMemorySettings};
use std::sync::Arc;

pub(crate) fn load_config() -> Result<EngineConfig, Box<dyn std::error::Error>> {
    Ok(EngineConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

/// An engine with no history, setting or attached documents, for commands
/// that only touch the index or the fact store.
pub(crate) async fn open_engine(config: &EngineConfig) -> Result<ContextEngine, Box<dyn std::error::Error>> {
    tracing::debug!(backend = %config.storage.backend, "Opening engine");
    let external = ExternalSources {
        history: Arc::new(InMemoryHistory::new()),
        settings: Arc::new(InMemorySettings::new()),
        documents: Arc::new(InMemoryDocuments::new()),
    };
    Ok(ContextEngine::from_config(config, external).await?)
}
