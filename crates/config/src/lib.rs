//! Configuration loading, validation, and management for lorekeep.
//!
//! Loads configuration from `~/.lorekeep/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.lorekeep/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Context-size budget
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Chunking of backstory and document text
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Retrieval and assembly behaviour
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Embedding model selection
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Background fact extraction
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Persistence backend
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Ceiling used when the caller does not pass one
    #[serde(default = "default_ceiling")]
    pub default_ceiling: usize,
}

fn default_ceiling() -> usize {
    4096
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_ceiling: default_ceiling(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,

    /// A trailing chunk smaller than this is folded into its neighbour
    #[serde(default = "default_min_chunk_tokens")]
    pub min_chunk_tokens: usize,
}

fn default_chunk_max_tokens() -> usize {
    200
}
fn default_overlap_tokens() -> usize {
    30
}
fn default_min_chunk_tokens() -> usize {
    40
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_chunk_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
            min_chunk_tokens: default_min_chunk_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_similarity_floor")]
    pub similarity_floor: f32,

    /// Sources at or below this size are injected whole instead of retrieved
    #[serde(default = "default_small_source_tokens")]
    pub small_source_tokens: usize,

    /// Deadline for each concurrently gathered source
    #[serde(default = "default_source_timeout_ms")]
    pub per_source_timeout_ms: u64,

    /// How many recent turns to read from conversation history
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

fn default_top_k() -> usize {
    5
}
fn default_similarity_floor() -> f32 {
    0.15
}
fn default_small_source_tokens() -> usize {
    400
}
fn default_source_timeout_ms() -> u64 {
    750
}
fn default_history_turns() -> usize {
    20
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_floor: default_similarity_floor(),
            small_source_tokens: default_small_source_tokens(),
            per_source_timeout_ms: default_source_timeout_ms(),
            history_turns: default_history_turns(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "hash" (local, deterministic) or "openai" (any OpenAI-compatible endpoint)
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Upper bound on concurrent embedding calls
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_embedding_provider() -> String {
    "hash".into()
}
fn default_embedding_model() -> String {
    "feature-hash-v1".into()
}
fn default_dimensions() -> usize {
    384
}
fn default_max_concurrency() -> usize {
    4
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            max_concurrency: default_max_concurrency(),
            api_url: None,
            api_key: None,
        }
    }
}

impl std::fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("max_concurrency", &self.max_concurrency)
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_extraction_provider")]
    pub provider: String,

    #[serde(default = "default_extraction_model")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// User messages shorter than this are not worth an extraction call
    #[serde(default = "default_min_message_chars")]
    pub min_message_chars: usize,

    /// Confidence stamped on every extracted fact
    #[serde(default = "default_confidence")]
    pub default_confidence: f32,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub temperature: f32,
}

fn default_true() -> bool {
    true
}
fn default_extraction_provider() -> String {
    "openai".into()
}
fn default_extraction_model() -> String {
    "gpt-4o-mini".into()
}
fn default_min_message_chars() -> usize {
    12
}
fn default_confidence() -> f32 {
    0.9
}
fn default_queue_capacity() -> usize {
    64
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: default_extraction_provider(),
            model: default_extraction_model(),
            api_url: None,
            api_key: None,
            min_message_chars: default_min_message_chars(),
            default_confidence: default_confidence(),
            queue_capacity: default_queue_capacity(),
            temperature: 0.0,
        }
    }
}

impl std::fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("enabled", &self.enabled)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("min_message_chars", &self.min_message_chars)
            .field("default_confidence", &self.default_confidence)
            .field("queue_capacity", &self.queue_capacity)
            .field("temperature", &self.temperature)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "sqlite" or "memory"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Database file; defaults to `~/.lorekeep/lorekeep.sqlite`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn default_storage_backend() -> String {
    "sqlite".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: None,
        }
    }
}

impl StorageConfig {
    /// The configured database path, or the default under the config dir.
    pub fn database_path(&self) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| EngineConfig::config_dir().join("lorekeep.sqlite"))
    }
}

impl EngineConfig {
    /// Load configuration from the default path (~/.lorekeep/config.toml).
    ///
    /// Also checks environment variables:
    /// - `LOREKEEP_API_KEY` (fills embedding and extraction keys when absent)
    /// - `LOREKEEP_EXTRACTION_MODEL`
    /// - `LOREKEEP_DB_PATH`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(key) = std::env::var("LOREKEEP_API_KEY") {
            if config.embedding.api_key.is_none() {
                config.embedding.api_key = Some(key.clone());
            }
            if config.extraction.api_key.is_none() {
                config.extraction.api_key = Some(key);
            }
        }

        if let Ok(model) = std::env::var("LOREKEEP_EXTRACTION_MODEL") {
            config.extraction.model = model;
        }

        if let Ok(path) = std::env::var("LOREKEEP_DB_PATH") {
            config.storage.path = Some(path);
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".lorekeep")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "chunking.max_tokens must be > 0".into(),
            ));
        }

        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            return Err(ConfigError::ValidationError(
                "chunking.overlap_tokens must be smaller than chunking.max_tokens".into(),
            ));
        }

        if !(-1.0..=1.0).contains(&self.retrieval.similarity_floor) {
            return Err(ConfigError::ValidationError(
                "retrieval.similarity_floor must be between -1.0 and 1.0".into(),
            ));
        }

        if self.extraction.default_confidence <= 0.0 || self.extraction.default_confidence > 1.0 {
            return Err(ConfigError::ValidationError(
                "extraction.default_confidence must be in (0.0, 1.0]".into(),
            ));
        }

        if self.embedding.dimensions == 0 || self.embedding.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "embedding.dimensions and embedding.max_concurrency must be > 0".into(),
            ));
        }

        if self.extraction.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "extraction.queue_capacity must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.budget.default_ceiling, 4096);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.retrieval.top_k, 5);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.chunking.max_tokens, config.chunking.max_tokens);
        assert_eq!(parsed.extraction.model, config.extraction.model);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let mut config = EngineConfig::default();
        config.chunking.overlap_tokens = config.chunking.max_tokens;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_confidence_rejected() {
        let mut config = EngineConfig::default();
        config.extraction.default_confidence = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = EngineConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        assert_eq!(result.unwrap().storage.backend, "sqlite");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[retrieval]
top_k = 8

[storage]
backend = "memory"
"#
        )
        .unwrap();

        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.retrieval.history_turns, 20);
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.chunking.overlap_tokens, 30);
    }

    #[test]
    fn invalid_file_is_a_validation_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[chunking]\nmax_tokens = 10\noverlap_tokens = 50").unwrap();
        let err = EngineConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn debug_output_redacts_keys() {
        let mut config = EngineConfig::default();
        config.extraction.api_key = Some("sk-secret".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = EngineConfig::default_toml();
        assert!(toml_str.contains("[chunking]"));
        assert!(toml_str.contains("feature-hash-v1"));
    }

    #[test]
    fn json_view_matches_toml_defaults() {
        let json = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(json["retrieval"]["per_source_timeout_ms"], 750);
    }
}
