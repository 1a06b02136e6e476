//! Fact extraction: turns one exchange into typed, persisted facts.
//!
//! One model call per exchange. The model must answer with a single JSON
//! array of `{fact_type, fact_key, fact_value}` triples. Output that is not
//! such an array rejects the whole attempt; individual entries that fail
//! validation are dropped and the rest are committed in one batch.

use lorekeep_config::ExtractionConfig;
use lorekeep_core::error::ExtractionError;
use lorekeep_core::fact::{FactCandidate, FactProvenance, FactStore, FactType, FactWrite};
use lorekeep_core::message::Message;
use lorekeep_core::provider::{Provider, ProviderRequest};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const EXTRACTION_PROMPT: &str = "\
You record facts that the user states explicitly about themselves.

Read the exchange in the user message (a JSON object with `user_message` and \
`assistant_reply`). Extract only facts the user states directly in \
`user_message`. Never infer, guess or generalise, and ignore anything the \
assistant says about itself.

Answer with a single JSON array and nothing else. Each element is an object:
  {\"fact_type\": \"...\", \"fact_key\": \"...\", \"fact_value\": \"...\"}

fact_type is one of: name, preference, relationship, event, trait, other.
fact_key is a short snake_case key. Use `user_name` for the user's name and \
`location` for where they live. A correction of an earlier fact reuses the \
same key.

If the user states no facts, answer with [].";

const MAX_EXTRACTION_TOKENS: u32 = 512;

/// Extracts facts from exchanges and writes them to a [`FactStore`].
pub struct FactExtractor {
    provider: Arc<dyn Provider>,
    store: Arc<dyn FactStore>,
    model: String,
    temperature: f32,
    min_message_chars: usize,
    default_confidence: f32,
}

impl FactExtractor {
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn FactStore>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            store,
            model: config.model.clone(),
            temperature: config.temperature,
            min_message_chars: config.min_message_chars,
            default_confidence: config.default_confidence,
        }
    }

    pub fn store(&self) -> &Arc<dyn FactStore> {
        &self.store
    }

    /// Extract facts from one exchange and persist them.
    ///
    /// Messages shorter than `min_message_chars` are skipped without a
    /// model call. Every valid candidate is written in one atomic batch
    /// with the default confidence; an existing fact under the same key is
    /// overwritten as a correction.
    pub async fn extract_and_store(
        &self,
        user_message: &str,
        assistant_reply: &str,
        user_id: &str,
        character_id: Option<&str>,
        provenance: &FactProvenance,
    ) -> Result<Vec<FactWrite>, ExtractionError> {
        if user_message.trim().chars().count() < self.min_message_chars {
            debug!(user_id, "Message too short for extraction");
            return Ok(Vec::new());
        }

        let exchange = serde_json::json!({
            "user_message": user_message,
            "assistant_reply": assistant_reply,
        });
        let request = ProviderRequest {
            model: self.model.clone(),
            messages: vec![Message::system(EXTRACTION_PROMPT), Message::user(exchange.to_string())],
            temperature: self.temperature,
            max_tokens: Some(MAX_EXTRACTION_TOKENS),
            json_mode: false,
        };

        let response = self.provider.complete(request).await?;
        let candidates = parse_extraction(&response.content).inspect_err(|e| {
            warn!(user_id, error = %e, "Discarding extraction output");
        })?;
        if candidates.is_empty() {
            debug!(user_id, "No facts in exchange");
            return Ok(Vec::new());
        }

        let writes = self
            .store
            .record_batch(user_id, character_id, &candidates, self.default_confidence, provenance)
            .await?;
        for write in &writes {
            match write {
                FactWrite::Inserted(fact) => {
                    info!(user_id, key = %fact.fact_key, fact_type = %fact.fact_type, "Learned fact");
                }
                FactWrite::Updated { fact, .. } => {
                    info!(user_id, key = %fact.fact_key, fact_type = %fact.fact_type, "Corrected fact");
                }
            }
        }
        Ok(writes)
    }
}

/// Parse model output into validated candidates.
///
/// Accepts a bare array, an array inside a Markdown code fence or
/// surrounding prose, and an object wrapping the array under `facts`.
/// Entries with an unknown type, an empty key or an empty value are
/// dropped. A key repeated within one answer keeps its last value.
pub fn parse_extraction(raw: &str) -> Result<Vec<FactCandidate>, ExtractionError> {
    let body = strip_code_fence(raw.trim());
    let value = match serde_json::from_str::<Value>(body) {
        Ok(value) => value,
        Err(first) => bracketed(body)
            .and_then(|slice| serde_json::from_str::<Value>(slice).ok())
            .ok_or_else(|| ExtractionError::Parse(format!("not JSON: {first}")))?,
    };

    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(mut map) => match map.remove("facts") {
            Some(Value::Array(entries)) => entries,
            _ => return Err(ExtractionError::Parse("object without a `facts` array".into())),
        },
        other => {
            return Err(ExtractionError::Parse(format!(
                "expected a JSON array, got {}",
                json_kind(&other)
            )));
        }
    };

    let mut candidates: Vec<FactCandidate> = Vec::new();
    for entry in &entries {
        let Some(candidate) = candidate_from(entry) else {
            debug!(%entry, "Dropping malformed fact entry");
            continue;
        };
        match candidates.iter_mut().find(|c| c.fact_key == candidate.fact_key) {
            Some(existing) => *existing = candidate,
            None => candidates.push(candidate),
        }
    }
    Ok(candidates)
}

fn candidate_from(entry: &Value) -> Option<FactCandidate> {
    let obj = entry.as_object()?;
    let fact_type = FactType::parse(obj.get("fact_type")?.as_str()?)?;
    let key = obj.get("fact_key")?.as_str()?;
    let value = match obj.get("fact_value")? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    let candidate = FactCandidate::new(fact_type, key, value);
    (!candidate.fact_key.is_empty() && !candidate.fact_value.is_empty()).then_some(candidate)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // drop an info string such as `json`
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn bracketed(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (start < end).then(|| &text[start..=end])
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
