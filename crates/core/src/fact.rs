//! Learned facts: structured, typed records extracted from conversation.
//!
//! Invariant: at most one *active* fact exists per
//! `(user_id, character_id, fact_key)`. A new value for an existing key
//! supersedes the old one instead of duplicating it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::StoreError;

/// The closed set of fact categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Name,
    Preference,
    Relationship,
    Event,
    Trait,
    Other,
}

impl FactType {
    pub const ALL: [FactType; 6] = [
        FactType::Name,
        FactType::Preference,
        FactType::Relationship,
        FactType::Event,
        FactType::Trait,
        FactType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactType::Name => "name",
            FactType::Preference => "preference",
            FactType::Relationship => "relationship",
            FactType::Event => "event",
            FactType::Trait => "trait",
            FactType::Other => "other",
        }
    }

    /// Parse a wire value. Anything outside the closed set is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl std::fmt::Display for FactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted fact about a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedFact {
    pub id: String,
    pub user_id: String,
    /// `None` means the fact is global to the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<String>,
    pub fact_type: FactType,
    pub fact_key: String,
    pub fact_value: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A validated `{fact_type, fact_key, fact_value}` triple ready to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactCandidate {
    pub fact_type: FactType,
    pub fact_key: String,
    pub fact_value: String,
}

impl FactCandidate {
    pub fn new(fact_type: FactType, key: &str, value: impl Into<String>) -> Self {
        Self {
            fact_type,
            fact_key: canonicalize_fact_key(key),
            fact_value: value.into(),
        }
    }
}

/// Where a batch of facts came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactProvenance {
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
}

/// Outcome of persisting one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum FactWrite {
    Inserted(LearnedFact),
    Updated {
        previous_value: String,
        fact: LearnedFact,
    },
}

impl FactWrite {
    pub fn fact(&self) -> &LearnedFact {
        match self {
            FactWrite::Inserted(fact) => fact,
            FactWrite::Updated { fact, .. } => fact,
        }
    }
}

/// The core FactStore trait.
///
/// Implementations: in-memory, SQLite.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// The backend name.
    fn name(&self) -> &str;

    /// Persist a batch of candidates atomically: either every candidate is
    /// written or none is. An existing active fact with the same key is
    /// overwritten (value, type, confidence, updated_at) as a correction.
    async fn record_batch(
        &self,
        user_id: &str,
        character_id: Option<&str>,
        candidates: &[FactCandidate],
        confidence: f32,
        provenance: &FactProvenance,
    ) -> std::result::Result<Vec<FactWrite>, StoreError>;

    /// Active facts visible for a character: character-scoped facts first,
    /// then global ones not shadowed by a character-scoped key.
    async fn active_facts(
        &self,
        user_id: &str,
        character_id: Option<&str>,
    ) -> std::result::Result<Vec<LearnedFact>, StoreError>;

    /// Fetch one fact by id (active or not).
    async fn get(&self, id: &str) -> std::result::Result<Option<LearnedFact>, StoreError>;

    /// Direct user correction of a fact's value.
    async fn update_fact(&self, id: &str, value: &str) -> std::result::Result<LearnedFact, StoreError>;

    /// Direct user deletion; the fact is deactivated. Returns false if no
    /// active fact had that id.
    async fn delete_fact(&self, id: &str) -> std::result::Result<bool, StoreError>;
}

/// Normalise a fact key to lower snake_case so "User Name", "user-name"
/// and "user_name" address the same fact.
pub fn canonicalize_fact_key(key: &str) -> String {
    let raw = key.trim();
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Order facts for context: character-scoped first, then globals whose key
/// is not already covered. Within each group: by fact type, then key.
pub fn order_for_context(mut scoped: Vec<LearnedFact>, mut global: Vec<LearnedFact>) -> Vec<LearnedFact> {
    let sort = |facts: &mut Vec<LearnedFact>| {
        facts.sort_by(|a, b| {
            a.fact_type
                .cmp(&b.fact_type)
                .then_with(|| a.fact_key.cmp(&b.fact_key))
                .then_with(|| a.id.cmp(&b.id))
        })
    };
    sort(&mut scoped);
    sort(&mut global);

    let shadowed: HashSet<String> = scoped.iter().map(|f| f.fact_key.clone()).collect();
    scoped.extend(global.into_iter().filter(|f| !shadowed.contains(&f.fact_key)));
    scoped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(id: &str, character: Option<&str>, fact_type: FactType, key: &str) -> LearnedFact {
        LearnedFact {
            id: id.into(),
            user_id: "u".into(),
            character_id: character.map(String::from),
            fact_type,
            fact_key: key.into(),
            fact_value: "v".into(),
            confidence: 0.9,
            source_conversation_id: None,
            source_message_id: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn fact_type_parse_is_closed() {
        assert_eq!(FactType::parse("name"), Some(FactType::Name));
        assert_eq!(FactType::parse(" Trait "), Some(FactType::Trait));
        assert_eq!(FactType::parse("location"), None);
        assert_eq!(FactType::parse(""), None);
    }

    #[test]
    fn canonical_keys() {
        assert_eq!(canonicalize_fact_key("User Name"), "user_name");
        assert_eq!(canonicalize_fact_key("  favorite-color!! "), "favorite_color");
        assert_eq!(canonicalize_fact_key("user_name"), "user_name");
        assert_eq!(canonicalize_fact_key("???"), "");
    }

    #[test]
    fn candidate_canonicalizes_key() {
        let c = FactCandidate::new(FactType::Name, "User Name", "Jason");
        assert_eq!(c.fact_key, "user_name");
    }

    #[test]
    fn scoped_facts_come_first_and_shadow_globals() {
        let scoped = vec![fact("2", Some("c"), FactType::Other, "location")];
        let global = vec![
            fact("1", None, FactType::Name, "user_name"),
            fact("3", None, FactType::Other, "location"),
        ];
        let ordered = order_for_context(scoped, global);
        let ids: Vec<&str> = ordered.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
    }

    #[test]
    fn ordering_is_by_type_then_key() {
        let scoped = vec![
            fact("a", Some("c"), FactType::Other, "zeta"),
            fact("b", Some("c"), FactType::Name, "user_name"),
            fact("c", Some("c"), FactType::Other, "alpha"),
        ];
        let ordered = order_for_context(scoped, vec![]);
        let keys: Vec<&str> = ordered.iter().map(|f| f.fact_key.as_str()).collect();
        assert_eq!(keys, vec!["user_name", "alpha", "zeta"]);
    }
}
