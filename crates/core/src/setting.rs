//! Structured world/setting facts owned by a character.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// World, location, time and key facts for a character.
///
/// Mutated only by explicit updates in the surrounding application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingRecord {
    pub character_id: String,
    #[serde(default)]
    pub world: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub time_period: String,
    #[serde(default)]
    pub key_facts: Vec<String>,
}

impl SettingRecord {
    /// True when no field carries any non-whitespace text.
    pub fn is_blank(&self) -> bool {
        self.world.trim().is_empty()
            && self.location.trim().is_empty()
            && self.time_period.trim().is_empty()
            && self.key_facts.iter().all(|f| f.trim().is_empty())
    }
}

/// Reads a character's setting record.
#[async_trait]
pub trait SettingSource: Send + Sync {
    async fn setting(&self, character_id: &str) -> std::result::Result<Option<SettingRecord>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_only_record_is_blank() {
        let record = SettingRecord {
            character_id: "c".into(),
            world: "  ".into(),
            key_facts: vec!["".into(), "\n".into()],
            ..Default::default()
        };
        assert!(record.is_blank());
    }

    #[test]
    fn any_field_makes_record_non_blank() {
        let record = SettingRecord {
            character_id: "c".into(),
            time_period: "1920s".into(),
            ..Default::default()
        };
        assert!(!record.is_blank());
    }

    #[test]
    fn deserializes_with_missing_fields() {
        let record: SettingRecord =
            serde_json::from_str(r#"{"character_id":"c","world":"Eldoria"}"#).unwrap();
        assert_eq!(record.world, "Eldoria");
        assert!(record.key_facts.is_empty());
    }
}
