//! Audit logging: structured records of what the sanitizer neutralized.
//!
//! Entries are kept in memory (bounded) and forwarded to sinks. The
//! [`TracingSink`] emits each entry through `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Entries kept in memory before the oldest are discarded.
const MAX_ENTRIES: usize = 1024;

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    /// Where the text came from: "user_input", "backstory", "fact", ...
    pub origin: String,
    pub outcome: AuditOutcome,
    pub details: Option<String>,
}

/// Types of auditable sanitizer events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// An injection signature in user input was neutralized
    InjectionNeutralized { kind: String },
    /// Instruction-like content was stripped from retrieved context
    ContextStripped { source: String },
    /// The sanitizer could not run normally and fell back to hardened output
    SanitizerFailOpen,
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Neutralized,
    Stripped,
    Hardened,
}

/// Trait for audit log sinks (where events are written).
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Audit logger that keeps recent entries and forwards to sinks.
pub struct AuditLogger {
    entries: Mutex<VecDeque<AuditEntry>>,
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("entry_count", &self.count())
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger {
    /// Create a new audit logger with no sinks.
    pub fn new() -> Self {
        Self::with_sinks(Vec::new())
    }

    /// Create a new audit logger with the given sinks.
    pub fn with_sinks(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            sinks,
        }
    }

    /// A logger forwarding to [`TracingSink`].
    pub fn tracing() -> Self {
        Self::with_sinks(vec![Box::new(TracingSink)])
    }

    /// Record an audit event.
    pub fn log(&self, event: AuditEvent, origin: &str, outcome: AuditOutcome, details: Option<String>) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event,
            origin: origin.into(),
            outcome,
            details,
        };

        // A poisoned lock only means another thread panicked mid-push;
        // the queue itself is still usable.
        {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            if entries.len() == MAX_ENTRIES {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        for sink in &self.sinks {
            sink.record(&entry);
        }
    }

    /// Get all retained entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Get entries with the given outcome.
    pub fn entries_by_outcome(&self, outcome: &AuditOutcome) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|e| &e.outcome == outcome)
            .collect()
    }

    /// Clear all stored entries.
    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Count of stored entries.
    pub fn count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// A tracing-based audit sink that logs entries via `tracing::info!`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        tracing::info!(
            event = ?entry.event,
            origin = %entry.origin,
            outcome = ?entry.outcome,
            details = ?entry.details,
            "AUDIT"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn log_and_retrieve_entries() {
        let logger = AuditLogger::new();
        logger.log(
            AuditEvent::InjectionNeutralized {
                kind: "instruction_override".into(),
            },
            "user_input",
            AuditOutcome::Neutralized,
            None,
        );
        logger.log(
            AuditEvent::ContextStripped {
                source: "backstory".into(),
            },
            "backstory",
            AuditOutcome::Stripped,
            Some("role header".into()),
        );

        assert_eq!(logger.count(), 2);
        let entries = logger.entries();
        assert_eq!(entries[0].origin, "user_input");
        assert_eq!(entries[1].origin, "backstory");
    }

    #[test]
    fn filter_by_outcome() {
        let logger = AuditLogger::new();
        logger.log(AuditEvent::SanitizerFailOpen, "fact", AuditOutcome::Hardened, None);
        logger.log(
            AuditEvent::InjectionNeutralized { kind: "role_marker".into() },
            "user_input",
            AuditOutcome::Neutralized,
            None,
        );

        let hardened = logger.entries_by_outcome(&AuditOutcome::Hardened);
        assert_eq!(hardened.len(), 1);
        assert_eq!(hardened[0].event, AuditEvent::SanitizerFailOpen);
    }

    #[test]
    fn retains_only_recent_entries() {
        let logger = AuditLogger::new();
        for _ in 0..(MAX_ENTRIES + 10) {
            logger.log(AuditEvent::SanitizerFailOpen, "x", AuditOutcome::Hardened, None);
        }
        assert_eq!(logger.count(), MAX_ENTRIES);
        logger.clear();
        assert_eq!(logger.count(), 0);
    }

    struct CountingSink(Arc<std::sync::atomic::AtomicUsize>);

    impl AuditSink for CountingSink {
        fn record(&self, _entry: &AuditEntry) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn sinks_receive_every_entry() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let logger = AuditLogger::with_sinks(vec![Box::new(CountingSink(counter.clone())), Box::new(TracingSink)]);
        logger.log(AuditEvent::SanitizerFailOpen, "document", AuditOutcome::Hardened, None);
        logger.log(AuditEvent::SanitizerFailOpen, "document", AuditOutcome::Hardened, None);
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_string(&AuditEvent::ContextStripped {
            source: "fact".into(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"context_stripped\""));
    }
}
