//! # Lorekeep Core
//!
//! Domain types, collaborator traits, and error definitions for the lorekeep
//! context engine. This crate has **no storage or network dependencies**: it
//! defines the model every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every collaborator the engine talks to is a trait here: the embedding
//! model, the vector index, the fact store, the conversation-history reader,
//! the character setting source and the language model used for extraction.
//! Implementations live in their own crates, so tests can substitute
//! deterministic stubs for any of them.

pub mod error;
pub mod message;
pub mod provider;
pub mod embedding;
pub mod index;
pub mod fact;
pub mod setting;
pub mod token;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{ConversationTurn, HistoryReader, Message, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse};
pub use embedding::Embedder;
pub use index::{DocumentDirectory, OwnerKind, OwnerScope, ScoredChunk, ScopeSnapshot, TextChunk, VectorIndex};
pub use fact::{FactCandidate, FactProvenance, FactStore, FactType, FactWrite, LearnedFact};
pub use setting::{SettingRecord, SettingSource};
