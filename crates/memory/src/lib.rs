//! Storage and embedding layer for lorekeep.
//!
//! - [`chunker`]: paragraph/sentence-aware chunking with overlap
//! - [`embedding`]: embedding generators and the shared process-wide model
//! - [`vector`]: cosine similarity and chunk ranking
//! - [`in_memory`] / [`sqlite`]: vector index and fact store backends

pub mod chunker;
pub mod embedding;
pub mod in_memory;
pub mod vector;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use chunker::{Chunker, chunk, paragraphs};
pub use embedding::{BoundedEmbedder, HashEmbedder, ProviderEmbedder, shared_embedder};
pub use in_memory::{InMemoryDocuments, InMemoryFactStore, InMemoryHistory, InMemorySettings, InMemoryVectorIndex};
pub use vector::{cosine_similarity, rank_chunks};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteFactStore, SqliteVectorIndex, open_pool};
