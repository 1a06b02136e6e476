//! The lorekeep context engine.
//!
//! Before every model call the engine gathers what the model needs to
//! reply in character and in context:
//!
//! 1. **Gather** setting, learned facts, backstory, documents and recent
//!    turns concurrently, each under a deadline
//! 2. **Allocate** the token ceiling across the five sources
//! 3. **Sanitize** every piece and the current message
//! 4. **Assemble** the sections in fixed order and wrap them as data
//!
//! After the reply, the exchange is queued for background fact extraction.

pub mod context;
pub mod engine;
pub mod extraction;
pub mod retrieval;

#[cfg(test)]
mod test_helpers;

pub use context::{
    allocate, format_setting, AssembledContext, ContextAssembler, ContextBudget, ContextSource, DegradedSource,
    SectionStats, SourceBudget, SourceDemand, SourceMaterial,
};
pub use engine::{Collaborators, ContextEngine, ExternalSources};
pub use extraction::{parse_extraction, ExtractionJob, ExtractionQueue, FactExtractor};
pub use retrieval::Retriever;
