//! Background fact extraction.
//!
//! [`FactExtractor`] performs one extraction; [`ExtractionQueue`] runs
//! extractions off the reply path on a single bounded worker.

pub mod extractor;
pub mod queue;

pub use extractor::{parse_extraction, FactExtractor};
pub use queue::{ExtractionJob, ExtractionQueue};
