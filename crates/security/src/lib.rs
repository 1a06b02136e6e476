//! Security module for Lorekeep: prompt sanitizing and audit logging.
//!
//! Provides:
//! - **Sanitizer**: neutralizes injection signatures in user input and
//!   retrieved context, and wraps the assembled context as data
//! - **Audit logging**: structured records of every neutralization

pub mod audit;
pub mod sanitizer;

pub use audit::{AuditEntry, AuditEvent, AuditLogger, AuditOutcome, AuditSink, TracingSink};
pub use sanitizer::{
    harden, InjectionWarning, Sanitizer, BOUNDARY_END, BOUNDARY_START, DATA_DIRECTIVE,
    DEFAULT_SIGNATURES, FILTERED,
};
