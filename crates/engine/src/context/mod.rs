//! Budgeted multi-source context assembly.
//!
//! # Context Sources (in render order)
//!
//! | Source | Origin | Trim Strategy |
//! |--------|--------|---------------|
//! | 1. Setting | Character setting record | Trailing lines dropped |
//! | 2. Facts | Learned user facts | Global facts dropped before scoped |
//! | 3. Backstory | Retrieved chunks | Lowest-relevance dropped |
//! | 4. Documents | Retrieved chunks | Lowest-relevance dropped |
//! | 5. Conversation | Recent turns | Oldest turns dropped |

pub mod allocator;
pub mod assembler;
pub mod setting;

pub use allocator::{allocate, ContextBudget, ContextSource, SourceBudget, SourceDemand, WEIGHT_SCALE};
pub use assembler::{AssembledContext, ContextAssembler, DegradedSource, SectionStats, SourceMaterial};
pub use setting::{format_setting, setting_lines};
