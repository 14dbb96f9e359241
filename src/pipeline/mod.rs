//! Email categorization pipeline.
//!
//! Every batch of email records flows through:
//! 1. `HeuristicClassifier::classify()` — header and subject rules (no I/O)
//! 2. `SenderCache::lookup()` — per-user sender reputation
//! 3. `LlmResolver::resolve()` — batched LLM classification
//! 4. `CategoryCatalog::suggested_actions()` — actions per category
//!
//! `FeedbackSink` writes user corrections back into the sender cache.
//!
//! **Personal and important mail is never suggested for anything but `keep`.**

pub mod cache;
pub mod catalog;
pub mod feedback;
pub mod heuristics;
pub mod orchestrator;
pub mod resolver;
pub mod types;

pub use cache::{SenderCache, SenderReputationCache, SenderStore, UpsertOutcome};
pub use catalog::{CategoryCatalog, CategoryConfig};
pub use feedback::{Correction, FeedbackSink};
pub use heuristics::HeuristicClassifier;
pub use orchestrator::Categorizer;
pub use resolver::LlmResolver;
pub use types::*;
