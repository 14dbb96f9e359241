//! Inbox Sweep: tiered email categorization.

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
