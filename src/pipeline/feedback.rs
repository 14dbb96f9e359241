//! User corrections flow back into the sender cache here.
//!
//! A correction is visible to the very next `categorize` call for the same
//! user and sender: the cache writes through before returning.

use std::sync::Arc;

use tracing::info;

use crate::error::CacheError;
use crate::pipeline::cache::SenderCache;
use crate::pipeline::types::{Category, SenderCacheEntry, normalize_address};

/// What the user said about a categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// "Mail from this sender is actually `Category`."
    Recategorize(Category),
    /// "That was wrong", with no replacement. The sender is forgotten.
    Reject,
}

pub struct FeedbackSink {
    cache: Arc<dyn SenderCache>,
}

impl FeedbackSink {
    pub fn new(cache: Arc<dyn SenderCache>) -> Self {
        Self { cache }
    }

    /// Record a user correction for `sender`.
    ///
    /// The old entry is always dropped first. A recategorization then stores
    /// a `user_override` entry at confidence 1.0, which no later LLM result
    /// replaces.
    pub async fn apply_correction(
        &self,
        user_id: &str,
        sender: &str,
        correction: Correction,
    ) -> Result<(), CacheError> {
        let sender = normalize_address(sender);
        let existed = self.cache.invalidate(user_id, &sender).await?;

        match correction {
            Correction::Recategorize(category) => {
                self.cache
                    .upsert(user_id, &sender, SenderCacheEntry::user_override(category))
                    .await?;
                info!(user_id, sender = %sender, category = %category, "Sender recategorized by user");
            }
            Correction::Reject => {
                info!(user_id, sender = %sender, existed, "Sender categorization rejected by user");
            }
        }
        Ok(())
    }
}
