//! Sender reputation cache — per-user memory of how each sender was
//! categorized before.
//!
//! Each user owns a shard behind its own mutex, so every operation on a
//! `(user, sender)` key is atomic and users never contend with each other.
//! A shard may read through to, and write through to, a durable
//! `SenderStore`.
//!
//! An LLM entry is only written if it is newer than whatever the user did
//! to that sender since: an override always wins, and an entry stamped
//! before the last invalidation is dropped as stale.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::pipeline::types::{normalize_address, EntrySource, SenderCacheEntry};

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// An LLM entry was dropped because the user already overrode this sender.
    KeptOverride,
    /// An LLM entry was dropped because it predates the current slot.
    Stale,
}

/// The three operations the pipeline needs from a sender cache.
#[async_trait]
pub trait SenderCache: Send + Sync {
    async fn lookup(
        &self,
        user_id: &str,
        sender: &str,
    ) -> Result<Option<SenderCacheEntry>, CacheError>;

    async fn upsert(
        &self,
        user_id: &str,
        sender: &str,
        entry: SenderCacheEntry,
    ) -> Result<UpsertOutcome, CacheError>;

    /// Remove the entry. Returns whether one existed.
    async fn invalidate(&self, user_id: &str, sender: &str) -> Result<bool, CacheError>;
}

/// Durable backing for the cache. Implemented outside this crate.
#[async_trait]
pub trait SenderStore: Send + Sync {
    async fn load(
        &self,
        user_id: &str,
        sender: &str,
    ) -> Result<Option<SenderCacheEntry>, CacheError>;

    async fn save(
        &self,
        user_id: &str,
        sender: &str,
        entry: &SenderCacheEntry,
    ) -> Result<(), CacheError>;

    async fn delete(&self, user_id: &str, sender: &str) -> Result<(), CacheError>;
}

/// What the shard knows about a sender.
#[derive(Debug, Clone)]
enum Slot {
    Present(SenderCacheEntry),
    /// Known to have no entry; blocks read-through after an invalidation.
    Absent {
        invalidated_at: Option<DateTime<Utc>>,
    },
}

type Shard = Arc<Mutex<HashMap<String, Slot>>>;

/// In-process sender cache, optionally backed by a `SenderStore`.
pub struct SenderReputationCache {
    users: RwLock<HashMap<String, Shard>>,
    store: Option<Arc<dyn SenderStore>>,
}

impl SenderReputationCache {
    /// Memory-only cache.
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Cache that reads through and writes through to `store`.
    pub fn with_store(store: Arc<dyn SenderStore>) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            store: Some(store),
        }
    }

    async fn shard(&self, user_id: &str) -> Shard {
        if let Some(shard) = self.users.read().await.get(user_id) {
            return Arc::clone(shard);
        }
        let mut users = self.users.write().await;
        Arc::clone(users.entry(user_id.to_string()).or_default())
    }

    /// Current slot for `sender`, loading it from the store on first touch.
    async fn resolve(
        &self,
        slots: &mut HashMap<String, Slot>,
        user_id: &str,
        sender: &str,
    ) -> Result<Option<SenderCacheEntry>, CacheError> {
        if let Some(slot) = slots.get(sender) {
            return Ok(match slot {
                Slot::Present(entry) => Some(entry.clone()),
                Slot::Absent { .. } => None,
            });
        }

        let Some(store) = &self.store else {
            return Ok(None);
        };

        let loaded = store.load(user_id, sender).await?;
        let slot = match &loaded {
            Some(entry) => Slot::Present(entry.clone()),
            None => Slot::Absent {
                invalidated_at: None,
            },
        };
        slots.insert(sender.to_string(), slot);
        Ok(loaded)
    }
}

impl Default for SenderReputationCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SenderCache for SenderReputationCache {
    async fn lookup(
        &self,
        user_id: &str,
        sender: &str,
    ) -> Result<Option<SenderCacheEntry>, CacheError> {
        let sender = normalize_address(sender);
        let shard = self.shard(user_id).await;
        let mut slots = shard.lock().await;
        self.resolve(&mut slots, user_id, &sender).await
    }

    async fn upsert(
        &self,
        user_id: &str,
        sender: &str,
        entry: SenderCacheEntry,
    ) -> Result<UpsertOutcome, CacheError> {
        let sender = normalize_address(sender);
        let shard = self.shard(user_id).await;
        let mut slots = shard.lock().await;

        self.resolve(&mut slots, user_id, &sender).await?;

        let from_llm = entry.source == EntrySource::Llm;
        let outcome = match slots.get(&sender) {
            Some(Slot::Present(current))
                if from_llm && current.source == EntrySource::UserOverride =>
            {
                debug!(
                    user_id,
                    sender = %sender,
                    "Keeping user override over LLM result"
                );
                return Ok(UpsertOutcome::KeptOverride);
            }
            Some(Slot::Present(current)) if from_llm && current.updated_at > entry.updated_at => {
                debug!(user_id, sender = %sender, "Dropping LLM result older than cached entry");
                return Ok(UpsertOutcome::Stale);
            }
            Some(Slot::Absent {
                invalidated_at: Some(at),
            }) if from_llm && entry.updated_at <= *at => {
                debug!(user_id, sender = %sender, "Dropping LLM result that predates invalidation");
                return Ok(UpsertOutcome::Stale);
            }
            Some(Slot::Present(_)) => UpsertOutcome::Replaced,
            Some(Slot::Absent { .. }) | None => UpsertOutcome::Inserted,
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.save(user_id, &sender, &entry).await {
                warn!(user_id, sender = %sender, error = %e, "Sender store save failed");
            }
        }

        debug!(
            user_id,
            sender = %sender,
            category = %entry.category,
            source = ?entry.source,
            "Sender cache upsert"
        );
        slots.insert(sender, Slot::Present(entry));
        Ok(outcome)
    }

    async fn invalidate(&self, user_id: &str, sender: &str) -> Result<bool, CacheError> {
        let sender = normalize_address(sender);
        let shard = self.shard(user_id).await;
        let mut slots = shard.lock().await;

        let existed = matches!(slots.get(&sender), Some(Slot::Present(_)));

        if let Some(store) = &self.store {
            if let Err(e) = store.delete(user_id, &sender).await {
                warn!(user_id, sender = %sender, error = %e, "Sender store delete failed");
            }
        }

        slots.insert(
            sender.clone(),
            Slot::Absent {
                invalidated_at: Some(Utc::now()),
            },
        );
        info!(user_id, sender = %sender, existed, "Sender cache entry invalidated");
        Ok(existed)
    }
}
