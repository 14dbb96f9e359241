//! Shared types for the categorization pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::pipeline::catalog::CategoryCatalog;

// ── Input record ────────────────────────────────────────────────────

/// Metadata for one email, as supplied by the caller.
///
/// Subject and snippet arrive truncated and sanitized; the pipeline does not
/// re-check them. No raw header or body is carried, only derived signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailRecord {
    pub id: String,
    pub thread_id: String,
    pub sender: Sender,
    /// At most 200 characters.
    pub subject: String,
    /// At most 100 characters.
    pub snippet: String,
    pub date: DateTime<Utc>,
    pub is_read: bool,
    #[serde(default)]
    pub signals: HeaderSignals,
    #[serde(default)]
    pub body: BodyShape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    pub domain: String,
}

/// Booleans derived from the message headers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeaderSignals {
    pub has_list_unsubscribe: bool,
    pub has_precedence_bulk: bool,
    pub is_noreply: bool,
    pub has_return_path_mismatch: bool,
}

/// Coarse shape of the body.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BodyShape {
    /// Body length in characters.
    pub length: u32,
    pub link_count: u32,
    pub image_count: u32,
    pub has_unsubscribe_text: bool,
}

/// Lowercased, trimmed sender address used as the cache key.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

// ── Category ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Spam,
    Marketing,
    Newsletter,
    Notification,
    Social,
    Transactional,
    Personal,
    Important,
    Unknown,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Self::Spam,
        Self::Marketing,
        Self::Newsletter,
        Self::Notification,
        Self::Social,
        Self::Transactional,
        Self::Personal,
        Self::Important,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spam => "spam",
            Self::Marketing => "marketing",
            Self::Newsletter => "newsletter",
            Self::Notification => "notification",
            Self::Social => "social",
            Self::Transactional => "transactional",
            Self::Personal => "personal",
            Self::Important => "important",
            Self::Unknown => "unknown",
        }
    }

    /// Protected categories never receive a cleanup action.
    pub fn is_protected(&self) -> bool {
        matches!(self, Self::Personal | Self::Important)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| format!("unknown category: '{s}'"))
    }
}

// ── Results ─────────────────────────────────────────────────────────

/// Which tier produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Heuristic,
    Cache,
    Llm,
    UserOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Keep,
    Archive,
    Delete,
    Unsubscribe,
    MarkRead,
    Review,
}

impl ActionType {
    /// Actions that remove or hide mail.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Archive | Self::Delete | Self::Unsubscribe)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub reason: String,
    /// 1 (most recommended) to 5.
    pub priority: u8,
}

/// Final categorization of one email.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorizationResult {
    pub email_id: String,
    pub category: Category,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub source: ResolutionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub suggested_actions: Vec<SuggestedAction>,
}

// ── Sender cache ────────────────────────────────────────────────────

/// Who established a cached sender category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    Llm,
    UserOverride,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderCacheEntry {
    pub category: Category,
    pub confidence: f32,
    pub source: EntrySource,
    pub updated_at: DateTime<Utc>,
}

impl SenderCacheEntry {
    pub fn from_llm(category: Category, confidence: f32) -> Self {
        Self::from_llm_at(category, confidence, Utc::now())
    }

    /// LLM entry based on what the cache held at `observed_at`.
    pub fn from_llm_at(category: Category, confidence: f32, observed_at: DateTime<Utc>) -> Self {
        Self {
            category,
            confidence,
            source: EntrySource::Llm,
            updated_at: observed_at,
        }
    }

    pub fn user_override(category: Category) -> Self {
        Self {
            category,
            confidence: 1.0,
            source: EntrySource::UserOverride,
            updated_at: Utc::now(),
        }
    }
}

// ── Stats ───────────────────────────────────────────────────────────

/// Per-invocation counters.
///
/// The three tier counters plus `invalid_records` and `cancelled_records`
/// always sum to the number of input records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub resolved_by_heuristic: usize,
    /// Includes results sourced from user overrides.
    pub resolved_by_cache: usize,
    /// Includes records the LLM tier degraded to `unknown`.
    pub resolved_by_llm: usize,
    pub invalid_records: usize,
    pub cancelled_records: usize,
    pub degraded_records: usize,
    pub llm_calls: usize,
    pub llm_cost_usd: Decimal,
}

impl BatchStats {
    pub fn total(&self) -> usize {
        self.resolved_by_heuristic
            + self.resolved_by_cache
            + self.resolved_by_llm
            + self.invalid_records
            + self.cancelled_records
    }
}

/// Output of one `categorize` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Categorization {
    /// Same order and length as the input records.
    pub results: Vec<CategorizationResult>,
    pub stats: BatchStats,
}

impl Categorization {
    /// Result count per category, in catalog presentation order, skipping
    /// empty categories.
    pub fn summary(&self, catalog: &CategoryCatalog) -> Vec<(Category, usize)> {
        catalog
            .ordered()
            .into_iter()
            .map(|category| {
                let count = self
                    .results
                    .iter()
                    .filter(|r| r.category == category)
                    .count();
                (category, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect()
    }
}
