//! LLM resolver — the last and only paid tier.
//!
//! Takes every record the cheaper tiers could not settle, splits them into
//! batches of at most `max_batch_size`, and sends one request per batch.
//! Each batch ends as exactly one `BatchOutcome`; nothing here returns an
//! error to the caller. Cost is tracked per call, including failed attempts
//! that still reported usage.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{LlmError, ResolutionError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::llm::retry::{retry_once, with_timeout, Attempt};
use crate::pipeline::types::{Category, EmailRecord, SenderCacheEntry};

/// A record queued for the LLM tier, with whatever the cheaper tiers learned.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub record: &'a EmailRecord,
    /// Low-confidence heuristic guess, if any signal fired.
    pub heuristic_guess: Option<(Category, f32)>,
    /// Cached sender entry below the confidence threshold.
    pub cache_hint: Option<&'a SenderCacheEntry>,
}

/// The model's answer for one email.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmVerdict {
    pub category: Category,
    pub confidence: f32,
    pub reasoning: String,
}

/// How one batch ended.
#[derive(Debug)]
pub enum BatchOutcome {
    /// Every requested email got a verdict.
    Complete {
        verdicts: HashMap<String, LlmVerdict>,
        attempts: u32,
        cost: Decimal,
    },
    /// Some requested emails were missing from the response.
    Partial {
        verdicts: HashMap<String, LlmVerdict>,
        missing: Vec<ResolutionError>,
        attempts: u32,
        cost: Decimal,
    },
    /// Both attempts failed; every email in the batch is unresolved.
    Failed {
        email_ids: Vec<String>,
        error: ResolutionError,
        attempts: u32,
        cost: Decimal,
    },
    /// Cancelled before dispatch; no call was made.
    Skipped { email_ids: Vec<String> },
}

impl BatchOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Complete { attempts, .. }
            | Self::Partial { attempts, .. }
            | Self::Failed { attempts, .. } => *attempts,
            Self::Skipped { .. } => 0,
        }
    }

    pub fn cost(&self) -> Decimal {
        match self {
            Self::Complete { cost, .. } | Self::Partial { cost, .. } | Self::Failed { cost, .. } => {
                *cost
            }
            Self::Skipped { .. } => Decimal::ZERO,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Complete { .. } => "complete",
            Self::Partial { .. } => "partial",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// Batches unresolved records through an `LlmProvider`.
pub struct LlmResolver {
    llm: Arc<dyn LlmProvider>,
    config: PipelineConfig,
}

impl LlmResolver {
    pub fn new(llm: Arc<dyn LlmProvider>, config: PipelineConfig) -> Self {
        Self { llm, config }
    }

    /// Resolve all candidates, one outcome per batch in dispatch order.
    ///
    /// Batches not yet started when `cancel` fires are skipped. Batches
    /// already in flight run to completion.
    pub async fn resolve(
        &self,
        candidates: &[Candidate<'_>],
        cancel: &CancellationToken,
    ) -> Vec<BatchOutcome> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let batch_size = self.config.max_batch_size.max(1);
        info!(
            records = candidates.len(),
            batches = candidates.len().div_ceil(batch_size),
            model = self.llm.model_name(),
            "Dispatching LLM batches"
        );

        // Boxed up front so the scan future stays `Send` under `tokio::spawn`.
        let mut batches: Vec<BoxFuture<'_, BatchOutcome>> = Vec::new();
        for (index, batch) in candidates.chunks(batch_size).enumerate() {
            batches.push(
                async move {
                    if cancel.is_cancelled() {
                        warn!(batch = index, records = batch.len(), "Skipping LLM batch after cancellation");
                        return BatchOutcome::Skipped {
                            email_ids: batch.iter().map(|c| c.record.id.clone()).collect(),
                        };
                    }
                    self.resolve_batch(index, batch).await
                }
                .boxed(),
            );
        }

        futures::stream::iter(batches)
            .buffered(self.config.max_concurrent_batches.max(1))
            .collect()
            .await
    }

    /// Run one batch with a single retry on transient failure.
    async fn resolve_batch(&self, index: usize, batch: &[Candidate<'_>]) -> BatchOutcome {
        let request = build_request(batch, &self.config);
        let rates = self.llm.cost_per_token();

        let retried = retry_once(self.config.retry_backoff, || {
            let request = request.clone();
            async move {
                let response = with_timeout(
                    self.llm.model_name(),
                    self.config.llm_timeout,
                    self.llm.complete(request),
                )
                .await;

                match response {
                    Ok(response) => Attempt {
                        cost: response.cost(rates),
                        result: parse_verdicts(&response.content).map_err(|reason| {
                            LlmError::InvalidResponse {
                                provider: self.llm.model_name().to_string(),
                                reason,
                            }
                        }),
                    },
                    Err(e) => Attempt::free(Err(e)),
                }
            }
        })
        .await;

        let attempts = retried.attempts;
        let cost = retried.cost;

        let raw = match retried.result {
            Ok(raw) => raw,
            Err(e) => {
                let email_ids: Vec<String> = batch.iter().map(|c| c.record.id.clone()).collect();
                let error = ResolutionError::LlmBatchFailure {
                    records: email_ids.len(),
                    attempts,
                    reason: failure_reason(&e),
                };
                error!(batch = index, %cost, error = %error, "LLM batch failed");
                return BatchOutcome::Failed {
                    email_ids,
                    error,
                    attempts,
                    cost,
                };
            }
        };

        let requested: HashSet<&str> = batch.iter().map(|c| c.record.id.as_str()).collect();
        let mut verdicts = HashMap::with_capacity(batch.len());
        for item in raw {
            if !requested.contains(item.id.as_str()) {
                debug!(batch = index, id = %item.id, "Ignoring verdict for unrequested email");
                continue;
            }
            if verdicts.contains_key(&item.id) {
                debug!(batch = index, id = %item.id, "Ignoring duplicate verdict");
                continue;
            }
            let verdict = to_verdict(item.category, item.confidence, item.reasoning, &self.config);
            verdicts.insert(item.id, verdict);
        }

        let missing: Vec<ResolutionError> = batch
            .iter()
            .filter(|c| !verdicts.contains_key(&c.record.id))
            .map(|c| ResolutionError::LlmPartialResponse {
                email_id: c.record.id.clone(),
            })
            .collect();

        info!(
            batch = index,
            records = batch.len(),
            resolved = verdicts.len(),
            missing = missing.len(),
            attempts,
            %cost,
            "LLM batch finished"
        );

        if missing.is_empty() {
            BatchOutcome::Complete {
                verdicts,
                attempts,
                cost,
            }
        } else {
            for m in &missing {
                warn!(batch = index, error = %m, "LLM response incomplete");
            }
            BatchOutcome::Partial {
                verdicts,
                missing,
                attempts,
                cost,
            }
        }
    }
}

/// Transport problems are labelled as such; bad payloads keep their own text.
fn failure_reason(error: &LlmError) -> String {
    match error {
        LlmError::InvalidResponse { .. } | LlmError::Json(_) => error.to_string(),
        LlmError::RequestFailed { .. }
        | LlmError::RateLimited { .. }
        | LlmError::Timeout { .. }
        | LlmError::AuthFailed { .. } => ResolutionError::LlmTransportFailure {
            reason: error.to_string(),
        }
        .to_string(),
    }
}

/// Turn a raw model answer into a verdict, applying the protected floor.
fn to_verdict(raw_category: String, confidence: f32, reasoning: String, config: &PipelineConfig) -> LlmVerdict {
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let Ok(category) = raw_category.parse::<Category>() else {
        return LlmVerdict {
            category: Category::Unknown,
            confidence: 0.0,
            reasoning: format!("Model returned unrecognized category '{raw_category}'"),
        };
    };

    if category.is_protected() && confidence < config.protected_floor {
        return LlmVerdict {
            category: Category::Unknown,
            confidence,
            reasoning: format!(
                "Suggested {category} at {confidence:.2}, below the {:.2} floor for protected categories. {reasoning}",
                config.protected_floor
            ),
        };
    }

    LlmVerdict {
        category,
        confidence,
        reasoning,
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_request(batch: &[Candidate<'_>], config: &PipelineConfig) -> CompletionRequest {
    CompletionRequest::new(vec![
        ChatMessage::system(build_system_prompt()),
        ChatMessage::user(build_user_prompt(batch)),
    ])
    .with_temperature(config.temperature)
    .with_max_tokens(config.max_tokens)
}

fn build_system_prompt() -> String {
    "You are an email categorization engine. Classify each email into exactly one category.\n\n\
     Categories:\n\
     - \"spam\": unsolicited, deceptive or malicious mail\n\
     - \"marketing\": promotions, sales, product offers\n\
     - \"newsletter\": editorial content the user subscribed to\n\
     - \"notification\": automated alerts from apps and services\n\
     - \"social\": activity from social networks and communities\n\
     - \"transactional\": receipts, orders, shipping, account and security notices\n\
     - \"personal\": written by a person to the user\n\
     - \"important\": time-sensitive or high-stakes mail the user must not miss\n\
     - \"unknown\": not enough information\n\n\
     Respond with ONLY a JSON array, one object per email, in any order:\n\
     [{\"id\": \"...\", \"category\": \"...\", \"confidence\": 0.0, \"reasoning\": \"...\"}]\n\n\
     Rules:\n\
     - Include every email id exactly once\n\
     - Confidence is 0.0-1.0\n\
     - Use \"personal\" or \"important\" only when clearly warranted (confidence >= 0.8); otherwise use \"unknown\"\n\
     - Prior categorizations are hints, not answers\n\
     - Keep reasoning to one short sentence"
        .to_string()
}

fn build_user_prompt(batch: &[Candidate<'_>]) -> String {
    let mut prompt = String::with_capacity(256 * batch.len());
    prompt.push_str(&format!("Classify these {} emails:\n", batch.len()));

    for candidate in batch {
        let record = candidate.record;
        prompt.push_str(&format!("\n---\nid: {}\n", record.id));
        prompt.push_str(&format!("From: {}", record.sender.address));
        if let Some(ref name) = record.sender.name {
            prompt.push_str(&format!(" ({})", name));
        }
        prompt.push('\n');
        prompt.push_str(&format!("Subject: {}\n", record.subject));
        prompt.push_str(&format!("Snippet: {}\n", record.snippet));

        let signals = &record.signals;
        let mut flags = Vec::new();
        if signals.has_list_unsubscribe {
            flags.push("list-unsubscribe header");
        }
        if signals.has_precedence_bulk {
            flags.push("bulk precedence");
        }
        if signals.is_noreply {
            flags.push("noreply sender");
        }
        if signals.has_return_path_mismatch {
            flags.push("return-path mismatch");
        }
        if record.body.has_unsubscribe_text {
            flags.push("unsubscribe text in body");
        }
        if record.is_read {
            flags.push("already read");
        }
        if !flags.is_empty() {
            prompt.push_str(&format!("Signals: {}\n", flags.join(", ")));
        }
        prompt.push_str(&format!(
            "Body: {} chars, {} links, {} images\n",
            record.body.length, record.body.link_count, record.body.image_count
        ));

        if let Some((category, confidence)) = candidate.heuristic_guess {
            prompt.push_str(&format!("Heuristic guess: {category} ({confidence:.2})\n"));
        }
        if let Some(hint) = candidate.cache_hint {
            prompt.push_str(&format!(
                "Previously categorized sender as: {} ({:.2})\n",
                hint.category, hint.confidence
            ));
        }
    }

    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawVerdict {
    id: String,
    category: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawResponse {
    List(Vec<RawVerdict>),
    Wrapped { results: Vec<RawVerdict> },
}

fn parse_verdicts(raw: &str) -> Result<Vec<RawVerdict>, String> {
    let json = extract_json(raw);
    let parsed: RawResponse =
        serde_json::from_str(json).map_err(|e| format!("JSON parse error: {e}"))?;
    Ok(match parsed {
        RawResponse::List(items) => items,
        RawResponse::Wrapped { results } => results,
    })
}

/// Extract the JSON payload from model output (handles markdown fences and
/// surrounding prose).
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();

    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return trimmed;
    }

    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let inner = after[..end].trim();
                if inner.starts_with('[') || inner.starts_with('{') {
                    return inner;
                }
            }
        }
    }

    for (open, close) in [('[', ']'), ('{', '}')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
            && end > start
        {
            return &trimmed[start..=end];
        }
    }

    trimmed
}
