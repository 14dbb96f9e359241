//! Resolution orchestrator — runs the heuristic → cache → LLM waterfall.
//!
//! Every record moves through
//! `Unclassified → HeuristicTried → CacheTried → LlmQueued → Resolved`,
//! stopping at the first confident tier. Per-record failures never escape:
//! the output always holds one result per input record, in input order.
//!
//! The sender cache is read for every valid record, not only the ones the
//! heuristic left open, so a user override outranks a confident heuristic.
//!
//! **Core invariant:** `personal` and `important` results carry exactly one
//! action, `keep`. It is enforced here, after every tier has run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, ResolutionError};
use crate::llm::provider::LlmProvider;
use crate::pipeline::cache::{SenderCache, UpsertOutcome};
use crate::pipeline::catalog::{CategoryCatalog, enforce_protection};
use crate::pipeline::heuristics::HeuristicClassifier;
use crate::pipeline::resolver::{BatchOutcome, Candidate, LlmResolver, LlmVerdict};
use crate::pipeline::types::{
    BatchStats, Categorization, CategorizationResult, Category, EmailRecord, EntrySource,
    ResolutionSource, SenderCacheEntry, normalize_address,
};

/// Which counter a resolved record lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Heuristic,
    Cache,
    Llm,
    Invalid,
    Cancelled,
}

#[derive(Debug, Clone)]
struct Resolved {
    category: Category,
    confidence: f32,
    source: ResolutionSource,
    reasoning: Option<String>,
    tier: Tier,
    degraded: bool,
}

impl Resolved {
    fn heuristic(category: Category, confidence: f32) -> Self {
        Self {
            category,
            confidence,
            source: ResolutionSource::Heuristic,
            reasoning: None,
            tier: Tier::Heuristic,
            degraded: false,
        }
    }

    fn cached(entry: &SenderCacheEntry) -> Self {
        let source = match entry.source {
            EntrySource::UserOverride => ResolutionSource::UserOverride,
            EntrySource::Llm => ResolutionSource::Cache,
        };
        Self {
            category: entry.category,
            confidence: entry.confidence,
            source,
            reasoning: None,
            tier: Tier::Cache,
            degraded: false,
        }
    }

    fn llm(verdict: LlmVerdict) -> Self {
        Self {
            category: verdict.category,
            confidence: verdict.confidence,
            source: ResolutionSource::Llm,
            reasoning: Some(verdict.reasoning).filter(|r| !r.is_empty()),
            tier: Tier::Llm,
            degraded: false,
        }
    }

    /// LLM tier could not answer; surface as `unknown` for review.
    fn llm_degraded(reason: String) -> Self {
        Self {
            category: Category::Unknown,
            confidence: 0.0,
            source: ResolutionSource::Llm,
            reasoning: Some(reason),
            tier: Tier::Llm,
            degraded: true,
        }
    }

    fn cancelled() -> Self {
        Self {
            tier: Tier::Cancelled,
            degraded: false,
            ..Self::llm_degraded("Scan cancelled before this email was classified".to_string())
        }
    }

    fn invalid() -> Self {
        Self {
            tier: Tier::Invalid,
            ..Self::heuristic(Category::Unknown, 0.0)
        }
    }
}

/// Per-record position in the waterfall.
#[derive(Debug, Clone)]
enum RecordState {
    Unclassified,
    HeuristicTried {
        guess: (Category, f32),
    },
    CacheTried {
        guess: (Category, f32),
        hint: Option<SenderCacheEntry>,
    },
    LlmQueued,
    Resolved(Resolved),
}

/// Runs the full categorization pipeline for one user's batch.
pub struct Categorizer {
    heuristics: HeuristicClassifier,
    cache: Arc<dyn SenderCache>,
    resolver: LlmResolver,
    catalog: Arc<CategoryCatalog>,
    config: PipelineConfig,
}

impl Categorizer {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        cache: Arc<dyn SenderCache>,
        catalog: Arc<CategoryCatalog>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            heuristics: HeuristicClassifier::new(),
            cache,
            resolver: LlmResolver::new(llm, config.clone()),
            catalog,
            config,
        }
    }

    /// Categorize `records` for `user_id`.
    ///
    /// Returns one result per record, in input order. The only error is
    /// `PipelineError::Unavailable`, raised when the LLM tier failed outright
    /// and the sender cache was also unreachable; it still carries the full
    /// degraded result set.
    pub async fn categorize(
        &self,
        records: &[EmailRecord],
        user_id: &str,
    ) -> Result<Categorization, PipelineError> {
        self.categorize_with_cancel(records, user_id, &CancellationToken::new())
            .await
    }

    /// Like `categorize`, but stops dispatching LLM batches once `cancel`
    /// fires. Calls already in flight finish and are still billed.
    pub async fn categorize_with_cancel(
        &self,
        records: &[EmailRecord],
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Categorization, PipelineError> {
        let span = info_span!("categorize", scan_id = %Uuid::new_v4(), user_id, records = records.len());
        self.run(records, user_id, cancel).instrument(span).await
    }

    async fn run(
        &self,
        records: &[EmailRecord],
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Categorization, PipelineError> {
        let mut states = vec![RecordState::Unclassified; records.len()];

        // Step 0: reject malformed records
        let mut seen = HashSet::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            if let Err(e) = validate(record, &mut seen) {
                warn!(error = %e, "Skipping invalid record");
                states[i] = RecordState::Resolved(Resolved::invalid());
            }
        }

        // Step 1: heuristics (no I/O)
        for (state, record) in states.iter_mut().zip(records) {
            if matches!(state, RecordState::Unclassified) {
                *state = RecordState::HeuristicTried {
                    guess: self.heuristics.classify(record),
                };
            }
        }

        // Step 2: sender cache. Looked up for every valid record so a user
        // override beats even a confident heuristic.
        let observed_at = Utc::now();
        let pending: Vec<usize> = states
            .iter()
            .enumerate()
            .filter(|(_, state)| matches!(state, RecordState::HeuristicTried { .. }))
            .map(|(i, _)| i)
            .collect();
        let lookups = join_all(
            pending
                .iter()
                .map(|&i| self.cache.lookup(user_id, &records[i].sender.address)),
        )
        .await;

        let mut cache_unavailable = false;
        for (i, lookup) in pending.into_iter().zip(lookups) {
            let RecordState::HeuristicTried { guess } = &states[i] else {
                continue;
            };
            let guess = *guess;
            let heuristic_confident = guess.1 >= self.config.confidence_threshold;

            states[i] = match lookup {
                Ok(Some(entry)) if entry.source == EntrySource::UserOverride => {
                    RecordState::Resolved(Resolved::cached(&entry))
                }
                _ if heuristic_confident => RecordState::Resolved(Resolved::heuristic(guess.0, guess.1)),
                Ok(Some(entry)) if entry.confidence >= self.config.confidence_threshold => {
                    RecordState::Resolved(Resolved::cached(&entry))
                }
                Ok(hint) => RecordState::CacheTried { guess, hint },
                Err(e) => {
                    cache_unavailable = true;
                    let e = ResolutionError::CacheUnavailable {
                        reason: e.to_string(),
                    };
                    warn!(error = %e, "Treating sender cache failure as a miss");
                    RecordState::CacheTried { guess, hint: None }
                }
            };
        }

        // Step 3: LLM for everything still open
        let mut candidates = Vec::new();
        for (i, state) in states.iter().enumerate() {
            if let RecordState::CacheTried { guess, hint } = state {
                candidates.push((i, *guess, hint.clone()));
            }
        }

        let outcomes = if candidates.is_empty() {
            Vec::new()
        } else {
            let queued: Vec<Candidate<'_>> = candidates
                .iter()
                .map(|(i, guess, hint)| Candidate {
                    record: &records[*i],
                    heuristic_guess: (guess.0 != Category::Unknown).then_some(*guess),
                    cache_hint: hint.as_ref(),
                })
                .collect();
            for (i, _, _) in &candidates {
                states[*i] = RecordState::LlmQueued;
            }
            self.resolver.resolve(&queued, cancel).await
        };

        let mut stats = BatchStats::default();
        let mut llm_failed = false;
        let mut llm_succeeded = false;
        let mut verdicts: HashMap<String, LlmVerdict> = HashMap::new();
        let mut degraded: HashMap<String, Resolved> = HashMap::new();

        for outcome in outcomes {
            stats.llm_calls += outcome.attempts() as usize;
            stats.llm_cost_usd += outcome.cost();

            match outcome {
                BatchOutcome::Complete { verdicts: v, .. } => {
                    llm_succeeded = true;
                    verdicts.extend(v);
                }
                BatchOutcome::Partial { verdicts: v, missing, .. } => {
                    llm_succeeded = true;
                    verdicts.extend(v);
                    for error in missing {
                        if let ResolutionError::LlmPartialResponse { email_id } = &error {
                            degraded.insert(email_id.clone(), Resolved::llm_degraded(error.to_string()));
                        }
                    }
                }
                BatchOutcome::Failed { email_ids, error, .. } => {
                    llm_failed = true;
                    for id in email_ids {
                        degraded.insert(id, Resolved::llm_degraded(error.to_string()));
                    }
                }
                BatchOutcome::Skipped { email_ids } => {
                    for id in email_ids {
                        degraded.insert(id, Resolved::cancelled());
                    }
                }
            }
        }

        for (state, record) in states.iter_mut().zip(records) {
            if !matches!(state, RecordState::LlmQueued) {
                continue;
            }
            let resolved = match verdicts.get(&record.id) {
                Some(verdict) => Resolved::llm(verdict.clone()),
                None => degraded.remove(&record.id).unwrap_or_else(|| {
                    Resolved::llm_degraded(
                        ResolutionError::LlmPartialResponse {
                            email_id: record.id.clone(),
                        }
                        .to_string(),
                    )
                }),
            };
            *state = RecordState::Resolved(resolved);
        }

        self.write_back(user_id, records, &states, observed_at).await;

        // Step 4: build results and enforce protection
        let mut results = Vec::with_capacity(records.len());
        for (state, record) in states.into_iter().zip(records) {
            let resolved = match state {
                RecordState::Resolved(resolved) => resolved,
                other => {
                    // Every path above ends in Resolved; keep the output complete regardless.
                    error!(id = %record.id, state = ?other, "Record left unresolved");
                    Resolved::llm_degraded("Record was not resolved".to_string())
                }
            };

            match resolved.tier {
                Tier::Heuristic => stats.resolved_by_heuristic += 1,
                Tier::Cache => stats.resolved_by_cache += 1,
                Tier::Llm => stats.resolved_by_llm += 1,
                Tier::Invalid => stats.invalid_records += 1,
                Tier::Cancelled => stats.cancelled_records += 1,
            }
            if resolved.degraded {
                stats.degraded_records += 1;
            }

            let mut result = CategorizationResult {
                email_id: record.id.clone(),
                category: resolved.category,
                confidence: resolved.confidence,
                source: resolved.source,
                reasoning: resolved.reasoning,
                suggested_actions: self
                    .catalog
                    .suggested_actions(resolved.category, &record.signals),
            };
            if enforce_protection(&mut result) {
                warn!(id = %result.email_id, category = %result.category, "Replaced actions on protected result");
            }
            debug!(
                id = %result.email_id,
                category = %result.category,
                confidence = result.confidence,
                source = ?result.source,
                "Email categorized"
            );
            results.push(result);
        }

        info!(
            heuristic = stats.resolved_by_heuristic,
            cache = stats.resolved_by_cache,
            llm = stats.resolved_by_llm,
            invalid = stats.invalid_records,
            cancelled = stats.cancelled_records,
            degraded = stats.degraded_records,
            llm_calls = stats.llm_calls,
            llm_cost_usd = %stats.llm_cost_usd,
            "Categorization complete"
        );

        let categorization = Categorization { results, stats };

        if llm_failed && !llm_succeeded && cache_unavailable {
            error!("LLM tier and sender cache both unavailable");
            return Err(PipelineError::Unavailable {
                reason: "classification service and sender cache both unreachable".to_string(),
                partial: Box::new(categorization),
            });
        }

        Ok(categorization)
    }

    /// Remember confident LLM answers per sender (best one wins).
    ///
    /// Entries are stamped with `observed_at`, when this scan read the cache,
    /// so a correction made while the LLM was running is not overwritten.
    async fn write_back(
        &self,
        user_id: &str,
        records: &[EmailRecord],
        states: &[RecordState],
        observed_at: DateTime<Utc>,
    ) {
        let mut best: HashMap<String, (Category, f32)> = HashMap::new();
        for (state, record) in states.iter().zip(records) {
            let RecordState::Resolved(resolved) = state else {
                continue;
            };
            if resolved.tier != Tier::Llm
                || resolved.degraded
                || resolved.category == Category::Unknown
                || resolved.confidence <= 0.0
            {
                continue;
            }
            let sender = normalize_address(&record.sender.address);
            let slot = best.entry(sender).or_insert((resolved.category, resolved.confidence));
            if resolved.confidence > slot.1 {
                *slot = (resolved.category, resolved.confidence);
            }
        }

        for (sender, (category, confidence)) in best {
            match self
                .cache
                .upsert(
                    user_id,
                    &sender,
                    SenderCacheEntry::from_llm_at(category, confidence, observed_at),
                )
                .await
            {
                Ok(UpsertOutcome::KeptOverride) => {
                    debug!(sender = %sender, "Sender has a user override; LLM result not cached")
                }
                Ok(UpsertOutcome::Stale) => {
                    debug!(sender = %sender, "Sender changed during scan; LLM result not cached")
                }
                Ok(_) => {}
                Err(e) => warn!(sender = %sender, error = %e, "Failed to cache LLM result"),
            }
        }
    }
}

fn validate<'a>(record: &'a EmailRecord, seen: &mut HashSet<&'a str>) -> Result<(), ResolutionError> {
    let invalid = |reason: &str| ResolutionError::InvalidRecord {
        email_id: record.id.clone(),
        reason: reason.to_string(),
    };

    if record.id.trim().is_empty() {
        return Err(invalid("empty email id"));
    }
    let address = record.sender.address.trim();
    if address.is_empty() || !address.contains('@') {
        return Err(invalid("sender address is not an email address"));
    }
    if !seen.insert(record.id.as_str()) {
        return Err(invalid("duplicate email id in batch"));
    }
    Ok(())
}
