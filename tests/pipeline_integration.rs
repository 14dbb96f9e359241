//! Integration tests for the categorization pipeline.
//!
//! Each test wires a `Categorizer` to a real `SenderReputationCache` and a
//! stub LLM provider, then exercises the public contract end to end.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Notify;
use tokio::time::timeout;

use inbox_sweep::config::PipelineConfig;
use inbox_sweep::error::LlmError;
use inbox_sweep::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use inbox_sweep::pipeline::{
    ActionType, BodyShape, Categorizer, Category, CategoryCatalog, Correction, EmailRecord,
    EntrySource, FeedbackSink, HeaderSignals, ResolutionSource, Sender, SenderCache,
    SenderCacheEntry, SenderReputationCache,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Stub LLM provider (no real API calls).
///
/// Answers every requested id with the configured category. Call `n`
/// (zero-based) reports `100 * (n + 1)` input tokens and 50 output tokens.
struct StubLlm {
    category: Mutex<&'static str>,
    confidence: f32,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl StubLlm {
    fn new(category: &'static str, confidence: f32) -> Arc<Self> {
        Arc::new(Self {
            category: Mutex::new(category),
            confidence,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        let llm = Self::new("unknown", 0.0);
        llm.fail.store(true, Ordering::SeqCst);
        llm
    }

    fn answer_with(&self, category: &'static str) {
        *self.category.lock().unwrap() = category;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (dec!(0.00001), dec!(0.00002))
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(LlmError::RequestFailed {
                provider: "stub".into(),
                reason: "connection reset".into(),
            });
        }

        let category = *self.category.lock().unwrap();
        let items: Vec<String> = request
            .messages
            .iter()
            .flat_map(|m| m.content.lines())
            .filter_map(|l| l.strip_prefix("id: "))
            .map(|id| {
                format!(
                    r#"{{"id": "{id}", "category": "{category}", "confidence": {}, "reasoning": "stub"}}"#,
                    self.confidence
                )
            })
            .collect();

        Ok(CompletionResponse {
            content: format!("Here you go:\n[{}]", items.join(",\n")),
            input_tokens: 100 * (call as u32 + 1),
            output_tokens: 50,
            finish_reason: FinishReason::Stop,
            response_id: Some(format!("resp-{call}")),
        })
    }
}

/// Holds every call until released, so a test can act while the LLM is busy.
struct GatedLlm {
    inner: Arc<StubLlm>,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl LlmProvider for GatedLlm {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        self.inner.cost_per_token()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.complete(request).await
    }
}

fn test_config() -> PipelineConfig {
    PipelineConfig {
        retry_backoff: Duration::ZERO,
        ..Default::default()
    }
}

fn setup(llm: Arc<StubLlm>) -> (Arc<Categorizer>, FeedbackSink, Arc<SenderReputationCache>) {
    setup_with(llm, test_config())
}

fn setup_with(
    llm: Arc<StubLlm>,
    config: PipelineConfig,
) -> (Arc<Categorizer>, FeedbackSink, Arc<SenderReputationCache>) {
    let cache = Arc::new(SenderReputationCache::new());
    let categorizer = Categorizer::new(
        llm,
        cache.clone(),
        Arc::new(CategoryCatalog::default()),
        config,
    );
    (Arc::new(categorizer), FeedbackSink::new(cache.clone()), cache)
}

fn email(id: &str, address: &str, subject: &str, signals: HeaderSignals) -> EmailRecord {
    EmailRecord {
        id: id.into(),
        thread_id: format!("thread-{id}"),
        sender: Sender {
            address: address.into(),
            name: Some("Someone".into()),
            domain: address.split('@').nth(1).unwrap_or_default().into(),
        },
        subject: subject.into(),
        snippet: "Just wanted to follow up on what we talked about the other day, let me know".into(),
        date: Utc::now(),
        is_read: false,
        signals,
        body: BodyShape {
            length: 2400,
            link_count: 1,
            image_count: 0,
            has_unsubscribe_text: false,
        },
    }
}

fn plain(id: &str, address: &str) -> EmailRecord {
    email(id, address, "Quick question", HeaderSignals::default())
}

fn bulk_noreply() -> HeaderSignals {
    HeaderSignals {
        has_list_unsubscribe: true,
        has_precedence_bulk: true,
        is_noreply: true,
        has_return_path_mismatch: false,
    }
}

// ── Cardinality ─────────────────────────────────────────────────────

#[tokio::test]
async fn one_result_per_record_in_input_order() {
    let (categorizer, _, _) = setup(StubLlm::new("notification", 0.9));
    let records = vec![
        email("m1", "promo@shop.example", "40% off today", bulk_noreply()),
        plain("m2", "alice@example.com"),
        email("m3", "billing@store.example", "Your receipt", HeaderSignals::default()),
        plain("m4", "broken-address"),
        plain("m2", "bob@example.com"),
        email(
            "m5",
            "writer@substack.example",
            "Thoughts",
            HeaderSignals {
                has_list_unsubscribe: true,
                ..Default::default()
            },
        ),
    ];

    let out = categorizer.categorize(&records, "user-1").await.unwrap();

    assert_eq!(out.results.len(), records.len());
    for (result, record) in out.results.iter().zip(&records) {
        assert_eq!(result.email_id, record.id);
    }
    assert_eq!(out.stats.total(), records.len());
    assert_eq!(out.stats.invalid_records, 2);
}

// ── Protection ──────────────────────────────────────────────────────

#[tokio::test]
async fn protected_results_only_suggest_keep() {
    let (categorizer, _, _) = setup(StubLlm::new("important", 0.95));
    // Unsubscribe header without noreply falls through to the LLM tier.
    let signals = HeaderSignals {
        has_list_unsubscribe: true,
        has_precedence_bulk: true,
        ..Default::default()
    };
    let records: Vec<_> = (0..5)
        .map(|i| email(&format!("m{i}"), "ceo@corp.example", "Board meeting", signals))
        .collect();

    let out = categorizer.categorize(&records, "user-1").await.unwrap();

    for result in &out.results {
        assert_eq!(result.category, Category::Important);
        assert_eq!(result.suggested_actions.len(), 1);
        assert_eq!(result.suggested_actions[0].action_type, ActionType::Keep);
    }
}

#[tokio::test]
async fn unsure_personal_verdict_is_not_protected_as_personal() {
    let (categorizer, _, _) = setup(StubLlm::new("personal", 0.5));

    let out = categorizer
        .categorize(&[plain("m1", "maybe@example.com")], "user-1")
        .await
        .unwrap();

    assert_eq!(out.results[0].category, Category::Unknown);
    assert!(out.results[0]
        .suggested_actions
        .iter()
        .all(|a| !a.action_type.is_destructive()));
}

// ── Idempotence ─────────────────────────────────────────────────────

#[tokio::test]
async fn rerun_yields_identical_categories() {
    let (categorizer, _, _) = setup(StubLlm::new("social", 0.85));
    let records = vec![
        email("m1", "promo@shop.example", "Flash sale", bulk_noreply()),
        plain("m2", "friend@example.com"),
        email("m3", "billing@store.example", "Invoice 42", HeaderSignals::default()),
    ];

    let first = categorizer.categorize(&records, "user-1").await.unwrap();
    let second = categorizer.categorize(&records, "user-1").await.unwrap();

    let categories = |c: &inbox_sweep::pipeline::Categorization| {
        c.results.iter().map(|r| r.category).collect::<Vec<_>>()
    };
    assert_eq!(categories(&first), categories(&second));
}

// ── Corrections ─────────────────────────────────────────────────────

#[tokio::test]
async fn correction_is_visible_to_next_scan_without_llm() {
    let llm = StubLlm::new("notification", 0.9);
    let (categorizer, feedback, _) = setup(llm.clone());

    feedback
        .apply_correction("user-1", "boss@corp.example", Correction::Recategorize(Category::Important))
        .await
        .unwrap();

    let out = categorizer
        .categorize(&[plain("new-1", "boss@corp.example")], "user-1")
        .await
        .unwrap();

    let result = &out.results[0];
    assert_eq!(result.category, Category::Important);
    assert_eq!(result.confidence, 1.0);
    assert_eq!(result.source, ResolutionSource::UserOverride);
    assert_eq!(out.stats.resolved_by_cache, 1);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn bare_rejection_forces_re_resolution() {
    let llm = StubLlm::new("social", 0.9);
    let (categorizer, feedback, cache) = setup(llm.clone());

    let before = categorizer
        .categorize(&[plain("m1", "updates@app.example")], "user-1")
        .await
        .unwrap();
    assert_eq!(before.results[0].category, Category::Social);
    assert!(cache.lookup("user-1", "updates@app.example").await.unwrap().is_some());

    feedback
        .apply_correction("user-1", "updates@app.example", Correction::Reject)
        .await
        .unwrap();
    llm.answer_with("notification");

    let after = categorizer
        .categorize(&[plain("m2", "updates@app.example")], "user-1")
        .await
        .unwrap();

    let result = &after.results[0];
    assert!(!(result.source == ResolutionSource::Cache && result.category == Category::Social));
    assert_eq!(result.source, ResolutionSource::Llm);
    assert_eq!(result.category, Category::Notification);
    assert_eq!(llm.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejection_during_llm_call_is_not_overwritten() {
    let llm = Arc::new(GatedLlm {
        inner: StubLlm::new("social", 0.9),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let cache = Arc::new(SenderReputationCache::new());
    cache
        .upsert("user-1", "x@example.com", SenderCacheEntry::from_llm(Category::Social, 0.5))
        .await
        .unwrap();
    let categorizer = Arc::new(Categorizer::new(
        llm.clone(),
        cache.clone(),
        Arc::new(CategoryCatalog::default()),
        test_config(),
    ));
    let feedback = FeedbackSink::new(cache.clone());

    let scan = {
        let categorizer = categorizer.clone();
        tokio::spawn(async move {
            let records = vec![plain("m1", "x@example.com")];
            categorizer.categorize(&records, "user-1").await.map(|_| ())
        })
    };

    timeout(TEST_TIMEOUT, async {
        llm.entered.notified().await;
        feedback
            .apply_correction("user-1", "x@example.com", Correction::Reject)
            .await
            .unwrap();
        llm.release.notify_one();
        scan.await.unwrap().unwrap();
    })
    .await
    .expect("scan finished in time");

    assert!(cache.lookup("user-1", "x@example.com").await.unwrap().is_none());

    // A scan that starts after the rejection may cache again.
    let later = {
        let categorizer = categorizer.clone();
        tokio::spawn(async move {
            let records = vec![plain("m2", "x@example.com")];
            categorizer.categorize(&records, "user-1").await.map(|_| ())
        })
    };
    timeout(TEST_TIMEOUT, async {
        llm.entered.notified().await;
        llm.release.notify_one();
        later.await.unwrap().unwrap();
    })
    .await
    .expect("second scan finished in time");

    let entry = cache.lookup("user-1", "x@example.com").await.unwrap().unwrap();
    assert_eq!(entry.category, Category::Social);
    assert_eq!(entry.source, EntrySource::Llm);
}

#[tokio::test]
async fn scans_for_other_users_leave_override_alone() {
    let (categorizer, feedback, cache) = setup(StubLlm::new("marketing", 0.99));
    feedback
        .apply_correction("user-1", "friend@example.com", Correction::Recategorize(Category::Personal))
        .await
        .unwrap();
    categorizer
        .categorize(&[plain("m1", "friend@example.com")], "user-2")
        .await
        .unwrap();

    let entry = cache.lookup("user-1", "friend@example.com").await.unwrap().unwrap();
    assert_eq!(entry.category, Category::Personal);
    let other = cache.lookup("user-2", "friend@example.com").await.unwrap().unwrap();
    assert_eq!(other.category, Category::Marketing);
}

// ── Degradation ─────────────────────────────────────────────────────

#[tokio::test]
async fn failing_llm_degrades_whole_batch() {
    let llm = StubLlm::failing();
    let (categorizer, _, _) = setup(llm.clone());
    let records: Vec<_> = (0..4)
        .map(|i| plain(&format!("m{i}"), &format!("person{i}@example.com")))
        .collect();

    let out = categorizer.categorize(&records, "user-1").await.unwrap();

    assert_eq!(llm.calls(), 2);
    assert_eq!(out.stats.resolved_by_llm, 4);
    for result in &out.results {
        assert_eq!(result.category, Category::Unknown);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.source, ResolutionSource::Llm);
        assert!(result.reasoning.as_deref().is_some_and(|r| r.contains("failed")));
    }
}

#[tokio::test]
async fn failing_llm_does_not_affect_heuristic_results() {
    let (categorizer, _, _) = setup(StubLlm::failing());
    let records = vec![
        email("m1", "promo@shop.example", "Flash sale", bulk_noreply()),
        plain("m2", "friend@example.com"),
    ];

    let out = categorizer.categorize(&records, "user-1").await.unwrap();

    assert_eq!(out.results[0].category, Category::Marketing);
    assert_eq!(out.results[0].source, ResolutionSource::Heuristic);
    assert_eq!(out.results[1].category, Category::Unknown);
}

// ── Cost accounting ─────────────────────────────────────────────────

#[tokio::test]
async fn cost_is_sum_of_batch_costs() {
    let llm = StubLlm::new("notification", 0.9);
    let config = PipelineConfig {
        max_batch_size: 2,
        ..test_config()
    };
    let (categorizer, _, _) = setup_with(llm.clone(), config);
    let records: Vec<_> = (0..4)
        .map(|i| plain(&format!("m{i}"), &format!("bot{i}@app.example")))
        .collect();

    let out = categorizer.categorize(&records, "user-1").await.unwrap();

    // c1 = 100 * 0.00001 + 50 * 0.00002, c2 = 200 * 0.00001 + 50 * 0.00002
    let c1 = dec!(0.002);
    let c2 = dec!(0.003);
    assert_eq!(llm.calls(), 2);
    assert_eq!(out.stats.llm_calls, 2);
    assert_eq!(out.stats.llm_cost_usd, c1 + c2);
}

// ── Heuristic tier ──────────────────────────────────────────────────

#[tokio::test]
async fn bulk_noreply_sender_resolves_by_heuristic() {
    let llm = StubLlm::new("spam", 0.9);
    let (categorizer, _, _) = setup(llm.clone());

    let out = categorizer
        .categorize(
            &[email("m1", "promo@shop.example", "Hello", bulk_noreply())],
            "user-1",
        )
        .await
        .unwrap();

    let result = &out.results[0];
    assert!(matches!(result.category, Category::Marketing | Category::Newsletter));
    assert!(result.confidence >= 0.75);
    assert_eq!(result.source, ResolutionSource::Heuristic);
    assert_eq!(out.stats.resolved_by_heuristic, 1);
    assert_eq!(llm.calls(), 0);
}

// ── Concurrency ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn correction_survives_concurrent_scans() {
    let llm = StubLlm::new("notification", 0.9);
    let (categorizer, feedback, cache) = setup(llm);
    let feedback = Arc::new(feedback);

    let mut handles = Vec::new();
    for i in 0..16 {
        let categorizer = categorizer.clone();
        handles.push(tokio::spawn(async move {
            let records = vec![plain(&format!("scan-{i}"), "boss@corp.example")];
            categorizer.categorize(&records, "user-1").await.map(|_| ())
        }));
    }
    let correction = {
        let feedback = feedback.clone();
        tokio::spawn(async move {
            feedback
                .apply_correction("user-1", "boss@corp.example", Correction::Recategorize(Category::Important))
                .await
        })
    };

    timeout(TEST_TIMEOUT, async {
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        correction.await.unwrap().unwrap();
    })
    .await
    .expect("scans and correction finished in time");

    let entry = cache.lookup("user-1", "boss@corp.example").await.unwrap().unwrap();
    assert_eq!(entry.category, Category::Important);
    assert_eq!(entry.confidence, 1.0);
    assert_eq!(entry.source, EntrySource::UserOverride);

    let out = categorizer
        .categorize(&[plain("after", "boss@corp.example")], "user-1")
        .await
        .unwrap();
    assert_eq!(out.results[0].source, ResolutionSource::UserOverride);
    assert_eq!(out.results[0].category, Category::Important);
}

#[tokio::test]
async fn ids_are_unique_across_large_batch() {
    let (categorizer, _, _) = setup(StubLlm::new("social", 0.8));
    let records: Vec<_> = (0..120)
        .map(|i| plain(&format!("m{i}"), &format!("user{}@example.com", i % 7)))
        .collect();

    let out = categorizer.categorize(&records, "user-1").await.unwrap();

    let ids: HashSet<_> = out.results.iter().map(|r| r.email_id.as_str()).collect();
    assert_eq!(ids.len(), 120);
    assert_eq!(out.stats.resolved_by_llm, 120);
    assert_eq!(out.stats.llm_calls, 3);
}
