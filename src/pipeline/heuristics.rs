//! Header/heuristic classifier — the first, free tier.
//!
//! Looks only at derived header booleans, the subject line, the sender
//! domain and the body shape. No I/O, never fails. Rules, first match wins:
//! 1. noreply + bulk precedence + List-Unsubscribe → marketing or newsletter (0.9)
//! 2. List-Unsubscribe without bulk precedence → newsletter (0.75)
//! 3. receipt-shaped mail with no unsubscribe signal → transactional (0.6)
//! 4. otherwise → unknown (0.0)
//!
//! This tier never returns `personal` or `important`.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::{Category, EmailRecord};

pub const BULK_SENDER_CONFIDENCE: f32 = 0.9;
pub const LIST_UNSUBSCRIBE_CONFIDENCE: f32 = 0.75;
pub const TRANSACTIONAL_CONFIDENCE: f32 = 0.6;

/// Snippets shorter than this count as "short" for receipt detection.
const SHORT_SNIPPET_CHARS: usize = 60;

/// At least one link per this many body characters counts as link-dense.
const CHARS_PER_LINK: u32 = 400;

/// Images at or above this count push a bulk sender towards marketing.
const MARKETING_IMAGE_COUNT: u32 = 6;

static MARKETING_SUBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\bsale\b|\d+\s?% off|\bdeals?\b|\bdiscount|\boffer\b|\bpromo|\bcoupon|limited time|free shipping|\bshop now\b|\bbuy\b|last chance|\bexclusive\b|save \$?\d+)",
    )
    .expect("marketing subject regex")
});

static NEWSLETTER_SUBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(newsletter|\bdigest\b|\bweekly\b|\bmonthly\b|\bedition\b|\bissue\s*#?\d+|\broundup\b|\bthis week in\b|\bbulletin\b)",
    )
    .expect("newsletter subject regex")
});

static MARKETING_DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(^|[.\-])(promo|promotions|deals|offers|marketing|shop|store|sales)([.\-]|$)")
        .expect("marketing domain regex")
});

static TRANSACTIONAL_SUBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(receipt|your order|order (confirmation|#)|invoice|payment (received|confirmed)|has shipped|out for delivery|password reset|verification code|security code|confirm your|booking confirmation|statement is ready)",
    )
    .expect("transactional subject regex")
});

/// Stateless first-tier classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify one record. Total: always returns a category and confidence.
    pub fn classify(&self, record: &EmailRecord) -> (Category, f32) {
        let signals = &record.signals;

        let (category, confidence, rule) = if signals.is_noreply
            && signals.has_precedence_bulk
            && signals.has_list_unsubscribe
        {
            (bulk_category(record), BULK_SENDER_CONFIDENCE, "bulk_noreply")
        } else if signals.has_list_unsubscribe && !signals.has_precedence_bulk {
            (Category::Newsletter, LIST_UNSUBSCRIBE_CONFIDENCE, "list_unsubscribe")
        } else if is_transactional_shape(record) {
            (Category::Transactional, TRANSACTIONAL_CONFIDENCE, "transactional_shape")
        } else {
            (Category::Unknown, 0.0, "no_signal")
        };

        debug!(
            id = %record.id,
            sender = %record.sender.address,
            rule,
            category = %category,
            confidence,
            "Heuristic classification"
        );
        (category, confidence)
    }
}

/// Tell marketing from newsletter for a confirmed bulk sender.
///
/// Subject keywords decide first, newsletter keywords before marketing ones.
/// Then image-heavy bodies and shop-like domains lean marketing. Anything
/// still ambiguous is a newsletter.
fn bulk_category(record: &EmailRecord) -> Category {
    if NEWSLETTER_SUBJECT.is_match(&record.subject) {
        return Category::Newsletter;
    }
    if MARKETING_SUBJECT.is_match(&record.subject) {
        return Category::Marketing;
    }
    if record.body.image_count >= MARKETING_IMAGE_COUNT
        || MARKETING_DOMAIN.is_match(&record.sender.domain)
    {
        return Category::Marketing;
    }
    Category::Newsletter
}

fn is_transactional_shape(record: &EmailRecord) -> bool {
    if record.signals.has_list_unsubscribe || record.body.has_unsubscribe_text {
        return false;
    }
    if TRANSACTIONAL_SUBJECT.is_match(&record.subject) {
        return true;
    }

    let short_snippet = record.snippet.chars().count() < SHORT_SNIPPET_CHARS;
    let body = &record.body;
    let link_dense = body.length > 0
        && body.link_count > 0
        && body.link_count.saturating_mul(CHARS_PER_LINK) >= body.length;

    short_snippet && link_dense
}
