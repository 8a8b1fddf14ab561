use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use vantage_common::headers;

use crate::kind::{FailureKind, KindMatcher};

/// Outcome of a single predicate that has an opinion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Abort,
    RetryNow,
    RetryAfter(Duration),
    /// Retry on the policy's default schedule (immediate retries, then backoff).
    RetryDefault,
}

/// A partial retry rule. Returns `None` to pass the failure to the next rule.
pub trait RetryPredicate: Send + Sync {
    /// Failures this predicate is consulted for.
    fn matcher(&self) -> KindMatcher;

    fn decide(&self, kind: &FailureKind<'_>) -> Option<Verdict>;

    /// Human-readable name for diagnostics.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// NoRetryMarker: server says retrying is pointless
// ---------------------------------------------------------------------------

pub struct NoRetryMarker;

impl RetryPredicate for NoRetryMarker {
    fn matcher(&self) -> KindMatcher {
        KindMatcher::Status
    }

    fn decide(&self, kind: &FailureKind<'_>) -> Option<Verdict> {
        kind.header(headers::NO_RETRY).map(|_| Verdict::Abort)
    }

    fn name(&self) -> &'static str {
        "no_retry_marker"
    }
}

// ---------------------------------------------------------------------------
// RetryAfterHint: `Retry-After` as delta seconds or an HTTP date
// ---------------------------------------------------------------------------

pub struct RetryAfterHint;

impl RetryAfterHint {
    pub fn parse(value: &str, now: DateTime<Utc>) -> Option<Duration> {
        let value = value.trim();
        if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
            return value.parse::<u64>().ok().map(Duration::from_secs);
        }
        let at = DateTime::parse_from_rfc2822(value).ok()?;
        Some(
            at.with_timezone(&Utc)
                .signed_duration_since(now)
                .to_std()
                .unwrap_or(Duration::ZERO),
        )
    }
}

impl RetryPredicate for RetryAfterHint {
    fn matcher(&self) -> KindMatcher {
        KindMatcher::Status
    }

    fn decide(&self, kind: &FailureKind<'_>) -> Option<Verdict> {
        let raw = kind.header(headers::RETRY_AFTER)?;
        Self::parse(raw, Utc::now()).map(Verdict::RetryAfter)
    }

    fn name(&self) -> &'static str {
        "retry_after_hint"
    }
}

// ---------------------------------------------------------------------------
// RetryableStatus: fixed retryable set; other 4xx abort; the rest abstain
// ---------------------------------------------------------------------------

pub struct RetryableStatus {
    retryable: BTreeSet<u16>,
}

impl RetryableStatus {
    pub const DEFAULT_CODES: [u16; 14] = [
        408, 409, 419, 420, 423, 429, 440, 449, 503, 504, 509, 522, 524, 599,
    ];

    pub fn new(codes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            retryable: codes.into_iter().collect(),
        }
    }
}

impl Default for RetryableStatus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CODES)
    }
}

impl RetryPredicate for RetryableStatus {
    fn matcher(&self) -> KindMatcher {
        KindMatcher::Status
    }

    fn decide(&self, kind: &FailureKind<'_>) -> Option<Verdict> {
        let status = kind.status()?;
        if self.retryable.contains(&status) {
            Some(Verdict::RetryDefault)
        } else if (400..500).contains(&status) {
            Some(Verdict::Abort)
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        "retryable_status"
    }
}

// ---------------------------------------------------------------------------
// TransientIo: transport failures, judged by a pluggable classifier
// ---------------------------------------------------------------------------

pub type TransientClassifier = Arc<dyn Fn(&FailureKind<'_>) -> Option<bool> + Send + Sync>;

pub struct TransientIo {
    classifier: TransientClassifier,
}

impl TransientIo {
    pub fn new(classifier: TransientClassifier) -> Self {
        Self { classifier }
    }
}

impl Default for TransientIo {
    fn default() -> Self {
        Self::new(Arc::new(|kind| match kind {
            FailureKind::Transport { transient } => *transient,
            _ => None,
        }))
    }
}

impl RetryPredicate for TransientIo {
    fn matcher(&self) -> KindMatcher {
        KindMatcher::Transport
    }

    fn decide(&self, kind: &FailureKind<'_>) -> Option<Verdict> {
        match (self.classifier)(kind)? {
            true => Some(Verdict::RetryDefault),
            false => Some(Verdict::Abort),
        }
    }

    fn name(&self) -> &'static str {
        "transient_io"
    }
}

// ---------------------------------------------------------------------------
// FnPredicate: ad-hoc rule from a closure
// ---------------------------------------------------------------------------

pub struct FnPredicate<F> {
    name: &'static str,
    matcher: KindMatcher,
    decide: F,
}

impl<F> FnPredicate<F>
where
    F: Fn(&FailureKind<'_>) -> Option<Verdict> + Send + Sync,
{
    pub fn new(name: &'static str, matcher: KindMatcher, decide: F) -> Self {
        Self {
            name,
            matcher,
            decide,
        }
    }
}

impl<F> RetryPredicate for FnPredicate<F>
where
    F: Fn(&FailureKind<'_>) -> Option<Verdict> + Send + Sync,
{
    fn matcher(&self) -> KindMatcher {
        self.matcher
    }

    fn decide(&self, kind: &FailureKind<'_>) -> Option<Verdict> {
        (self.decide)(kind)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Last resort once every predicate abstained: is this kind of failure
/// generally known to be transient?
pub fn default_classifier(kind: &FailureKind<'_>) -> Option<Verdict> {
    match kind {
        FailureKind::Fatal | FailureKind::Cancelled | FailureKind::DeadlineExceeded => {
            Some(Verdict::Abort)
        }
        FailureKind::Transport {
            transient: Some(true),
        } => Some(Verdict::RetryDefault),
        FailureKind::Transport {
            transient: Some(false),
        } => Some(Verdict::Abort),
        _ => None,
    }
}
