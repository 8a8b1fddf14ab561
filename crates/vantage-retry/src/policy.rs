use std::sync::Arc;
use std::time::Duration;

use crate::kind::{Classify, FailureKind, KindMatcher};
use crate::predicate::{
    default_classifier, FnPredicate, NoRetryMarker, RetryAfterHint, RetryPredicate,
    RetryableStatus, TransientIo, Verdict,
};

/// What to do after a failed attempt. Retries always re-invoke the operation
/// factory handed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Abort,
    RetryNow,
    RetryAfter(Duration),
}

/// Per-call counters the policy consults. One per executor call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts so far.
    pub failures: u32,
    /// Retries scheduled on the default schedule.
    pub default_retries: u32,
    /// Retries granted to failures nothing classified.
    pub unclassified_retries: u32,
}

/// Ordered predicate chain plus the numeric retry policy.
#[derive(Clone)]
pub struct RetryPolicy {
    predicates: Vec<(KindMatcher, Arc<dyn RetryPredicate>)>,
    max_unclassified_retries: u32,
    immediate_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: u32,
    max_retries: Option<u32>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field(
                "predicates",
                &self.predicates.iter().map(|(_, p)| p.name()).collect::<Vec<_>>(),
            )
            .field("max_unclassified_retries", &self.max_unclassified_retries)
            .field("immediate_retries", &self.immediate_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().with_default_predicates().build()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Never retries.
    pub fn none() -> Self {
        Self::builder().max_unclassified_retries(0).max_retries(0).build()
    }

    pub fn predicate_names(&self) -> Vec<&'static str> {
        self.predicates.iter().map(|(_, p)| p.name()).collect()
    }

    /// Decides what follows a failed attempt and updates `state`.
    pub fn decide<E: Classify>(&self, error: &E, state: &mut RetryState) -> RetryDecision {
        let kind = error.kind();
        state.failures = state.failures.saturating_add(1);

        let verdict = self
            .predicates
            .iter()
            .filter(|(matcher, _)| matcher.matches(&kind))
            .find_map(|(_, p)| p.decide(&kind))
            .or_else(|| default_classifier(&kind))
            .or_else(|| self.unclassified(&kind, state));

        let decision = match verdict {
            None | Some(Verdict::Abort) => return RetryDecision::Abort,
            Some(Verdict::RetryNow) => self.hinted(Duration::ZERO, state),
            Some(Verdict::RetryAfter(d)) => self.hinted(d, state),
            Some(Verdict::RetryDefault) => self.default_schedule(state),
        };

        match self.max_retries {
            Some(max) if state.failures > max => RetryDecision::Abort,
            _ => decision,
        }
    }

    fn unclassified(&self, kind: &FailureKind<'_>, state: &mut RetryState) -> Option<Verdict> {
        if matches!(kind, FailureKind::Fatal) {
            return None;
        }
        if state.unclassified_retries < self.max_unclassified_retries {
            state.unclassified_retries += 1;
            Some(Verdict::RetryDefault)
        } else {
            None
        }
    }

    fn default_schedule(&self, state: &mut RetryState) -> RetryDecision {
        let n = state.default_retries;
        state.default_retries = n.saturating_add(1);
        if n < self.immediate_retries {
            return RetryDecision::RetryNow;
        }
        RetryDecision::RetryAfter(self.backoff_delay(n - self.immediate_retries))
    }

    /// Delay asked for by a predicate. Counts against the same schedule as
    /// default retries: once the immediate retries are spent, the wait is never
    /// shorter than the backoff delay the schedule has reached.
    fn hinted(&self, hint: Duration, state: &mut RetryState) -> RetryDecision {
        let floor = match self.default_schedule(state) {
            RetryDecision::RetryAfter(d) => d,
            _ => Duration::ZERO,
        };
        match hint.max(floor) {
            d if d.is_zero() => RetryDecision::RetryNow,
            d => RetryDecision::RetryAfter(d),
        }
    }

    /// Delay of the `n`-th delayed retry: `initial * factor^n`, capped.
    pub fn backoff_delay(&self, n: u32) -> Duration {
        let factor = self.backoff_factor.max(1);
        let mut delay = self.initial_delay;
        for _ in 0..n {
            delay = delay.saturating_mul(factor);
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        delay.min(self.max_delay)
    }
}

pub struct RetryPolicyBuilder {
    predicates: Vec<(KindMatcher, Arc<dyn RetryPredicate>)>,
    max_unclassified_retries: u32,
    immediate_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: u32,
    max_retries: Option<u32>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            predicates: Vec::new(),
            max_unclassified_retries: 2,
            immediate_retries: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2,
            max_retries: None,
        }
    }
}

impl RetryPolicyBuilder {
    /// Registers the built-in chain: no-retry marker, retry-after hint,
    /// retryable status classes, transient I/O.
    pub fn with_default_predicates(self) -> Self {
        self.predicate(NoRetryMarker)
            .predicate(RetryAfterHint)
            .predicate(RetryableStatus::default())
            .predicate(TransientIo::default())
    }

    /// Appends a predicate; evaluation follows registration order.
    pub fn predicate<P: RetryPredicate + 'static>(mut self, predicate: P) -> Self {
        self.predicates.push((predicate.matcher(), Arc::new(predicate)));
        self
    }

    pub fn predicate_fn<F>(self, name: &'static str, matcher: KindMatcher, decide: F) -> Self
    where
        F: Fn(&FailureKind<'_>) -> Option<Verdict> + Send + Sync + 'static,
    {
        self.predicate(FnPredicate::new(name, matcher, decide))
    }

    pub fn max_unclassified_retries(mut self, n: u32) -> Self {
        self.max_unclassified_retries = n;
        self
    }

    pub fn immediate_retries(mut self, n: u32) -> Self {
        self.immediate_retries = n;
        self
    }

    pub fn initial_delay(mut self, d: Duration) -> Self {
        self.initial_delay = d;
        self
    }

    pub fn max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn backoff_factor(mut self, factor: u32) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Caps retries of any kind.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            predicates: self.predicates,
            max_unclassified_retries: self.max_unclassified_retries,
            immediate_retries: self.immediate_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay.max(self.initial_delay),
            backoff_factor: self.backoff_factor,
            max_retries: self.max_retries,
        }
    }
}
