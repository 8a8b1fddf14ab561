//! Retry decisions for outbound peer calls.
//!
//! A [`RetryPolicy`] holds an ordered chain of partial predicates, each paired
//! with the failure kinds it is consulted for. The first predicate with an
//! opinion wins; when all abstain a default classifier decides, and failures
//! nothing recognises get a small bounded number of retries before aborting.
//! [`RetryPolicy::call`] drives an operation under that policy without ever
//! sleeping past the request deadline.

pub mod executor;
pub mod kind;
pub mod policy;
pub mod predicate;

pub use executor::RetryError;
pub use kind::{Classify, FailureKind, KindMatcher};
pub use policy::{RetryDecision, RetryPolicy, RetryPolicyBuilder, RetryState};
pub use predicate::{
    default_classifier, FnPredicate, NoRetryMarker, RetryAfterHint, RetryPredicate,
    RetryableStatus, TransientClassifier, TransientIo, Verdict,
};
