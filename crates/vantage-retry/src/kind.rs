use http::HeaderMap;

/// What a failed attempt looks like to the retry predicates.
#[derive(Debug, Clone, Copy)]
pub enum FailureKind<'a> {
    /// The remote answered with a non-success status.
    Status { status: u16, headers: &'a HeaderMap },
    /// Network or processing failure without a status. `transient` is the
    /// transport's own opinion when it has one.
    Transport { transient: Option<bool> },
    Cancelled,
    DeadlineExceeded,
    /// Non-recoverable; never retried.
    Fatal,
    Other,
}

impl FailureKind<'_> {
    pub fn status(&self) -> Option<u16> {
        match self {
            FailureKind::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        match self {
            FailureKind::Status { headers, .. } => {
                headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
            }
            _ => None,
        }
    }
}

/// Errors that can be retried describe themselves through [`FailureKind`].
pub trait Classify {
    fn kind(&self) -> FailureKind<'_>;
}

/// Selects which failures a predicate is consulted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindMatcher {
    Status,
    Transport,
    Any,
}

impl KindMatcher {
    pub fn matches(self, kind: &FailureKind<'_>) -> bool {
        match self {
            KindMatcher::Any => true,
            KindMatcher::Status => matches!(kind, FailureKind::Status { .. }),
            KindMatcher::Transport => matches!(kind, FailureKind::Transport { .. }),
        }
    }
}
