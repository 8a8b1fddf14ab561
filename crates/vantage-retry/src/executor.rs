use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use vantage_common::Deadline;

use crate::kind::Classify;
use crate::policy::{RetryDecision, RetryPolicy, RetryState};

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s): {error}")]
    Aborted { error: E, attempts: u32 },
    #[error("deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { last: Option<E>, attempts: u32 },
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Aborted { attempts, .. }
            | RetryError::DeadlineExceeded { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Aborted { error, .. } => Some(error),
            RetryError::DeadlineExceeded { last, .. } => last.as_ref(),
            RetryError::Cancelled { .. } => None,
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, RetryError::DeadlineExceeded { .. })
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, the policy aborts, the deadline passes or
    /// `cancel` fires. `op` receives the zero-based attempt number and is
    /// re-invoked for every retry. A retry whose delay would end past the
    /// deadline is not scheduled.
    pub async fn call<T, E, F, Fut>(
        &self,
        deadline: Deadline,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut state = RetryState::default();
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            if deadline.is_expired() {
                return Err(RetryError::DeadlineExceeded {
                    last: None,
                    attempts: attempt,
                });
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt + 1 });
                }
                r = tokio::time::timeout_at(deadline.instant(), op(attempt)) => r,
            };
            attempt += 1;

            let error = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_elapsed) => {
                    return Err(RetryError::DeadlineExceeded {
                        last: None,
                        attempts: attempt,
                    })
                }
            };

            let delay = match self.decide(&error, &mut state) {
                RetryDecision::Abort => {
                    return Err(RetryError::Aborted {
                        error,
                        attempts: attempt,
                    })
                }
                RetryDecision::RetryNow => std::time::Duration::ZERO,
                RetryDecision::RetryAfter(d) => d,
            };

            if !deadline.admits(delay) || (delay.is_zero() && deadline.is_expired()) {
                return Err(RetryError::DeadlineExceeded {
                    last: Some(error),
                    attempts: attempt,
                });
            }

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(RetryError::Cancelled { attempts: attempt });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
