use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use vantage_common::{ClusterInfo, ExecutionContext, Order, Outcome};
use vantage_retry::{Classify, FailureKind, RetryError, RetryPolicy};

use crate::merge::{BoundedMerge, MergeKey};
use crate::transport::{RemoteError, RemoteRequest, RemoteTransport};

pub type ParticipantError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("limit parameter must be non-negative: {0}")]
    InvalidLimit(i64),
    #[error("deadline exceeded with {pending} participant(s) outstanding")]
    DeadlineExceeded { pending: usize },
    #[error("participant {participant} failed: {source}")]
    Participant {
        participant: String,
        #[source]
        source: ParticipantError,
    },
    #[error("participant {participant} hit a non-recoverable error: {message}")]
    Fatal { participant: String, message: String },
}

impl AggregateError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, AggregateError::InvalidLimit(_))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, AggregateError::DeadlineExceeded { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AggregateError::Fatal { .. })
    }
}

/// Path and query sent to every peer of a fan-out.
#[derive(Debug, Clone, Default)]
pub struct PeerQuery {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl PeerQuery {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn param(mut self, name: &str, value: impl ToString) -> Self {
        self.set(name, value.to_string());
        self
    }

    pub fn param_opt(self, name: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.param(name, v),
            None => self,
        }
    }

    fn set(&mut self, name: &str, value: String) {
        match self.query.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => self.query.push((name.to_string(), value)),
        }
    }
}

enum ParticipantFailure {
    Local(ParticipantError),
    Remote(RetryError<RemoteError>),
    Panicked(String),
}

type Joined<T> = (String, Result<T, ParticipantFailure>);

/// Runs one query on the local node and on every peer, concurrently.
///
/// All-or-nothing: the first participant failure cancels the rest and fails
/// the whole call. Peer calls go through the retry policy and never outlive
/// the context deadline.
#[derive(Clone)]
pub struct Aggregator {
    transport: Arc<dyn RemoteTransport>,
    policy: Arc<RetryPolicy>,
}

impl Aggregator {
    pub fn new(transport: Arc<dyn RemoteTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Bounded ordered merge of local and peer results. `limit == 0` returns
    /// nothing without calling anyone; `limit < 0` is a client error. The
    /// `limit` and `order` query parameters sent to peers are set here.
    pub async fn aggregate<T, L>(
        &self,
        ctx: &ExecutionContext,
        limit: i64,
        order: Order,
        cluster: &ClusterInfo,
        query: PeerQuery,
        local: L,
    ) -> Result<Vec<T>, AggregateError>
    where
        T: MergeKey + DeserializeOwned + Send + 'static,
        L: Future<Output = Result<Vec<T>, ParticipantError>> + Send + 'static,
    {
        if limit < 0 {
            return Err(AggregateError::InvalidLimit(limit));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let query = query.param("limit", limit).param("order", order);

        let merged = self
            .fan_out_fold(
                ctx,
                cluster,
                query,
                local,
                BoundedMerge::new(limit, order),
                |mut acc, part: Vec<T>| {
                    acc.extend(part);
                    acc
                },
            )
            .await?;
        Ok(merged.into_sorted())
    }

    /// Fan-out with a caller-supplied fold. `fold` sees each participant's
    /// result once, in completion order, so it must be commutative.
    pub async fn fan_out_fold<T, A, L, F>(
        &self,
        ctx: &ExecutionContext,
        cluster: &ClusterInfo,
        query: PeerQuery,
        local: L,
        init: A,
        mut fold: F,
    ) -> Result<A, AggregateError>
    where
        T: DeserializeOwned + Send + 'static,
        L: Future<Output = Result<T, ParticipantError>> + Send + 'static,
        F: FnMut(A, T) -> A,
    {
        let _span = ctx.span("fan_out");
        let deadline = ctx.deadline();
        let cancel = CancellationToken::new();
        let _cancel_on_exit = cancel.clone().drop_guard();

        let mut tasks: JoinSet<Joined<T>> = JoinSet::new();
        let mut children: HashMap<String, ExecutionContext> = HashMap::new();

        let local_name = format!("local:{}", cluster.local_node_id);
        children.insert(local_name.clone(), ctx.child(local_name.clone()));
        tasks.spawn(guarded(local_name, local.map(|r| r.map_err(ParticipantFailure::Local))));

        for peer in &cluster.peers {
            let name = format!("peer:{}", peer.node_id);
            children.insert(name.clone(), ctx.child(name.clone()));
            let request = RemoteRequest {
                base_url: cluster.peer_base_url(peer),
                path: query.path.clone(),
                query: query.query.clone(),
                trace_id: ctx.id().to_string(),
                deadline,
            };
            let transport = self.transport.clone();
            let policy = self.policy.clone();
            let cancel = cancel.clone();
            tasks.spawn(guarded(name, async move {
                policy
                    .call(deadline, &cancel, |_attempt| {
                        let transport = transport.clone();
                        let request = request.clone();
                        async move { fetch_json::<T>(transport.as_ref(), &request).await }
                    })
                    .await
                    .map_err(ParticipantFailure::Remote)
            }));
        }

        let mut acc = init;
        loop {
            let joined = tokio::select! {
                biased;
                joined = tasks.join_next() => joined,
                _ = tokio::time::sleep_until(deadline.instant()) => {
                    let pending = tasks.len();
                    abandon(&cancel, &mut tasks, children, Outcome::TimedOut);
                    return Err(AggregateError::DeadlineExceeded { pending });
                }
            };
            let Some(joined) = joined else { break };
            let (name, result) = match joined {
                Ok(v) => v,
                Err(e) => {
                    abandon(&cancel, &mut tasks, children, Outcome::Cancelled);
                    return Err(AggregateError::Fatal {
                        participant: "unknown".to_string(),
                        message: e.to_string(),
                    });
                }
            };
            let child = children.remove(&name);
            match result {
                Ok(value) => {
                    if let Some(child) = child {
                        child.close(Outcome::Completed { status: 200 });
                    }
                    acc = fold(acc, value);
                }
                Err(failure) => {
                    let err = into_aggregate_error(name, failure);
                    if let Some(child) = child {
                        child.close(match &err {
                            AggregateError::DeadlineExceeded { .. } => Outcome::TimedOut,
                            other => Outcome::Failed {
                                status: 502,
                                error: other.to_string(),
                            },
                        });
                    }
                    let pending = tasks.len();
                    abandon(&cancel, &mut tasks, children, Outcome::Cancelled);
                    return Err(match err {
                        AggregateError::DeadlineExceeded { .. } => {
                            AggregateError::DeadlineExceeded { pending: pending + 1 }
                        }
                        other => other,
                    });
                }
            }
        }
        Ok(acc)
    }
}

async fn fetch_json<T: DeserializeOwned>(
    transport: &dyn RemoteTransport,
    request: &RemoteRequest,
) -> Result<T, RemoteError> {
    let body = transport.fetch(request).await?;
    serde_json::from_slice(&body).map_err(|e| RemoteError::Decode {
        url: request.url(),
        message: e.to_string(),
    })
}

/// Tags the participant's result with its name and turns a panic into a failure.
async fn guarded<T, Fut>(name: String, fut: Fut) -> Joined<T>
where
    Fut: Future<Output = Result<T, ParticipantFailure>>,
{
    let result = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(r) => r,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            Err(ParticipantFailure::Panicked(message))
        }
    };
    (name, result)
}

fn abandon<T: 'static>(
    cancel: &CancellationToken,
    tasks: &mut JoinSet<Joined<T>>,
    children: HashMap<String, ExecutionContext>,
    outcome: Outcome,
) {
    cancel.cancel();
    tasks.abort_all();
    for child in children.into_values() {
        child.close(outcome.clone());
    }
}

fn into_aggregate_error(participant: String, failure: ParticipantFailure) -> AggregateError {
    match failure {
        ParticipantFailure::Local(source) => AggregateError::Participant {
            participant,
            source,
        },
        ParticipantFailure::Panicked(message) => AggregateError::Fatal {
            participant,
            message,
        },
        ParticipantFailure::Remote(RetryError::DeadlineExceeded { .. }) => {
            AggregateError::DeadlineExceeded { pending: 0 }
        }
        ParticipantFailure::Remote(RetryError::Aborted { error, .. })
            if matches!(error.kind(), FailureKind::Fatal) =>
        {
            AggregateError::Fatal {
                participant,
                message: error.to_string(),
            }
        }
        ParticipantFailure::Remote(err) => AggregateError::Participant {
            participant,
            source: Box::new(err),
        },
    }
}
