use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use vantage_cluster::{Aggregator, RemoteTransport};
use vantage_common::auth::AuthConfig;
use vantage_common::{
    DeadlineProtocol, DefaultDeadlineProtocol, DiagnosticsSink, Escalation, Finalizer,
    RequestSummary, TracingSink,
};
use vantage_meta::Membership;
use vantage_retry::RetryPolicy;

use crate::args::Args;
use crate::log_store::LogStore;
use crate::metrics::Metrics;
use crate::profile_store::ProfileStore;

#[derive(Clone)]
pub struct AppState {
    pub node_id: String,
    pub logs: Arc<LogStore>,
    pub profiles: Arc<ProfileStore>,
    pub metrics: Arc<Metrics>,
    pub membership: Arc<dyn Membership>,
    pub aggregator: Aggregator,
    pub deadline_protocol: Arc<dyn DeadlineProtocol>,
    pub finalizer: Finalizer,
    pub auth: AuthConfig,
    pub max_limit: i64,
    /// Cancelled when a request hit a non-recoverable failure; the server
    /// drains and the process exits.
    pub fatal: CancellationToken,
}

impl AsRef<AuthConfig> for AppState {
    fn as_ref(&self) -> &AuthConfig {
        &self.auth
    }
}

impl AppState {
    pub fn builder(node_id: impl Into<String>, logs: Arc<LogStore>) -> AppStateBuilder {
        AppStateBuilder {
            node_id: node_id.into(),
            logs,
            profile_capacity: 1_000,
            writer: Arc::new(TracingSink),
            escalation: Escalation::default(),
            deadline_protocol: Arc::new(DefaultDeadlineProtocol::default()),
            auth: AuthConfig::disabled(),
            max_limit: 10_000,
        }
    }
}

/// Writes summaries through `writer` (`tracing` unless replaced) and records
/// each request's span tree under its operation name.
pub struct NodeSink {
    writer: Arc<dyn DiagnosticsSink>,
    profiles: Arc<ProfileStore>,
}

impl DiagnosticsSink for NodeSink {
    fn emit(&self, summary: &RequestSummary) {
        self.writer.emit(summary);
        if let Some(samples) = &summary.samples {
            self.profiles.record(&summary.name, Utc::now(), samples.clone());
        }
    }
}

pub struct AppStateBuilder {
    node_id: String,
    logs: Arc<LogStore>,
    profile_capacity: usize,
    writer: Arc<dyn DiagnosticsSink>,
    escalation: Escalation,
    deadline_protocol: Arc<dyn DeadlineProtocol>,
    auth: AuthConfig,
    max_limit: i64,
}

impl AppStateBuilder {
    /// Applies every store, threshold and limit setting from the command line.
    pub fn from_args(self, args: &Args) -> Self {
        self.profile_capacity(args.profile_capacity)
            .escalation(Escalation {
                warn_threshold: args.warn_threshold,
                error_threshold: args.error_threshold,
            })
            .deadline_protocol(DefaultDeadlineProtocol::new(
                Duration::from_millis(args.default_timeout_ms),
                Duration::from_millis(args.max_timeout_ms),
            ))
            .max_limit(args.max_limit)
    }

    pub fn profile_capacity(mut self, n: usize) -> Self {
        self.profile_capacity = n;
        self
    }

    /// Replaces the summary writer.
    pub fn writer(mut self, writer: Arc<dyn DiagnosticsSink>) -> Self {
        self.writer = writer;
        self
    }

    pub fn escalation(mut self, escalation: Escalation) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn deadline_protocol<P: DeadlineProtocol + 'static>(mut self, protocol: P) -> Self {
        self.deadline_protocol = Arc::new(protocol);
        self
    }

    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn max_limit(mut self, n: i64) -> Self {
        self.max_limit = n.max(1);
        self
    }

    pub fn build(
        self,
        membership: Arc<dyn Membership>,
        transport: Arc<dyn RemoteTransport>,
        policy: RetryPolicy,
    ) -> AppState {
        let profiles = Arc::new(ProfileStore::new(self.profile_capacity));
        let finalizer = Finalizer {
            escalation: self.escalation,
            sink: Arc::new(NodeSink {
                writer: self.writer,
                profiles: profiles.clone(),
            }),
        };
        AppState {
            node_id: self.node_id,
            logs: self.logs,
            profiles,
            metrics: Arc::new(Metrics::default()),
            membership,
            aggregator: Aggregator::new(transport, policy),
            deadline_protocol: self.deadline_protocol,
            finalizer,
            auth: self.auth,
            max_limit: self.max_limit,
            fatal: CancellationToken::new(),
        }
    }
}

/// Retry policy configured from the command line.
pub fn retry_policy(args: &Args) -> RetryPolicy {
    RetryPolicy::builder()
        .with_default_predicates()
        .immediate_retries(args.retry_immediate)
        .max_unclassified_retries(args.retry_unclassified)
        .initial_delay(Duration::from_millis(args.retry_initial_delay_ms))
        .max_delay(Duration::from_millis(args.retry_max_delay_ms))
        .build()
}
