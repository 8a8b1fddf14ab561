pub mod auth;
pub mod cluster;
pub mod deadline;
pub mod execution_context;
pub mod filter;
pub mod headers;
pub mod http_warning;
pub mod record;
pub mod samples;
pub mod telemetry;

pub use cluster::{ClusterInfo, NetworkService, PeerAddr};
pub use deadline::{Deadline, DeadlineError, DeadlineProtocol, DefaultDeadlineProtocol};
pub use execution_context::{
    AsyncCompletion, CapturedLog, ContextTag, DiagnosticsSink, Escalation, ExecutionContext,
    Finalizer, FlushDetail, HttpWarningsTag, LogAttribute, LogAttributesTag, LogLevelTag, Outcome,
    RequestSummary, SpanGuard, TracingSink,
};
pub use filter::{FilterError, LogFilter};
pub use http_warning::{HttpWarning, WarningParseError};
pub use record::{LogLevel, LogRecord, MetricSample, Order};
pub use samples::{SampleNode, StackSampleElement, PROFILE_DETAIL};
