use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::deadline::Deadline;
use crate::http_warning::HttpWarning;
use crate::record::LogLevel;
use crate::samples::{SampleNode, PROFILE_DETAIL};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogAttribute {
    pub name: String,
    pub value: serde_json::Value,
}

impl LogAttribute {
    pub fn of(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for LogAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            serde_json::Value::String(s) => write!(f, "{}={}", self.name, s),
            other => write!(f, "{}={}", self.name, other),
        }
    }
}

/// A typed key into the context's tag map, with the combinator used by
/// [`ExecutionContext::combine`].
pub trait ContextTag: 'static {
    type Value: Clone + Send + 'static;

    fn combine(current: Self::Value, update: Self::Value) -> Self::Value;
}

/// Log level override for the end-of-request summary; escalates, never lowers.
pub struct LogLevelTag;

impl ContextTag for LogLevelTag {
    type Value = LogLevel;

    fn combine(current: LogLevel, update: LogLevel) -> LogLevel {
        current.max(update)
    }
}

pub struct LogAttributesTag;

impl ContextTag for LogAttributesTag {
    type Value = Vec<LogAttribute>;

    fn combine(mut current: Self::Value, update: Self::Value) -> Self::Value {
        current.extend(update);
        current
    }
}

pub struct HttpWarningsTag;

impl ContextTag for HttpWarningsTag {
    type Value = Vec<HttpWarning>;

    fn combine(mut current: Self::Value, update: Self::Value) -> Self::Value {
        current.extend(update);
        current
    }
}

/// A log line captured by the context rather than written straight away.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapturedLog {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub attrs: Vec<LogAttribute>,
    /// Already emitted when captured (level was at or above the backend minimum).
    pub logged: bool,
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { status: u16 },
    /// Abandoned because a sibling failed or the caller went away.
    Cancelled,
    TimedOut,
    Failed { status: u16, error: String },
}

impl Outcome {
    fn status(&self) -> Option<u16> {
        match self {
            Outcome::Completed { status } | Outcome::Failed { status, .. } => Some(*status),
            Outcome::Cancelled | Outcome::TimedOut => None,
        }
    }

    fn base_level(&self) -> LogLevel {
        match self {
            Outcome::Completed { status } if *status < 500 => LogLevel::Info,
            Outcome::Cancelled => LogLevel::Info,
            _ => LogLevel::Error,
        }
    }
}

/// Budget fractions beyond which the summary escalates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Escalation {
    pub warn_threshold: f64,
    pub error_threshold: f64,
}

impl Default for Escalation {
    fn default() -> Self {
        Self {
            warn_threshold: 0.3,
            error_threshold: 0.9,
        }
    }
}

impl Escalation {
    pub fn evaluate(&self, elapsed: Duration, budget: Duration) -> Option<(LogLevel, LogAttribute)> {
        let error_limit = budget.mul_f64(self.error_threshold);
        if elapsed > error_limit {
            return Some((
                LogLevel::Error,
                LogAttribute::of(
                    "performanceError",
                    format!("exec time > {} us", error_limit.as_micros()),
                ),
            ));
        }
        let warn_limit = budget.mul_f64(self.warn_threshold);
        if elapsed > warn_limit {
            return Some((
                LogLevel::Warn,
                LogAttribute::of(
                    "performanceWarning",
                    format!("exec time > {} us", warn_limit.as_micros()),
                ),
            ));
        }
        None
    }
}

/// Buffered lines released only for slow or failed requests. Their sample
/// tree is reported alongside as `profileDetail`.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushDetail {
    pub logs: Vec<CapturedLog>,
}

/// End-of-request summary handed to the [`DiagnosticsSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSummary {
    pub name: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub status: Option<u16>,
    pub exec_time: Duration,
    pub budget: Duration,
    pub attributes: Vec<LogAttribute>,
    pub warnings: Vec<HttpWarning>,
    /// Span tree of the request, flushed or not.
    pub samples: Option<SampleNode>,
    pub detail: Option<FlushDetail>,
}

/// Receives one summary per closed root context.
pub trait DiagnosticsSink: Send + Sync {
    fn emit(&self, summary: &RequestSummary);
}

/// Writes summaries as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn emit(&self, summary: &RequestSummary) {
        if let Some(detail) = &summary.detail {
            for log in &detail.logs {
                let attrs = join_attrs(&log.attrs);
                emit_at(
                    log.level.max(LogLevel::Info),
                    &summary.trace_id,
                    &format!("Detail on Error: {}", log.message),
                    &attrs,
                );
            }
            if let Some(samples) = &summary.samples {
                let stack_samples = serde_json::to_string(&samples.flatten()).unwrap_or_default();
                tracing::info!(
                    trace_id = %summary.trace_id,
                    stack_samples = %stack_samples,
                    "{}",
                    PROFILE_DETAIL
                );
            }
        }
        let mut attrs = format!(
            "status={} exec_time_us={} budget_us={}",
            summary.status.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            summary.exec_time.as_micros(),
            summary.budget.as_micros()
        );
        for a in &summary.attributes {
            attrs.push(' ');
            attrs.push_str(&a.to_string());
        }
        for w in &summary.warnings {
            attrs.push_str(&format!(" warning=\"{w}\""));
        }
        emit_at(
            summary.level,
            &summary.trace_id,
            &format!("Done {}", summary.name),
            &attrs,
        );
    }
}

fn join_attrs(attrs: &[LogAttribute]) -> String {
    attrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn emit_at(level: LogLevel, trace_id: &str, message: &str, attrs: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(trace_id, attrs, "{message}"),
        LogLevel::Debug => tracing::debug!(trace_id, attrs, "{message}"),
        LogLevel::Info => tracing::info!(trace_id, attrs, "{message}"),
        LogLevel::Warn => tracing::warn!(trace_id, attrs, "{message}"),
        LogLevel::Error => tracing::error!(trace_id, attrs, "{message}"),
    }
}

/// Escalation thresholds plus the sink a root context reports to on close.
#[derive(Clone)]
pub struct Finalizer {
    pub escalation: Escalation,
    pub sink: Arc<dyn DiagnosticsSink>,
}

impl Default for Finalizer {
    fn default() -> Self {
        Self {
            escalation: Escalation::default(),
            sink: Arc::new(TracingSink),
        }
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer")
            .field("escalation", &self.escalation)
            .finish()
    }
}

#[derive(Default)]
struct State {
    tags: HashMap<TypeId, Box<dyn Any + Send>>,
    logs: Vec<CapturedLog>,
    samples: Option<SampleNode>,
    backend_min_level: Option<LogLevel>,
}

struct Inner {
    id: String,
    name: String,
    start: Instant,
    started_at: DateTime<Utc>,
    deadline: Deadline,
    parent: Option<ExecutionContext>,
    finalizer: Finalizer,
    state: Mutex<State>,
    closed: AtomicBool,
    detached: AtomicBool,
}

/// Per-request carrier of identity, deadline, tags and buffered diagnostics.
///
/// Cheap to clone; clones share state. Passed explicitly to every call that
/// reads the deadline or records diagnostics.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("deadline", &self.inner.deadline)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ExecutionContext {
    /// Starts a context. A parent contributes its trace id (when none is given)
    /// and caps the deadline.
    pub fn start(
        name: impl Into<String>,
        trace_id: Option<String>,
        parent: Option<&ExecutionContext>,
        start: Instant,
        deadline: Deadline,
    ) -> Self {
        let finalizer = parent
            .map(|p| p.inner.finalizer.clone())
            .unwrap_or_default();
        Self::start_with(name, trace_id, parent, start, deadline, finalizer)
    }

    pub fn start_with(
        name: impl Into<String>,
        trace_id: Option<String>,
        parent: Option<&ExecutionContext>,
        start: Instant,
        deadline: Deadline,
        finalizer: Finalizer,
    ) -> Self {
        let id = trace_id
            .or_else(|| parent.map(|p| p.inner.id.clone()))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let deadline = match parent {
            Some(p) => deadline.min(p.inner.deadline),
            None => deadline,
        };
        let backend_min_level = parent.and_then(|p| p.state().backend_min_level);
        Self {
            inner: Arc::new(Inner {
                id,
                name: name.into(),
                start,
                started_at: Utc::now(),
                deadline,
                parent: parent.cloned(),
                finalizer,
                state: Mutex::new(State {
                    backend_min_level,
                    ..State::default()
                }),
                closed: AtomicBool::new(false),
                detached: AtomicBool::new(false),
            }),
        }
    }

    /// Child sharing this context's trace id and deadline; closing it folds its
    /// diagnostics back into this context.
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self::start(name, None, Some(self), Instant::now(), self.inner.deadline)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn start_instant(&self) -> Instant {
        self.inner.start
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn deadline(&self) -> Deadline {
        self.inner.deadline
    }

    pub fn parent(&self) -> Option<&ExecutionContext> {
        self.inner.parent.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.inner.start)
    }

    pub fn budget(&self) -> Duration {
        self.inner
            .deadline
            .instant()
            .saturating_duration_since(self.inner.start)
    }

    pub fn remaining(&self) -> Duration {
        self.inner.deadline.remaining()
    }

    pub fn put<T: ContextTag>(&self, value: T::Value) -> Option<T::Value> {
        self.state()
            .tags
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast::<T::Value>().ok())
            .map(|prev| *prev)
    }

    pub fn get<T: ContextTag>(&self) -> Option<T::Value> {
        self.state()
            .tags
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T::Value>())
            .cloned()
    }

    pub fn combine<T: ContextTag>(&self, value: T::Value) {
        let mut st = self.state();
        let key = TypeId::of::<T>();
        let next = match st
            .tags
            .remove(&key)
            .and_then(|prev| prev.downcast::<T::Value>().ok())
        {
            Some(current) => T::combine(*current, value),
            None => value,
        };
        st.tags.insert(key, Box::new(next));
    }

    pub fn add<T, I>(&self, item: I)
    where
        T: ContextTag<Value = Vec<I>>,
        I: Clone + Send + 'static,
    {
        self.combine::<T>(vec![item]);
    }

    pub fn set_backend_min_level(&self, level: LogLevel) {
        self.state().backend_min_level = Some(level);
    }

    /// Captures a log line. Lines at or above the backend minimum (INFO unless
    /// overridden) are written immediately; the rest wait for a flush.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, attrs: Vec<LogAttribute>) {
        let message = message.into();
        let min = self.state().backend_min_level.unwrap_or(LogLevel::Info);
        let logged = level >= min;
        if logged {
            emit_at(level, &self.inner.id, &message, &join_attrs(&attrs));
        }
        self.state().logs.push(CapturedLog {
            ts: Utc::now(),
            level,
            message,
            attrs,
            logged,
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message, Vec::new());
    }

    pub fn add_samples(&self, samples: SampleNode) {
        let mut st = self.state();
        st.samples = SampleNode::aggregate(st.samples.take(), Some(samples));
    }

    pub fn samples(&self) -> Option<SampleNode> {
        self.state().samples.clone()
    }

    /// Starts a timed span; its duration is recorded when the guard drops.
    pub fn span(&self, name: impl Into<String>) -> SpanGuard {
        SpanGuard {
            ctx: self.clone(),
            path: vec![name.into()],
            start: Instant::now(),
        }
    }

    /// Visits captured log lines in capture order.
    pub fn stream_logs(&self, mut visitor: impl FnMut(&CapturedLog)) {
        let st = self.state();
        for log in &st.logs {
            visitor(log);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::Acquire)
    }

    /// Hands ownership of closing to the returned handle. Must be called before
    /// the handling path suspends; the synchronous close path then leaves the
    /// context alone.
    pub fn detach(&self) -> AsyncCompletion {
        self.inner.detached.store(true, Ordering::Release);
        AsyncCompletion {
            ctx: Some(self.clone()),
        }
    }

    /// Closes the context exactly once. Root contexts report to their sink and
    /// return the summary; child contexts fold into their parent. Later calls
    /// are no-ops returning `None`.
    pub fn close(&self, outcome: Outcome) -> Option<RequestSummary> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        if let Some(parent) = &self.inner.parent {
            self.fold_into(parent, &outcome);
            return None;
        }
        let summary = self.summarize(outcome);
        self.inner.finalizer.sink.emit(&summary);
        Some(summary)
    }

    fn fold_into(&self, parent: &ExecutionContext, outcome: &Outcome) {
        let (tags_level, attrs, warnings, logs, samples) = {
            let mut st = self.state();
            let level = st
                .tags
                .remove(&TypeId::of::<LogLevelTag>())
                .and_then(|v| v.downcast::<LogLevel>().ok())
                .map(|v| *v);
            let attrs = st
                .tags
                .remove(&TypeId::of::<LogAttributesTag>())
                .and_then(|v| v.downcast::<Vec<LogAttribute>>().ok())
                .map(|v| *v);
            let warnings = st
                .tags
                .remove(&TypeId::of::<HttpWarningsTag>())
                .and_then(|v| v.downcast::<Vec<HttpWarning>>().ok())
                .map(|v| *v);
            (
                level,
                attrs,
                warnings,
                std::mem::take(&mut st.logs),
                st.samples.take(),
            )
        };
        if let Some(level) = tags_level {
            parent.combine::<LogLevelTag>(level);
        }
        if let Outcome::Failed { error, .. } = outcome {
            parent.combine::<LogLevelTag>(LogLevel::Error);
            parent.add::<LogAttributesTag, _>(LogAttribute::of(
                "failedParticipant",
                format!("{}: {}", self.inner.name, error),
            ));
        }
        if let Some(attrs) = attrs {
            parent.combine::<LogAttributesTag>(attrs);
        }
        if let Some(warnings) = warnings {
            parent.combine::<HttpWarningsTag>(warnings);
        }
        let mut pst = parent.state();
        pst.logs.extend(logs);
        if let Some(samples) = samples {
            let mut nested = SampleNode::new();
            nested.count = samples.count;
            nested.children.insert(self.inner.name.clone(), samples);
            pst.samples = SampleNode::aggregate(pst.samples.take(), Some(nested));
        }
    }

    fn summarize(&self, outcome: Outcome) -> RequestSummary {
        if outcome == Outcome::TimedOut {
            self.combine::<LogLevelTag>(LogLevel::Error);
            self.add::<LogAttributesTag, _>(LogAttribute::of("warning", "Request timed out"));
        }
        if let Outcome::Failed { error, .. } = &outcome {
            self.add::<LogAttributesTag, _>(LogAttribute::of("error", error.clone()));
        }

        let exec_time = self.elapsed();
        let budget = self.budget();
        let mut level = outcome.base_level();
        if let Some(over) = self.get::<LogLevelTag>() {
            level = level.max(over);
        }
        let mut attributes = self.get::<LogAttributesTag>().unwrap_or_default();
        if let Some((escalated, attr)) = self.inner.finalizer.escalation.evaluate(exec_time, budget)
        {
            attributes.push(attr);
            level = level.max(escalated);
        }

        let warnings = self.get::<HttpWarningsTag>().unwrap_or_default();
        let mut client_warning = false;
        if !warnings.is_empty() && level < LogLevel::Warn {
            level = LogLevel::Warn;
            client_warning = true;
        }

        let st = self.state();
        let detail = if !client_warning && level >= LogLevel::Warn {
            let mut logs: Vec<CapturedLog> =
                st.logs.iter().filter(|l| !l.logged).cloned().collect();
            logs.sort_by_key(|l| l.ts);
            Some(FlushDetail { logs })
        } else {
            None
        };
        let samples = st.samples.clone();
        drop(st);

        RequestSummary {
            name: self.inner.name.clone(),
            trace_id: self.inner.id.clone(),
            level,
            status: outcome.status(),
            exec_time,
            budget,
            attributes,
            warnings,
            samples,
            detail,
        }
    }
}

/// Exclusive right to close a detached context. Exactly one of `complete`,
/// `timeout` or `error` runs; dropping the handle unused closes the context as
/// failed.
#[must_use = "a detached context is only closed through its completion handle"]
pub struct AsyncCompletion {
    ctx: Option<ExecutionContext>,
}

impl AsyncCompletion {
    pub fn context(&self) -> Option<&ExecutionContext> {
        self.ctx.as_ref()
    }

    fn finish(&mut self, outcome: Outcome) -> Option<RequestSummary> {
        self.ctx.take().and_then(|ctx| ctx.close(outcome))
    }

    pub fn complete(mut self, status: u16) -> Option<RequestSummary> {
        self.finish(Outcome::Completed { status })
    }

    pub fn timeout(mut self) -> Option<RequestSummary> {
        self.finish(Outcome::TimedOut)
    }

    pub fn error(mut self, status: u16, error: impl fmt::Display) -> Option<RequestSummary> {
        self.finish(Outcome::Failed {
            status,
            error: error.to_string(),
        })
    }
}

impl Drop for AsyncCompletion {
    fn drop(&mut self) {
        self.finish(Outcome::Failed {
            status: 500,
            error: "completion dropped before the response finished".to_string(),
        });
    }
}

/// Records a timed span into the owning context when dropped.
pub struct SpanGuard {
    ctx: ExecutionContext,
    path: Vec<String>,
    start: Instant,
}

impl SpanGuard {
    pub fn child(&self, name: impl Into<String>) -> SpanGuard {
        let mut path = self.path.clone();
        path.push(name.into());
        SpanGuard {
            ctx: self.ctx.clone(),
            path,
            start: Instant::now(),
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        let elapsed = Instant::now().saturating_duration_since(self.start);
        let millis = (elapsed.as_millis() as u64).max(1);
        let mut samples = SampleNode::new();
        samples.add_path(&self.path, millis);
        self.ctx.add_samples(samples);
        self.ctx.log(
            LogLevel::Debug,
            format!("span {} took {} us", self.path.join("/"), elapsed.as_micros()),
            Vec::new(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        summaries: Mutex<Vec<RequestSummary>>,
    }

    impl DiagnosticsSink for RecordingSink {
        fn emit(&self, summary: &RequestSummary) {
            self.summaries.lock().unwrap().push(summary.clone());
        }
    }

    fn root(budget: Duration, sink: Arc<RecordingSink>) -> ExecutionContext {
        let start = Instant::now();
        ExecutionContext::start_with(
            "GET/logs/cluster",
            Some("trace-1".to_string()),
            None,
            start,
            Deadline::after(start, budget),
            Finalizer {
                escalation: Escalation::default(),
                sink,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_request_has_no_flush() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = root(Duration::from_millis(100), sink.clone());
        ctx.debug("buffered detail");
        tokio::time::advance(Duration::from_millis(20)).await;

        let summary = ctx.close(Outcome::Completed { status: 200 }).unwrap();
        assert_eq!(summary.level, LogLevel::Info);
        assert!(summary.detail.is_none());
        assert_eq!(sink.summaries.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_request_warns_and_flushes() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = root(Duration::from_millis(100), sink.clone());
        ctx.debug("buffered detail");
        ctx.log(LogLevel::Info, "already written", Vec::new());
        tokio::time::advance(Duration::from_millis(50)).await;

        let summary = ctx.close(Outcome::Completed { status: 200 }).unwrap();
        assert_eq!(summary.level, LogLevel::Warn);
        let detail = summary.detail.unwrap();
        assert_eq!(detail.logs.len(), 1);
        assert_eq!(detail.logs[0].message, "buffered detail");
        assert!(summary.attributes.iter().any(|a| a.name == "performanceWarning"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_error_threshold_flushes_samples() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = root(Duration::from_millis(100), sink);
        {
            let _span = ctx.span("fan_out");
            tokio::time::advance(Duration::from_millis(95)).await;
        }
        let summary = ctx.close(Outcome::Completed { status: 200 }).unwrap();
        assert_eq!(summary.level, LogLevel::Error);
        assert!(summary.detail.is_some());
        let samples = summary.samples.unwrap();
        assert_eq!(samples.children["fan_out"].count, 95);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_always_flushes() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = root(Duration::from_secs(10), sink);
        ctx.debug("why it failed");
        let summary = ctx
            .close(Outcome::Failed {
                status: 502,
                error: "peer down".into(),
            })
            .unwrap();
        assert_eq!(summary.level, LogLevel::Error);
        assert_eq!(summary.detail.unwrap().logs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_warning_escalates_without_flush() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = root(Duration::from_secs(10), sink);
        ctx.add::<HttpWarningsTag, _>(HttpWarning::new(299, "-", "deprecated param"));
        let summary = ctx.close(Outcome::Completed { status: 200 }).unwrap();
        assert_eq!(summary.level, LogLevel::Warn);
        assert!(summary.detail.is_none());
        assert_eq!(summary.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_double_close_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = root(Duration::from_secs(10), sink.clone());
        assert!(ctx.close(Outcome::Completed { status: 200 }).is_some());
        assert!(ctx.close(Outcome::TimedOut).is_none());
        assert_eq!(sink.summaries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_combine_escalates_level() {
        let ctx = root(Duration::from_secs(10), Arc::new(RecordingSink::default()));
        ctx.combine::<LogLevelTag>(LogLevel::Warn);
        ctx.combine::<LogLevelTag>(LogLevel::Debug);
        assert_eq!(ctx.get::<LogLevelTag>(), Some(LogLevel::Warn));
        assert_eq!(ctx.put::<LogLevelTag>(LogLevel::Info), Some(LogLevel::Warn));
        assert_eq!(ctx.get::<LogLevelTag>(), Some(LogLevel::Info));
    }

    #[tokio::test]
    async fn test_concurrent_adds_from_sibling_tasks() {
        let ctx = root(Duration::from_secs(10), Arc::new(RecordingSink::default()));
        let mut handles = Vec::new();
        for i in 0..16 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                ctx.add::<LogAttributesTag, _>(LogAttribute::of("peer", i));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(ctx.get::<LogAttributesTag>().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_child_folds_into_parent() {
        let sink = Arc::new(RecordingSink::default());
        let parent = root(Duration::from_secs(10), sink.clone());
        let child = parent.child("peer:node-2");
        assert_eq!(child.id(), "trace-1");
        assert_eq!(child.deadline(), parent.deadline());
        child.debug("peer detail");
        assert!(child
            .close(Outcome::Failed {
                status: 503,
                error: "unavailable".into(),
            })
            .is_none());
        assert!(sink.summaries.lock().unwrap().is_empty());

        assert_eq!(parent.get::<LogLevelTag>(), Some(LogLevel::Error));
        let mut messages = Vec::new();
        parent.stream_logs(|l| messages.push(l.message.clone()));
        assert_eq!(messages, vec!["peer detail".to_string()]);
        let attrs = parent.get::<LogAttributesTag>().unwrap();
        assert_eq!(attrs[0].name, "failedParticipant");
    }

    #[tokio::test]
    async fn test_detached_completion_closes_once() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = root(Duration::from_secs(10), sink.clone());
        let completion = ctx.detach();
        assert!(ctx.is_detached());
        assert!(!ctx.is_closed());
        let summary = completion.timeout().unwrap();
        assert_eq!(summary.level, LogLevel::Error);
        assert!(summary.detail.is_some());
        assert!(ctx.close(Outcome::Completed { status: 200 }).is_none());
        assert_eq!(sink.summaries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_completion_closes_as_failed() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = root(Duration::from_secs(10), sink.clone());
        drop(ctx.detach());
        assert!(ctx.is_closed());
        let summaries = sink.summaries.lock().unwrap();
        assert_eq!(summaries[0].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_backend_level_override_logs_immediately() {
        let ctx = root(Duration::from_secs(10), Arc::new(RecordingSink::default()));
        ctx.set_backend_min_level(LogLevel::Debug);
        ctx.debug("visible now");
        let mut logged = Vec::new();
        ctx.stream_logs(|l| logged.push(l.logged));
        assert_eq!(logged, vec![true]);
    }

    /// Reads the context from inside the subscriber, as a capture layer does.
    struct ReentrantLayer(ExecutionContext);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ReentrantLayer {
        fn on_event(
            &self,
            _event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let _ = self.0.samples();
        }
    }

    #[test]
    fn test_log_emits_without_holding_state() {
        use tracing_subscriber::layer::SubscriberExt;

        let ctx = root(Duration::from_secs(10), Arc::new(RecordingSink::default()));
        let subscriber = tracing_subscriber::registry().with(ReentrantLayer(ctx.clone()));
        tracing::subscriber::with_default(subscriber, || {
            ctx.log(LogLevel::Info, "written through", Vec::new());
        });
        let mut messages = Vec::new();
        ctx.stream_logs(|l| messages.push(l.message.clone()));
        assert_eq!(messages, vec!["written through".to_string()]);
    }
}
