use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;
use vantage_common::{LogLevel, LogRecord, StackSampleElement};

use crate::log_store::LogStore;

/// Copies every event that passes the filter into the node's [`LogStore`].
///
/// Recognised fields: `trace_id`, `appender` (also route the record to that
/// appender) and `stack_samples` (JSON list of flattened sample elements).
/// Everything else lands in `attrs`.
pub struct CaptureLayer {
    origin: String,
    store: Arc<LogStore>,
}

impl CaptureLayer {
    pub fn new(origin: impl Into<String>, store: Arc<LogStore>) -> Self {
        Self {
            origin: origin.into(),
            store,
        }
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let stack_samples = visitor
            .stack_samples
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<StackSampleElement>>(raw).ok())
            .unwrap_or_default();
        let record = LogRecord {
            origin: self.origin.clone(),
            trace_id: visitor.trace_id.filter(|t| !t.is_empty()),
            ts: Utc::now(),
            level: LogLevel::from(meta.level()),
            logger: meta.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            attrs: visitor.fields,
            stack_samples,
        };
        match visitor.appender {
            Some(appender) => self.store.append_to(&appender, record),
            None => self.store.append(record),
        }
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: Option<String>,
    trace_id: Option<String>,
    appender: Option<String>,
    stack_samples: Option<String>,
    fields: BTreeMap<String, Value>,
}

impl RecordVisitor {
    fn put_str(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "trace_id" => self.trace_id = Some(value),
            "appender" => self.appender = Some(value),
            "stack_samples" => self.stack_samples = Some(value),
            name => {
                self.fields.insert(name.to_string(), Value::String(value));
            }
        }
    }
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put_str(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put_str(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields.insert(field.name().to_string(), Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::Bool(value));
    }
}
