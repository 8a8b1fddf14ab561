use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use vantage_common::MetricSample;

use crate::state::AppState;

/// Samples kept per metric name.
const HISTORY_CAPACITY: usize = 360;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    pub fanout_failures: AtomicU64,
    pub deadline_exceeded: AtomicU64,
    history: DashMap<String, Mutex<VecDeque<MetricSample>>>,
}

impl Metrics {
    fn counters(&self) -> [(&'static str, u64); 7] {
        [
            ("vantage_requests_total", self.requests_total.load(Ordering::Relaxed)),
            ("vantage_requests_inflight", self.requests_inflight.load(Ordering::Relaxed)),
            ("vantage_responses_2xx", self.status_2xx.load(Ordering::Relaxed)),
            ("vantage_responses_4xx", self.status_4xx.load(Ordering::Relaxed)),
            ("vantage_responses_5xx", self.status_5xx.load(Ordering::Relaxed)),
            ("vantage_fanout_failures", self.fanout_failures.load(Ordering::Relaxed)),
            ("vantage_deadline_exceeded", self.deadline_exceeded.load(Ordering::Relaxed)),
        ]
    }

    pub fn render(&self) -> String {
        let mut body = String::new();
        for (name, value) in self.counters() {
            body.push_str(&format!("{name} {value}\n"));
        }
        body
    }

    /// Appends the current value of every counter to its history.
    pub fn snapshot(&self, node: &str, ts: DateTime<Utc>) {
        for (name, value) in self.counters() {
            self.push(MetricSample {
                node: node.to_string(),
                ts,
                name: name.to_string(),
                value: value as f64,
            });
        }
    }

    pub fn push(&self, sample: MetricSample) {
        let series = self
            .history
            .entry(sample.name.clone())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut buf = series.lock().unwrap_or_else(|p| p.into_inner());
        if buf.len() == HISTORY_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(sample);
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.history.iter().map(|e| e.key().clone()).collect()
    }

    /// Newest `limit` samples of `name`, newest first. `None` for an unknown name.
    pub fn samples(&self, name: &str, limit: usize) -> Option<Vec<MetricSample>> {
        let series = self.history.get(name)?;
        let buf = series.lock().unwrap_or_else(|p| p.into_inner());
        Some(buf.iter().rev().take(limit).cloned().collect())
    }
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    (axum::http::StatusCode::OK, st.metrics.render())
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}

pub async fn snapshot_loop(st: AppState, interval: Duration, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(interval.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => st.metrics.snapshot(&st.node_id, Utc::now()),
        }
    }
    tracing::debug!("metrics snapshot loop stopped");
}
