use std::collections::BTreeSet;
use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use vantage_cluster::{ParticipantError, PeerQuery};
use vantage_common::{
    AsyncCompletion, ExecutionContext, HttpWarning, HttpWarningsTag, LogAttribute,
    LogAttributesTag, LogFilter, LogRecord, MetricSample, Order, SampleNode,
};

use crate::context::OUT_BYTES;
use crate::error::ApiError;
use crate::log_store::DEFAULT_APPENDER;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 1000;
/// Records of one trace aggregated by the trace profile query.
const TRACE_PROFILE_LIMIT: i64 = 10;
const WARNING_AGENT: &str = "vantage";

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    pub limit: Option<i64>,
    pub filter: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeParams {
    pub from: Option<String>,
    pub to: Option<String>,
}

struct BoundedQuery {
    limit: i64,
    filter: LogFilter,
    order: Order,
}

impl QueryParams {
    /// Validates the parameters. A limit above the node maximum is capped and
    /// reported to the client as a warning.
    fn resolve(&self, ctx: &ExecutionContext, max_limit: i64) -> Result<BoundedQuery, ApiError> {
        let mut limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if limit > max_limit {
            ctx.add::<HttpWarningsTag, _>(HttpWarning::new(
                HttpWarning::PERSISTENT_MISCELLANEOUS,
                WARNING_AGENT,
                format!("limit {limit} capped to {max_limit}"),
            ));
            limit = max_limit;
        }
        let filter = match self.filter.as_deref() {
            Some(raw) => LogFilter::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))?,
            None => LogFilter::all(),
        };
        let order = match self.order.as_deref() {
            Some(raw) => raw.parse::<Order>().map_err(ApiError::BadRequest)?,
            None => Order::default(),
        };
        Ok(BoundedQuery {
            limit,
            filter,
            order,
        })
    }
}

fn local_limit(limit: i64) -> Result<usize, ApiError> {
    usize::try_from(limit)
        .map_err(|_| ApiError::BadRequest(format!("limit parameter must be non-negative: {limit}")))
}

fn appender_of(appender: Option<Path<String>>) -> String {
    appender
        .map(|Path(a)| a)
        .unwrap_or_else(|| DEFAULT_APPENDER.to_string())
}

fn encode_segment(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

// ── Logs ────────────────────────────────────────────────────────────

pub async fn logs_local(
    State(st): State<AppState>,
    Extension(ctx): Extension<ExecutionContext>,
    appender: Option<Path<String>>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let q = params.resolve(&ctx, st.max_limit)?;
    let limit = local_limit(q.limit)?;
    let _span = ctx.span("query_local");
    let records = st
        .logs
        .query(&appender_of(appender), limit, &q.filter, q.order)
        .unwrap_or_default();
    Ok(Json(records))
}

pub async fn logs_cluster(
    State(st): State<AppState>,
    Extension(ctx): Extension<ExecutionContext>,
    appender: Option<Path<String>>,
    Query(params): Query<QueryParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let q = params.resolve(&ctx, st.max_limit)?;
    let appender = appender_of(appender);

    if !wants_text(&headers) {
        let records = cluster_logs(&st, &ctx, &appender, q).await?;
        return Ok(Json(records).into_response());
    }

    let completion = ctx.detach();
    let records = match cluster_logs(&st, &ctx, &appender, q).await {
        Ok(records) => records,
        Err(e) => {
            if matches!(&e, ApiError::Aggregate(a) if a.is_deadline_exceeded()) {
                completion.timeout();
            } else {
                completion.error(e.status().as_u16(), &e);
            }
            return Err(e);
        }
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, Infallible>>(64);
    tokio::spawn(async move {
        let mut written: u64 = 0;
        for record in records {
            let line = Bytes::from(format!("{record}\n"));
            let len = line.len() as u64;
            if tx.send(Ok(line)).await.is_err() {
                record_out_bytes(&completion, written);
                completion.complete(499);
                return;
            }
            written += len;
        }
        record_out_bytes(&completion, written);
        completion.complete(StatusCode::OK.as_u16());
    });

    let stream = ReceiverStream::new(rx);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty())))
}

fn record_out_bytes(completion: &AsyncCompletion, written: u64) {
    if let Some(ctx) = completion.context() {
        ctx.add::<LogAttributesTag, _>(LogAttribute::of(OUT_BYTES, written));
    }
}

fn wants_text(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/plain"))
        .unwrap_or(false)
}

async fn cluster_logs(
    st: &AppState,
    ctx: &ExecutionContext,
    appender: &str,
    q: BoundedQuery,
) -> Result<Vec<LogRecord>, ApiError> {
    let cluster = st.membership.cluster_info().await?;
    let query = PeerQuery::new(format!("/logs/local/{}", encode_segment(appender)))
        .param_opt("filter", (!q.filter.is_empty()).then(|| q.filter.to_string()));

    let logs = st.logs.clone();
    let appender = appender.to_string();
    let (limit, order, filter) = (q.limit, q.order, q.filter);
    let local = async move {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok::<_, ParticipantError>(logs.query(&appender, limit, &filter, order).unwrap_or_default())
    };
    Ok(st
        .aggregator
        .aggregate(ctx, limit, order, &cluster, query, local)
        .await?)
}

// ── Profiles ────────────────────────────────────────────────────────

pub async fn profile_groups_local(State(st): State<AppState>) -> Json<BTreeSet<String>> {
    Json(st.profiles.labels())
}

pub async fn profile_groups_cluster(
    State(st): State<AppState>,
    Extension(ctx): Extension<ExecutionContext>,
) -> Result<Json<BTreeSet<String>>, ApiError> {
    let cluster = st.membership.cluster_info().await?;
    let profiles = st.profiles.clone();
    let local = async move { Ok::<_, ParticipantError>(profiles.labels()) };
    let labels = st
        .aggregator
        .fan_out_fold(
            &ctx,
            &cluster,
            PeerQuery::new("/profiles/local/groups"),
            local,
            BTreeSet::new(),
            |mut acc, part: BTreeSet<String>| {
                acc.extend(part);
                acc
            },
        )
        .await?;
    Ok(Json(labels))
}

pub async fn profile_group_local(
    State(st): State<AppState>,
    Path(label): Path<String>,
    Query(range): Query<RangeParams>,
) -> Result<Json<Option<SampleNode>>, ApiError> {
    let (from, to) = range.resolve()?;
    Ok(Json(st.profiles.aggregate(&label, from, to)))
}

pub async fn profile_group_cluster(
    State(st): State<AppState>,
    Extension(ctx): Extension<ExecutionContext>,
    Path(label): Path<String>,
    Query(range): Query<RangeParams>,
) -> Result<Json<Option<SampleNode>>, ApiError> {
    let (from, to) = range.resolve()?;
    let cluster = st.membership.cluster_info().await?;
    let query = PeerQuery::new(format!("/profiles/local/groups/{}", encode_segment(&label)))
        .param_opt("from", range.from.as_deref())
        .param_opt("to", range.to.as_deref());
    let profiles = st.profiles.clone();
    let local = async move { Ok::<_, ParticipantError>(profiles.aggregate(&label, from, to)) };
    let tree = st
        .aggregator
        .fan_out_fold(&ctx, &cluster, query, local, None, SampleNode::aggregate)
        .await?;
    Ok(Json(tree))
}

/// Sample tree of one trace, rebuilt from the `profileDetail` records its
/// flushed requests left on each node.
pub async fn profile_trace_cluster(
    State(st): State<AppState>,
    Extension(ctx): Extension<ExecutionContext>,
    Path(trace): Path<String>,
) -> Result<Json<Option<SampleNode>>, ApiError> {
    let quoted = trace.replace('\\', "\\\\").replace('"', "\\\"");
    let filter = LogFilter::parse(&format!("samples > 0 and trace_id == \"{quoted}\""))
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let cluster = st.membership.cluster_info().await?;
    let query = PeerQuery::new(format!("/logs/local/{DEFAULT_APPENDER}"))
        .param("filter", filter.to_string());

    let logs = st.logs.clone();
    let local = async move {
        Ok::<_, ParticipantError>(
            logs.query(
                DEFAULT_APPENDER,
                TRACE_PROFILE_LIMIT as usize,
                &filter,
                Order::Desc,
            )
            .unwrap_or_default(),
        )
    };
    let records: Vec<LogRecord> = st
        .aggregator
        .aggregate(&ctx, TRACE_PROFILE_LIMIT, Order::Desc, &cluster, query, local)
        .await?;

    let tree = records
        .iter()
        .map(|r| SampleNode::from_elements(&r.stack_samples))
        .fold(None, SampleNode::aggregate);
    Ok(Json(tree))
}

impl RangeParams {
    fn resolve(&self) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), ApiError> {
        Ok((
            self.from.as_deref().map(parse_time).transpose()?,
            self.to.as_deref().map(parse_time).transpose()?,
        ))
    }
}

/// Milliseconds since the epoch or RFC 3339.
fn parse_time(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| ApiError::BadRequest(format!("timestamp out of range: {raw}")));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ApiError::BadRequest(format!("invalid timestamp '{raw}': {e}")))
}

// ── Metrics ─────────────────────────────────────────────────────────

pub async fn metric_names_local(State(st): State<AppState>) -> Json<BTreeSet<String>> {
    Json(st.metrics.names())
}

pub async fn metric_names_cluster(
    State(st): State<AppState>,
    Extension(ctx): Extension<ExecutionContext>,
) -> Result<Json<BTreeSet<String>>, ApiError> {
    let cluster = st.membership.cluster_info().await?;
    let metrics = st.metrics.clone();
    let local = async move { Ok::<_, ParticipantError>(metrics.names()) };
    let names = st
        .aggregator
        .fan_out_fold(
            &ctx,
            &cluster,
            PeerQuery::new("/metrics/local"),
            local,
            BTreeSet::new(),
            |mut acc, part: BTreeSet<String>| {
                acc.extend(part);
                acc
            },
        )
        .await?;
    Ok(Json(names))
}

fn local_metric_samples(st: &AppState, name: &str, limit: usize, order: Order) -> Vec<MetricSample> {
    let mut samples = st.metrics.samples(name, usize::MAX).unwrap_or_default();
    if order == Order::Asc {
        samples.reverse();
    }
    samples.truncate(limit);
    samples
}

pub async fn metric_samples_local(
    State(st): State<AppState>,
    Extension(ctx): Extension<ExecutionContext>,
    Path(name): Path<String>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Vec<MetricSample>>, ApiError> {
    let q = params.resolve(&ctx, st.max_limit)?;
    let limit = local_limit(q.limit)?;
    Ok(Json(local_metric_samples(&st, &name, limit, q.order)))
}

pub async fn metric_samples_cluster(
    State(st): State<AppState>,
    Extension(ctx): Extension<ExecutionContext>,
    Path(name): Path<String>,
    Query(params): Query<QueryParams>,
) -> Result<Json<Vec<MetricSample>>, ApiError> {
    let q = params.resolve(&ctx, st.max_limit)?;
    let cluster = st.membership.cluster_info().await?;
    let query = PeerQuery::new(format!("/metrics/local/{}", encode_segment(&name)));
    let (limit, order) = (q.limit, q.order);
    let local_st = st.clone();
    let local = async move {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok::<_, ParticipantError>(local_metric_samples(&local_st, &name, limit, order))
    };
    let samples = st
        .aggregator
        .aggregate(&ctx, limit, order, &cluster, query, local)
        .await?;
    Ok(Json(samples))
}
