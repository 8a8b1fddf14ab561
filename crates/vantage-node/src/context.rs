use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::{
    body::{Body, HttpBody},
    extract::{ConnectInfo, MatchedPath, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::time::Instant;
use vantage_common::headers;
use vantage_common::{
    ExecutionContext, HttpWarningsTag, LogAttribute, LogAttributesTag, LogLevel, Outcome,
};

use crate::error::{ApiError, FailureMessage, FatalFailure};
use crate::state::AppState;

pub const CLIENT_HOST: &str = "clientHost";
pub const IN_BYTES: &str = "inBytes";
pub const OUT_BYTES: &str = "outBytes";

/// Opens the request's [`ExecutionContext`], runs the handler under its
/// deadline and closes the context with the outcome, unless the handler
/// detached it.
pub async fn execution_context(
    State(st): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    if let Err(e) = apply_header_overwrites(&mut req) {
        return e.into_response();
    }

    let trace_id = req
        .headers()
        .get(headers::REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let deadline = match st.deadline_protocol.deserialize(req.headers(), start) {
        Ok(d) => d,
        Err(e) => return ApiError::BadRequest(e.to_string()).into_response(),
    };
    let log_level = match req.headers().get(headers::LOG_LEVEL) {
        None => None,
        Some(v) => match v.to_str().ok().map(str::parse::<LogLevel>) {
            Some(Ok(level)) => Some(level),
            _ => {
                return ApiError::BadRequest(format!(
                    "invalid {} header, expected trace|debug|info|warn|error",
                    headers::LOG_LEVEL
                ))
                .into_response()
            }
        },
    };

    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let name = format!("{} {}", req.method(), path);
    let ctx = ExecutionContext::start_with(name, trace_id, None, start, deadline, st.finalizer.clone());
    if let Some(level) = log_level {
        ctx.set_backend_min_level(level);
    }
    ctx.combine::<LogAttributesTag>(vec![
        LogAttribute::of(CLIENT_HOST, client_host(&req)),
        LogAttribute::of(IN_BYTES, body_len(req.body(), req.headers())),
    ]);
    req.extensions_mut().insert(ctx.clone());

    let handler = next.run(req);
    tokio::pin!(handler);
    let mut resp = tokio::select! {
        biased;
        resp = &mut handler => resp,
        _ = tokio::time::sleep_until(deadline.instant()) => {
            ctx.close(Outcome::TimedOut);
            ApiError::Timeout.into_response()
        }
    };

    if let Ok(v) = HeaderValue::from_str(ctx.id()) {
        resp.headers_mut().insert(headers::REQUEST_ID, v);
    }
    for warning in ctx.get::<HttpWarningsTag>().unwrap_or_default() {
        if let Ok(v) = HeaderValue::from_str(&warning.to_string()) {
            resp.headers_mut().append(headers::WARNING, v);
        }
    }

    match resp.status() {
        StatusCode::GATEWAY_TIMEOUT => {
            st.metrics.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
        }
        StatusCode::BAD_GATEWAY => {
            st.metrics.fanout_failures.fetch_add(1, Ordering::Relaxed);
        }
        _ => {}
    }

    if !ctx.is_detached() {
        ctx.add::<LogAttributesTag, _>(LogAttribute::of(
            OUT_BYTES,
            body_len(resp.body(), resp.headers()),
        ));
        let status = resp.status().as_u16();
        let outcome = match resp.extensions().get::<FailureMessage>() {
            Some(msg) if status >= 500 => Outcome::Failed {
                status,
                error: msg.0.clone(),
            },
            _ => Outcome::Completed { status },
        };
        ctx.close(outcome);
    }

    if resp.extensions().get::<FatalFailure>().is_some() {
        tracing::error!(trace_id = ctx.id(), "non-recoverable failure, shutting down");
        st.fatal.cancel();
    }
    resp
}

/// Peer address, prefixed by any `x-forwarded-for` chain.
fn client_host(req: &Request<Body>) -> String {
    let addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    match req
        .headers()
        .get(headers::FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(chain) => format!("{chain},{addr}"),
        None => addr,
    }
}

/// Exact body size when known up front, else the declared content length.
fn body_len(body: &Body, headers: &HeaderMap) -> u64 {
    body.size_hint()
        .exact()
        .or_else(|| {
            headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(0)
}

/// Query parameters named `_<header>` replace that request header.
fn apply_header_overwrites(req: &mut Request<Body>) -> Result<(), ApiError> {
    if req.uri().query().is_none() {
        return Ok(());
    }
    let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(req.uri())
        .map_err(|e| ApiError::BadRequest(e.body_text()))?;
    for (key, value) in pairs {
        let Some(header) = key.strip_prefix(headers::HEADER_OVERWRITE_PREFIX) else {
            continue;
        };
        let name = HeaderName::from_bytes(header.to_ascii_lowercase().as_bytes())
            .map_err(|_| ApiError::BadRequest(format!("invalid header overwrite '{key}'")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|_| ApiError::BadRequest(format!("invalid value for header overwrite '{key}'")))?;
        req.headers_mut().insert(name, value);
    }
    Ok(())
}
