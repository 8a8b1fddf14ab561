use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use vantage_cluster::AggregateError;
use vantage_meta::MembershipError;

/// Marks a response whose failure must take the process down once the
/// request's diagnostics are flushed.
#[derive(Debug, Clone, Copy)]
pub struct FatalFailure;

/// Error text of a failed response, read back when the request context closes.
#[derive(Debug, Clone)]
pub struct FailureMessage(pub String);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("request deadline exceeded")]
    Timeout,
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("membership unavailable: {0}")]
    Membership(#[from] MembershipError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Aggregate(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            ApiError::Aggregate(e) if e.is_deadline_exceeded() => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Aggregate(e) if e.is_fatal() => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Aggregate(_) => StatusCode::BAD_GATEWAY,
            ApiError::Membership(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Timeout => "deadline_exceeded",
            ApiError::Aggregate(e) if e.is_client_error() => "bad_request",
            ApiError::Aggregate(e) if e.is_deadline_exceeded() => "deadline_exceeded",
            ApiError::Aggregate(e) if e.is_fatal() => "fatal",
            ApiError::Aggregate(_) => "participant_failed",
            ApiError::Membership(_) => "membership_unavailable",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::Aggregate(e) if e.is_fatal())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        });
        let mut resp = (self.status(), Json(body)).into_response();
        resp.extensions_mut().insert(FailureMessage(self.to_string()));
        if self.is_fatal() {
            resp.extensions_mut().insert(FatalFailure);
        }
        resp
    }
}
