//! Token access to the introspection routes.
//!
//! Every token maps to a [`Role`]. Reading another node's logs, profiles or
//! metrics needs [`Role::Operator`]; peers present an operator token when they
//! fan a query out.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

pub const AUTH_TOKENS_ENV: &str = "VANTAGE_AUTH_TOKENS";
const API_KEY: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    /// Health and metrics only.
    Viewer,
    /// Local and cluster introspection queries.
    Operator,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            // `admin` is an alias.
            "operator" | "admin" => Ok(Role::Operator),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// The authenticated caller, stored in the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Token prefix, safe to log.
    pub token_hint: String,
    pub role: Role,
}

impl Caller {
    fn anonymous() -> Self {
        Self {
            token_hint: "-".into(),
            role: Role::Operator,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthRejection {
    #[error("missing bearer token or x-api-key header")]
    MissingCredentials,
    #[error("unknown access token")]
    UnknownToken,
    #[error("{role:?} token cannot read introspection data")]
    Forbidden { role: Role },
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (status, kind) = match self {
            AuthRejection::MissingCredentials | AuthRejection::UnknownToken => {
                (StatusCode::UNAUTHORIZED, "unauthorized")
            }
            AuthRejection::Forbidden { .. } => (StatusCode::FORBIDDEN, "forbidden"),
        };
        let body = serde_json::json!({
            "error": { "message": self.to_string(), "type": kind }
        });
        (status, Json(body)).into_response()
    }
}

/// Token table. `None` turns authentication off.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    tokens: Option<Arc<HashMap<String, Role>>>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled(&self) -> bool {
        self.tokens.is_some()
    }

    /// Parses `token:role,...`. Malformed entries are skipped with a warning;
    /// the table is enabled even when none survive, which locks every
    /// protected route.
    pub fn from_tokens(raw: &str) -> Self {
        let tokens = raw
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                let parsed = entry
                    .split_once(':')
                    .ok_or_else(|| "expected token:role".to_string())
                    .and_then(|(token, role)| Ok((token.trim().to_string(), role.parse()?)));
                match parsed {
                    Ok(pair) => Some(pair),
                    Err(reason) => {
                        tracing::warn!(entry = %hint(entry), %reason, "skipping access token");
                        None
                    }
                }
            })
            .collect();
        Self {
            tokens: Some(Arc::new(tokens)),
        }
    }

    /// Reads [`AUTH_TOKENS_ENV`]; unset means disabled.
    pub fn from_env() -> Self {
        match std::env::var(AUTH_TOKENS_ENV) {
            Ok(raw) => Self::from_tokens(&raw),
            Err(_) => {
                tracing::warn!("auth disabled: {AUTH_TOKENS_ENV} not set");
                Self::disabled()
            }
        }
    }

    /// Resolves the caller from a bearer token or the api key header.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Caller, AuthRejection> {
        let Some(tokens) = &self.tokens else {
            return Ok(Caller::anonymous());
        };
        let token = presented_token(headers).ok_or(AuthRejection::MissingCredentials)?;
        let role = tokens.get(token).copied().ok_or(AuthRejection::UnknownToken)?;
        Ok(Caller {
            token_hint: hint(token),
            role,
        })
    }
}

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim());
    bearer
        .or_else(|| headers.get(API_KEY).and_then(|v| v.to_str().ok()))
        .filter(|token| !token.is_empty())
}

fn hint(token: &str) -> String {
    token.chars().take(4).chain("…".chars()).collect()
}

/// Authenticates the request against the state's [`AuthConfig`] and stores the
/// [`Caller`] in its extensions.
pub async fn auth_middleware<S>(State(state): State<S>, mut req: Request<Body>, next: Next) -> Response
where
    S: AsRef<AuthConfig> + Clone + Send + Sync + 'static,
{
    match state.as_ref().authenticate(req.headers()) {
        Ok(caller) => {
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Err(rejection) => rejection.into_response(),
    }
}

/// Rejects callers below [`Role::Operator`]. Runs inside [`auth_middleware`].
pub async fn require_operator(req: Request<Body>, next: Next) -> Response {
    match req.extensions().get::<Caller>() {
        Some(caller) if caller.role >= Role::Operator => next.run(req).await,
        Some(caller) => AuthRejection::Forbidden { role: caller.role }.into_response(),
        None => AuthRejection::MissingCredentials.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(name: header::HeaderName, value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, HeaderValue::from_static(value));
        h
    }

    #[test]
    fn test_from_tokens_skips_malformed_entries() {
        let cfg = AuthConfig::from_tokens("ops-1:operator, bad, v:viewer, x:root, root:admin");
        let tokens = cfg.tokens.as_ref().unwrap();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens.get("ops-1"), Some(&Role::Operator));
        assert_eq!(tokens.get("root"), Some(&Role::Operator));
    }

    #[test]
    fn test_disabled_admits_anonymous_operator() {
        let caller = AuthConfig::disabled().authenticate(&HeaderMap::new()).unwrap();
        assert_eq!(caller.role, Role::Operator);
    }

    #[test]
    fn test_authenticate_bearer_and_api_key() {
        let cfg = AuthConfig::from_tokens("op-token:operator,view:viewer");
        let caller = cfg
            .authenticate(&headers(header::AUTHORIZATION, "bearer op-token"))
            .unwrap();
        assert_eq!(caller.role, Role::Operator);
        assert_eq!(caller.token_hint, "op-t…");

        let api_key = header::HeaderName::from_static(API_KEY);
        let caller = cfg.authenticate(&headers(api_key, "view")).unwrap();
        assert_eq!(caller.role, Role::Viewer);
    }

    #[test]
    fn test_authenticate_rejections() {
        let cfg = AuthConfig::from_tokens("op:operator");
        assert_eq!(
            cfg.authenticate(&HeaderMap::new()),
            Err(AuthRejection::MissingCredentials)
        );
        assert_eq!(
            cfg.authenticate(&headers(header::AUTHORIZATION, "Bearer nope")),
            Err(AuthRejection::UnknownToken)
        );
        assert_eq!(
            cfg.authenticate(&headers(header::AUTHORIZATION, "Basic op")),
            Err(AuthRejection::MissingCredentials)
        );
    }

    #[test]
    fn test_rejection_status() {
        let resp = AuthRejection::Forbidden { role: Role::Viewer }.into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AuthRejection::UnknownToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
