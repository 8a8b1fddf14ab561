use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use thiserror::Error;
use vantage_common::{headers, Deadline, DeadlineProtocol, DefaultDeadlineProtocol};
use vantage_retry::{Classify, FailureKind};

/// One GET against a peer. The same path and query go to every peer of a fan-out.
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub base_url: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub trace_id: String,
    pub deadline: Deadline,
}

impl RemoteRequest {
    pub fn url(&self) -> String {
        let mut url = format!("{}{}", self.base_url.trim_end_matches('/'), self.path);
        for (i, (k, v)) in self.query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(&urlencoding::encode(k));
            url.push('=');
            url.push_str(&urlencoding::encode(v));
        }
        url
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        headers: HeaderMap,
        body: String,
    },
    #[error("request to {url} failed ({kind}): {message}")]
    Transport {
        url: String,
        kind: &'static str,
        transient: Option<bool>,
        message: String,
    },
    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl Classify for RemoteError {
    fn kind(&self) -> FailureKind<'_> {
        match self {
            RemoteError::Status {
                status, headers, ..
            } => FailureKind::Status {
                status: *status,
                headers,
            },
            RemoteError::Transport { transient, .. } => FailureKind::Transport {
                transient: *transient,
            },
            RemoteError::Decode { .. } => FailureKind::Transport {
                transient: Some(false),
            },
        }
    }
}

/// Issues a single attempt of a peer request. Cancellation is by dropping the
/// returned future.
#[async_trait::async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    async fn fetch(&self, request: &RemoteRequest) -> Result<Bytes, RemoteError>;
}

fn classify_reqwest_error(error: &reqwest::Error) -> (&'static str, Option<bool>) {
    if error.is_timeout() {
        return ("timeout", Some(true));
    }
    if error.is_connect() {
        return ("connect", Some(true));
    }
    if error.is_builder() || error.is_redirect() {
        return ("request", Some(false));
    }
    ("other", None)
}

/// `reqwest`-backed transport. Forwards the trace id and the remaining budget.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    deadline_protocol: DefaultDeadlineProtocol,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            deadline_protocol: DefaultDeadlineProtocol::default(),
            auth_token: None,
        })
    }

    /// Bearer token presented to peers that have auth enabled.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    fn outbound_headers(&self, request: &RemoteRequest) -> HeaderMap {
        let mut h = HeaderMap::new();
        self.deadline_protocol.serialize(request.deadline, &mut h);
        if let Ok(v) = HeaderValue::from_str(&request.trace_id) {
            h.insert(headers::REQUEST_ID, v);
        }
        if let Some(token) = self.auth_token.as_deref() {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
                h.insert(http::header::AUTHORIZATION, v);
            }
        }
        h.insert(http::header::ACCEPT, HeaderValue::from_static("application/json"));
        h
    }
}

#[async_trait::async_trait]
impl RemoteTransport for HttpTransport {
    async fn fetch(&self, request: &RemoteRequest) -> Result<Bytes, RemoteError> {
        let url = request.url();
        let remaining = request.deadline.remaining();
        let transport_err = |e: reqwest::Error| {
            let (kind, transient) = classify_reqwest_error(&e);
            RemoteError::Transport {
                url: url.clone(),
                kind,
                transient,
                message: e.to_string(),
            }
        };

        let resp = self
            .client
            .get(&url)
            .headers(self.outbound_headers(request))
            .timeout(remaining)
            .send()
            .await
            .map_err(&transport_err)?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                url: url.clone(),
                status: status.as_u16(),
                headers,
                body,
            });
        }
        resp.bytes().await.map_err(&transport_err)
    }
}
