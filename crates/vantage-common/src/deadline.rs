use std::time::Duration;

use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue};
use thiserror::Error;
use tokio::time::Instant;

use crate::headers;

/// Absolute monotonic instant by which a request must complete.
/// Computed once at request entry and never re-derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn after(start: Instant, budget: Duration) -> Self {
        Self(start + budget)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn remaining(&self) -> Duration {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.0.saturating_duration_since(now)
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Whether work started now and lasting `delay` still ends by the deadline.
    pub fn admits(&self, delay: Duration) -> bool {
        Instant::now()
            .checked_add(delay)
            .map(|end| end <= self.0)
            .unwrap_or(false)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeadlineError {
    #[error("invalid {header} header '{value}': {reason}")]
    Malformed {
        header: String,
        value: String,
        reason: String,
    },
    #[error("{header} header is not valid ASCII")]
    Encoding { header: String },
}

/// Reads and writes the deadline carried by request metadata.
pub trait DeadlineProtocol: Send + Sync {
    /// Derives the request deadline. Malformed metadata is an error, never a fallback.
    fn deserialize(&self, headers: &HeaderMap, start: Instant) -> Result<Deadline, DeadlineError>;

    /// Writes the remaining budget into outbound headers.
    fn serialize(&self, deadline: Deadline, headers: &mut HeaderMap);
}

#[derive(Debug, Clone)]
pub struct DefaultDeadlineProtocol {
    pub timeout_header: String,
    pub deadline_header: String,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for DefaultDeadlineProtocol {
    fn default() -> Self {
        Self {
            timeout_header: headers::TIMEOUT.to_string(),
            deadline_header: headers::DEADLINE.to_string(),
            default_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(300),
        }
    }
}

impl DefaultDeadlineProtocol {
    pub fn new(default_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            default_timeout,
            max_timeout,
            ..Self::default()
        }
    }

    fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, DeadlineError> {
        match headers.get(name) {
            None => Ok(None),
            Some(v) => v.to_str().map(|s| Some(s.trim())).map_err(|_| DeadlineError::Encoding {
                header: name.to_string(),
            }),
        }
    }
}

impl DeadlineProtocol for DefaultDeadlineProtocol {
    fn deserialize(&self, headers: &HeaderMap, start: Instant) -> Result<Deadline, DeadlineError> {
        let malformed = |header: &str, value: &str, reason: String| DeadlineError::Malformed {
            header: header.to_string(),
            value: value.to_string(),
            reason,
        };

        let from_timeout = match Self::header(headers, &self.timeout_header)? {
            Some(raw) => Some(
                parse_timeout(raw).map_err(|reason| malformed(&self.timeout_header, raw, reason))?,
            ),
            None => None,
        };
        let from_deadline = match Self::header(headers, &self.deadline_header)? {
            Some(raw) => {
                let wall = parse_wall_deadline(raw)
                    .map_err(|reason| malformed(&self.deadline_header, raw, reason))?;
                Some(
                    wall.signed_duration_since(Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                )
            }
            None => None,
        };

        let budget = match (from_timeout, from_deadline) {
            (Some(t), Some(d)) => t.min(d),
            (Some(t), None) => t,
            (None, Some(d)) => d,
            (None, None) => self.default_timeout,
        };
        Ok(Deadline::after(start, budget.min(self.max_timeout)))
    }

    fn serialize(&self, deadline: Deadline, headers: &mut HeaderMap) {
        let millis = deadline.remaining().as_millis();
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(self.timeout_header.as_bytes()),
            HeaderValue::from_str(&format!("{millis}ms")),
        ) {
            headers.insert(name, value);
        }
    }
}

/// Parses `<digits><unit>` with unit `ns|us|ms|s|m|h`; bare digits are milliseconds.
pub fn parse_timeout(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    if digits.is_empty() {
        return Err("expected a number".to_string());
    }
    let n: u64 = digits.parse().map_err(|e| format!("{e}"))?;
    let d = match unit.trim() {
        "" | "ms" => Duration::from_millis(n),
        "ns" => Duration::from_nanos(n),
        "us" => Duration::from_micros(n),
        "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n.saturating_mul(60)),
        "h" => Duration::from_secs(n.saturating_mul(3600)),
        other => return Err(format!("unknown unit '{other}'")),
    };
    Ok(d)
}

/// Accepts epoch milliseconds or RFC 3339.
fn parse_wall_deadline(raw: &str) -> Result<DateTime<Utc>, String> {
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        let millis: i64 = raw.parse().map_err(|e| format!("{e}"))?;
        return DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| "epoch millis out of range".to_string());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| format!("{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn test_parse_timeout_units() {
        assert_eq!(parse_timeout("250"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_timeout("3s"), Ok(Duration::from_secs(3)));
        assert_eq!(parse_timeout("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_timeout("15us"), Ok(Duration::from_micros(15)));
        assert!(parse_timeout("s").is_err());
        assert!(parse_timeout("10 fortnights").is_err());
    }

    #[tokio::test]
    async fn test_default_budget_when_absent() {
        let p = DefaultDeadlineProtocol::new(Duration::from_secs(7), Duration::from_secs(60));
        let start = Instant::now();
        let d = p.deserialize(&HeaderMap::new(), start).unwrap();
        assert_eq!(d.instant(), start + Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_timeout_header_clamped_to_max() {
        let p = DefaultDeadlineProtocol::new(Duration::from_secs(7), Duration::from_secs(60));
        let start = Instant::now();
        let d = p
            .deserialize(&header_map(&[(headers::TIMEOUT, "1h")]), start)
            .unwrap();
        assert_eq!(d.instant(), start + Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_malformed_is_error() {
        let p = DefaultDeadlineProtocol::default();
        let err = p
            .deserialize(&header_map(&[(headers::TIMEOUT, "soon")]), Instant::now())
            .unwrap_err();
        assert!(matches!(err, DeadlineError::Malformed { .. }));

        let err = p
            .deserialize(&header_map(&[(headers::DEADLINE, "yesterday")]), Instant::now())
            .unwrap_err();
        assert!(matches!(err, DeadlineError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_past_deadline_is_zero_budget() {
        let p = DefaultDeadlineProtocol::default();
        let start = Instant::now();
        let d = p
            .deserialize(&header_map(&[(headers::DEADLINE, "1000")]), start)
            .unwrap();
        assert_eq!(d.instant(), start);
    }

    #[tokio::test]
    async fn test_earlier_of_both_headers_wins() {
        let p = DefaultDeadlineProtocol::default();
        let start = Instant::now();
        let far = (Utc::now() + chrono::Duration::seconds(120)).to_rfc3339();
        let d = p
            .deserialize(
                &header_map(&[(headers::TIMEOUT, "2s"), (headers::DEADLINE, far.as_str())]),
                start,
            )
            .unwrap();
        assert_eq!(d.instant(), start + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialize_remaining() {
        let p = DefaultDeadlineProtocol::default();
        let d = Deadline::after(Instant::now(), Duration::from_millis(1500));
        tokio::time::advance(Duration::from_millis(500)).await;
        let mut h = HeaderMap::new();
        p.serialize(d, &mut h);
        assert_eq!(h.get(headers::TIMEOUT).unwrap(), "1000ms");
    }
}
