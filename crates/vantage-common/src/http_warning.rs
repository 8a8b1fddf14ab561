use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// An RFC 7234 `Warning` header value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpWarning {
    pub code: u16,
    pub agent: String,
    pub text: String,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WarningParseError {
    #[error("invalid warning code in '{0}'")]
    Code(String),
    #[error("missing warning agent in '{0}'")]
    Agent(String),
    #[error("unterminated or missing quoted text in '{0}'")]
    Text(String),
    #[error("invalid warning date in '{0}'")]
    Date(String),
}

impl HttpWarning {
    pub const STALE: u16 = 110;
    pub const REVALIDATION_FAILED: u16 = 111;
    pub const DISCONNECTED: u16 = 112;
    pub const HEURISTIC_EXPIRATION: u16 = 113;
    pub const MISCELLANEOUS: u16 = 199;
    pub const TRANSFORMATION_APPLIED: u16 = 214;
    pub const PERSISTENT_MISCELLANEOUS: u16 = 299;

    pub fn new(code: u16, agent: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            code,
            agent: agent.into(),
            text: text.into(),
            date: None,
        }
    }

    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    pub fn parse(value: &str) -> Result<Self, WarningParseError> {
        let err_input = || value.to_string();
        let (code_raw, rest) = value
            .trim()
            .split_once(' ')
            .ok_or_else(|| WarningParseError::Code(err_input()))?;
        let code: u16 = code_raw
            .parse()
            .map_err(|_| WarningParseError::Code(err_input()))?;
        let (agent, rest) = rest
            .trim_start()
            .split_once(' ')
            .ok_or_else(|| WarningParseError::Agent(err_input()))?;
        if agent.is_empty() {
            return Err(WarningParseError::Agent(err_input()));
        }
        let (text, rest) =
            read_quoted(rest.trim_start()).ok_or_else(|| WarningParseError::Text(err_input()))?;
        let rest = rest.trim();
        let date = if rest.is_empty() {
            None
        } else {
            let (raw, tail) =
                read_quoted(rest).ok_or_else(|| WarningParseError::Date(err_input()))?;
            if !tail.trim().is_empty() {
                return Err(WarningParseError::Date(err_input()));
            }
            let parsed = DateTime::parse_from_rfc2822(&raw)
                .map_err(|_| WarningParseError::Date(err_input()))?;
            Some(parsed.with_timezone(&Utc))
        };
        Ok(Self {
            code,
            agent: agent.to_string(),
            text,
            date,
        })
    }
}

/// Reads a leading quoted-string; returns the unescaped content and the remainder.
fn read_quoted(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('"')?;
    let mut out = String::with_capacity(body.len());
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                let (_, escaped) = chars.next()?;
                out.push(escaped);
            }
            '"' => return Some((out, &body[i + 1..])),
            c => out.push(c),
        }
    }
    None
}

fn write_quoted(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in text.chars() {
        if c == '"' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

impl fmt::Display for HttpWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ", self.code, self.agent)?;
        write_quoted(f, &self.text)?;
        if let Some(date) = self.date {
            f.write_str(" ")?;
            write_quoted(f, &date.format(HTTP_DATE_FORMAT).to_string())?;
        }
        Ok(())
    }
}

impl FromStr for HttpWarning {
    type Err = WarningParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_parse_with_date() {
        let date = Utc.with_ymd_and_hms(2024, 3, 9, 17, 4, 5).unwrap();
        let warning =
            HttpWarning::new(HttpWarning::MISCELLANEOUS, "super", "aaaa   ").with_date(date);
        let parsed = HttpWarning::parse(&warning.to_string()).unwrap();
        assert_eq!(parsed, warning);
    }

    #[test]
    fn test_parse_escapes() {
        let parsed = HttpWarning::parse(r#"299 - "blabla\" \\ ""#).unwrap();
        assert_eq!(parsed.text, "blabla\" \\ ");
        assert_eq!(parsed.code, 299);
        assert_eq!(parsed.agent, "-");
        assert_eq!(parsed.date, None);
    }

    #[test]
    fn test_parse_unterminated_text() {
        assert!(matches!(
            HttpWarning::parse(r#"299 - "blabla\" \\ "#),
            Err(WarningParseError::Text(_))
        ));
    }

    #[test]
    fn test_parse_bad_code() {
        assert!(matches!(
            HttpWarning::parse(r#"abc - "x""#),
            Err(WarningParseError::Code(_))
        ));
    }
}
