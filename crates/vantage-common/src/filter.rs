//! Log record filter expressions.
//!
//! Grammar: `clause (and clause)*` where `clause := field op value`.
//! Fields: `level logger message trace_id origin samples` (`samples` is the
//! number of stack sample elements on the record). Operators:
//! `== != < <= > >= contains`. Values are bare words or double-quoted strings.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::record::{LogLevel, LogRecord};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("empty filter clause at position {0}")]
    EmptyClause(usize),
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("missing value after '{0}'")]
    MissingValue(String),
    #[error("unterminated quoted value")]
    Unterminated,
    #[error("invalid value '{value}' for field {field}")]
    InvalidValue { field: &'static str, value: String },
    #[error("unexpected token '{0}', expected 'and'")]
    Unexpected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Level,
    Logger,
    Message,
    TraceId,
    Origin,
    Samples,
}

impl Field {
    fn name(self) -> &'static str {
        match self {
            Field::Level => "level",
            Field::Logger => "logger",
            Field::Message => "message",
            Field::TraceId => "trace_id",
            Field::Origin => "origin",
            Field::Samples => "samples",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Contains => "contains",
        }
    }

    fn test(self, ord: Ordering) -> bool {
        match self {
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Contains => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Level(LogLevel),
    Count(u64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    field: Field,
    op: Op,
    value: Value,
}

impl Clause {
    fn matches(&self, record: &LogRecord) -> bool {
        match (&self.value, self.field) {
            (Value::Level(level), _) => self.op.test(record.level.cmp(level)),
            (Value::Count(n), _) => self.op.test((record.stack_samples.len() as u64).cmp(n)),
            (Value::Text(want), field) => {
                let have = match field {
                    Field::Logger => Some(record.logger.as_str()),
                    Field::Message => Some(record.message.as_str()),
                    Field::TraceId => record.trace_id.as_deref(),
                    Field::Origin => Some(record.origin.as_str()),
                    Field::Level | Field::Samples => None,
                };
                match (have, self.op) {
                    (Some(have), Op::Contains) => have.contains(want.as_str()),
                    (Some(have), op) => op.test(have.cmp(want.as_str())),
                    (None, Op::Ne) => true,
                    (None, _) => false,
                }
            }
        }
    }
}

/// A parsed filter; the empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    clauses: Vec<Clause>,
}

impl LogFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(input)?;
        let mut clauses = Vec::new();
        let mut it = tokens.into_iter().peekable();
        if it.peek().is_none() {
            return Ok(Self::all());
        }
        loop {
            let field_tok = it
                .next()
                .ok_or(FilterError::EmptyClause(clauses.len()))?;
            let field = match field_tok.as_str() {
                "level" => Field::Level,
                "logger" => Field::Logger,
                "message" | "msg" => Field::Message,
                "trace_id" | "traceId" => Field::TraceId,
                "origin" => Field::Origin,
                "samples" => Field::Samples,
                other => return Err(FilterError::UnknownField(other.to_string())),
            };
            let op_tok = it
                .next()
                .ok_or_else(|| FilterError::MissingValue(field.name().to_string()))?;
            let op = match op_tok.as_str() {
                "==" | "=" => Op::Eq,
                "!=" => Op::Ne,
                "<" => Op::Lt,
                "<=" => Op::Le,
                ">" => Op::Gt,
                ">=" => Op::Ge,
                "contains" => Op::Contains,
                other => return Err(FilterError::UnknownOperator(other.to_string())),
            };
            let raw = it
                .next()
                .ok_or_else(|| FilterError::MissingValue(op.as_str().to_string()))?;
            let invalid = || FilterError::InvalidValue {
                field: field.name(),
                value: raw.clone(),
            };
            let value = match field {
                Field::Level if op != Op::Contains => {
                    Value::Level(LogLevel::from_str(&raw).map_err(|_| invalid())?)
                }
                Field::Samples if op != Op::Contains => {
                    Value::Count(raw.parse().map_err(|_| invalid())?)
                }
                Field::Level | Field::Samples => return Err(invalid()),
                _ => Value::Text(raw.clone()),
            };
            clauses.push(Clause { field, op, value });
            match it.next() {
                None => break,
                Some(t) if t.eq_ignore_ascii_case("and") => continue,
                Some(t) => return Err(FilterError::Unexpected(t)),
            }
        }
        Ok(Self { clauses })
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        self.clauses.iter().all(|c| c.matches(record))
    }
}

impl FromStr for LogFilter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LogFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(" and ")?;
            }
            let value = match &c.value {
                Value::Level(l) => l.to_string(),
                Value::Count(n) => n.to_string(),
                Value::Text(t) => format!("\"{}\"", t.replace('\\', "\\\\").replace('"', "\\\"")),
            };
            write!(f, "{} {} {}", c.field.name(), c.op.as_str(), value)?;
        }
        Ok(())
    }
}

fn tokenize(input: &str) -> Result<Vec<String>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some('\\') => s.push(chars.next().ok_or(FilterError::Unterminated)?),
                    Some('"') => break,
                    Some(c) => s.push(c),
                    None => return Err(FilterError::Unterminated),
                }
            }
            tokens.push(s);
        } else if matches!(c, '=' | '!' | '<' | '>') {
            let mut s = String::new();
            while let Some(&c) = chars.peek() {
                if matches!(c, '=' | '!' | '<' | '>') {
                    s.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(s);
        } else {
            let mut s = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || matches!(c, '"' | '=' | '!' | '<' | '>') {
                    break;
                }
                s.push(c);
                chars.next();
            }
            tokens.push(s);
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::StackSampleElement;
    use chrono::Utc;

    fn record(level: LogLevel, message: &str, trace_id: Option<&str>) -> LogRecord {
        LogRecord {
            origin: "node-1".into(),
            trace_id: trace_id.map(str::to_string),
            ts: Utc::now(),
            level,
            logger: "vantage_node::handlers".into(),
            message: message.into(),
            attrs: Default::default(),
            stack_samples: Vec::new(),
        }
    }

    #[test]
    fn test_empty_matches_all() {
        let f = LogFilter::parse("  ").unwrap();
        assert!(f.matches(&record(LogLevel::Trace, "x", None)));
    }

    #[test]
    fn test_level_comparison() {
        let f = LogFilter::parse("level >= WARN").unwrap();
        assert!(f.matches(&record(LogLevel::Error, "x", None)));
        assert!(!f.matches(&record(LogLevel::Info, "x", None)));
    }

    #[test]
    fn test_conjunction_with_quoted_value() {
        let f = LogFilter::parse(r#"message contains "peer down" and origin == node-1"#).unwrap();
        assert!(f.matches(&record(LogLevel::Info, "peer down: node-3", None)));
        assert!(!f.matches(&record(LogLevel::Info, "all good", None)));
    }

    #[test]
    fn test_trace_with_samples() {
        let f = LogFilter::parse(r#"samples > 0 and trace_id == "abc""#).unwrap();
        let mut r = record(LogLevel::Info, "profileDetail", Some("abc"));
        assert!(!f.matches(&r));
        r.stack_samples.push(StackSampleElement {
            id: 0,
            parent_id: None,
            count: 1,
            method: "ROOT".into(),
        });
        assert!(f.matches(&r));
        assert!(!f.matches(&record(LogLevel::Info, "profileDetail", None)));
    }

    #[test]
    fn test_malformed() {
        assert_eq!(
            LogFilter::parse("color == red"),
            Err(FilterError::UnknownField("color".into()))
        );
        assert!(matches!(
            LogFilter::parse("level == LOUD"),
            Err(FilterError::InvalidValue { .. })
        ));
        assert!(matches!(
            LogFilter::parse("message == \"open"),
            Err(FilterError::Unterminated)
        ));
        assert!(matches!(
            LogFilter::parse("level == INFO or level == WARN"),
            Err(FilterError::Unexpected(_))
        ));
        assert!(matches!(LogFilter::parse("level =="), Err(FilterError::MissingValue(_))));
    }

    #[test]
    fn test_display_reparses() {
        let f = LogFilter::parse(r#"level < ERROR and message contains "a \"b\"""#).unwrap();
        assert_eq!(LogFilter::parse(&f.to_string()).unwrap(), f);
    }
}
