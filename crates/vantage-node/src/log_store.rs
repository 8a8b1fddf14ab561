use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;
use vantage_common::{LogFilter, LogRecord, Order};

pub const DEFAULT_APPENDER: &str = "default";

/// Bounded in-memory ring buffer of records per appender. Every record lands
/// in [`DEFAULT_APPENDER`]; records appended to a named appender also land there.
#[derive(Debug)]
pub struct LogStore {
    capacity: usize,
    appenders: DashMap<String, Mutex<VecDeque<LogRecord>>>,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        let appenders = DashMap::new();
        appenders.insert(DEFAULT_APPENDER.to_string(), Mutex::new(VecDeque::new()));
        Self {
            capacity: capacity.max(1),
            appenders,
        }
    }

    pub fn append(&self, record: LogRecord) {
        self.push(DEFAULT_APPENDER, record);
    }

    pub fn append_to(&self, appender: &str, record: LogRecord) {
        if appender != DEFAULT_APPENDER {
            self.push(appender, record.clone());
        }
        self.push(DEFAULT_APPENDER, record);
    }

    fn push(&self, appender: &str, record: LogRecord) {
        let ring = self
            .appenders
            .entry(appender.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut buf = ring.lock().unwrap_or_else(|p| p.into_inner());
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(record);
    }

    pub fn appenders(&self) -> Vec<String> {
        let mut names: Vec<String> = self.appenders.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Up to `limit` matching records, first in `order` by timestamp.
    /// `None` when the appender does not exist.
    pub fn query(
        &self,
        appender: &str,
        limit: usize,
        filter: &LogFilter,
        order: Order,
    ) -> Option<Vec<LogRecord>> {
        let ring = self.appenders.get(appender)?;
        let buf = ring.lock().unwrap_or_else(|p| p.into_inner());
        let mut matched: Vec<LogRecord> = buf.iter().filter(|r| filter.matches(r)).cloned().collect();
        drop(buf);
        match order {
            Order::Asc => matched.sort_by_key(|r| r.ts),
            Order::Desc => matched.sort_by(|a, b| b.ts.cmp(&a.ts)),
        }
        matched.truncate(limit);
        Some(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use vantage_common::LogLevel;

    fn rec(secs: i64, level: LogLevel) -> LogRecord {
        LogRecord {
            origin: "n1".into(),
            trace_id: None,
            ts: Utc.timestamp_opt(secs, 0).unwrap(),
            level,
            logger: "t".into(),
            message: format!("m{secs}"),
            attrs: Default::default(),
            stack_samples: Vec::new(),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let store = LogStore::new(3);
        for s in 1..=5 {
            store.append(rec(s, LogLevel::Info));
        }
        let out = store
            .query(DEFAULT_APPENDER, 10, &LogFilter::all(), Order::Asc)
            .unwrap();
        let secs: Vec<i64> = out.iter().map(|r| r.ts.timestamp()).collect();
        assert_eq!(secs, vec![3, 4, 5]);
    }

    #[test]
    fn test_query_filters_orders_limits() {
        let store = LogStore::new(100);
        store.append(rec(1, LogLevel::Warn));
        store.append(rec(2, LogLevel::Info));
        store.append(rec(3, LogLevel::Error));
        store.append(rec(4, LogLevel::Error));
        let filter = LogFilter::parse("level >= WARN").unwrap();
        let out = store.query(DEFAULT_APPENDER, 2, &filter, Order::Desc).unwrap();
        let secs: Vec<i64> = out.iter().map(|r| r.ts.timestamp()).collect();
        assert_eq!(secs, vec![4, 3]);
    }

    #[test]
    fn test_named_appender_also_feeds_default() {
        let store = LogStore::new(10);
        store.append_to("audit", rec(1, LogLevel::Info));
        assert_eq!(
            store.query("audit", 10, &LogFilter::all(), Order::Desc).map(|v| v.len()),
            Some(1)
        );
        assert_eq!(
            store
                .query(DEFAULT_APPENDER, 10, &LogFilter::all(), Order::Desc)
                .map(|v| v.len()),
            Some(1)
        );
        assert!(store.query("missing", 10, &LogFilter::all(), Order::Desc).is_none());
        assert_eq!(store.appenders(), vec!["audit".to_string(), "default".to_string()]);
    }
}
