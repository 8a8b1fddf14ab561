use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use vantage_common::SampleNode;

/// Sample trees recorded per label (operation name), bounded per label.
#[derive(Debug)]
pub struct ProfileStore {
    capacity: usize,
    groups: DashMap<String, Mutex<VecDeque<(DateTime<Utc>, SampleNode)>>>,
}

impl ProfileStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            groups: DashMap::new(),
        }
    }

    pub fn record(&self, label: &str, ts: DateTime<Utc>, samples: SampleNode) {
        if samples.is_empty() {
            return;
        }
        let group = self
            .groups
            .entry(label.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut buf = group.lock().unwrap_or_else(|p| p.into_inner());
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back((ts, samples));
    }

    pub fn labels(&self) -> BTreeSet<String> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }

    /// Merged tree of `label` recorded within `[from, to]`.
    pub fn aggregate(
        &self,
        label: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Option<SampleNode> {
        let group = self.groups.get(label)?;
        let buf = group.lock().unwrap_or_else(|p| p.into_inner());
        buf.iter()
            .filter(|(ts, _)| from.map_or(true, |f| *ts >= f) && to.map_or(true, |t| *ts <= t))
            .fold(None, |acc, (_, s)| SampleNode::aggregate(acc, Some(s.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tree(path: &[&str], n: u64) -> SampleNode {
        let mut s = SampleNode::new();
        s.add_path(path, n);
        s
    }

    #[test]
    fn test_aggregate_window() {
        let store = ProfileStore::new(10);
        let t = |s| Utc.timestamp_opt(s, 0).unwrap();
        store.record("GET /logs/cluster", t(10), tree(&["fan_out"], 2));
        store.record("GET /logs/cluster", t(20), tree(&["fan_out"], 3));
        store.record("GET /logs/cluster", t(30), tree(&["merge"], 1));

        let all = store.aggregate("GET /logs/cluster", None, None).unwrap();
        assert_eq!(all.count, 6);
        let window = store
            .aggregate("GET /logs/cluster", Some(t(15)), Some(t(25)))
            .unwrap();
        assert_eq!(window.count, 3);
        assert!(store.aggregate("GET /logs/cluster", Some(t(40)), None).is_none());
        assert!(store.aggregate("nope", None, None).is_none());
    }

    #[test]
    fn test_empty_trees_are_not_recorded() {
        let store = ProfileStore::new(10);
        store.record("x", Utc::now(), SampleNode::new());
        assert!(store.labels().is_empty());
    }
}
