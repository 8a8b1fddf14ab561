use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use vantage_common::{LogRecord, MetricSample, Order};

/// Key a cluster merge orders by.
pub trait MergeKey {
    type Key: Ord;

    fn merge_key(&self) -> Self::Key;
}

impl MergeKey for LogRecord {
    type Key = DateTime<Utc>;

    fn merge_key(&self) -> Self::Key {
        self.ts_key()
    }
}

impl MergeKey for MetricSample {
    type Key = DateTime<Utc>;

    fn merge_key(&self) -> Self::Key {
        self.ts
    }
}

struct Entry<T: MergeKey> {
    key: T::Key,
    seq: u64,
    desc: bool,
    item: T,
}

impl<T: MergeKey> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: MergeKey> Eq for Entry<T> {}

impl<T: MergeKey> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: MergeKey> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_key = if self.desc {
            other.key.cmp(&self.key)
        } else {
            self.key.cmp(&other.key)
        };
        by_key.then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Keeps the first `limit` elements seen in `order` (smallest keys for
/// ascending, largest for descending), ties going to the earlier arrival.
/// Memory stays O(limit) however many elements are offered.
pub struct BoundedMerge<T: MergeKey> {
    limit: usize,
    order: Order,
    seq: u64,
    heap: BinaryHeap<Entry<T>>,
}

impl<T: MergeKey> BoundedMerge<T> {
    pub fn new(limit: usize, order: Order) -> Self {
        Self {
            limit,
            order,
            seq: 0,
            heap: BinaryHeap::with_capacity(limit.min(4096)),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, item: T) {
        if self.limit == 0 {
            return;
        }
        let entry = Entry {
            key: item.merge_key(),
            seq: self.seq,
            desc: self.order == Order::Desc,
            item,
        };
        self.seq += 1;
        if self.heap.len() < self.limit {
            self.heap.push(entry);
            return;
        }
        if let Some(mut worst) = self.heap.peek_mut() {
            if entry < *worst {
                *worst = entry;
            }
        }
    }

    /// Drains in the merge order.
    pub fn into_sorted(self) -> Vec<T> {
        self.heap.into_sorted_vec().into_iter().map(|e| e.item).collect()
    }
}

impl<T: MergeKey> Extend<T> for BoundedMerge<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item(i64, &'static str);

    impl MergeKey for Item {
        type Key = i64;

        fn merge_key(&self) -> i64 {
            self.0
        }
    }

    fn keys(m: BoundedMerge<Item>) -> Vec<i64> {
        m.into_sorted().iter().map(|i| i.0).collect()
    }

    #[test]
    fn test_ascending_keeps_smallest() {
        let mut m = BoundedMerge::new(3, Order::Asc);
        m.extend([Item(5, "a"), Item(1, "b"), Item(9, "c"), Item(3, "d"), Item(2, "e")]);
        assert_eq!(m.len(), 3);
        assert_eq!(keys(m), vec![1, 2, 3]);
    }

    #[test]
    fn test_descending_keeps_largest() {
        let mut m = BoundedMerge::new(3, Order::Desc);
        m.extend([Item(5, "a"), Item(1, "b"), Item(9, "c"), Item(3, "d"), Item(7, "e")]);
        assert_eq!(keys(m), vec![9, 7, 5]);
    }

    #[test]
    fn test_ties_keep_earlier_arrival() {
        let mut m = BoundedMerge::new(2, Order::Asc);
        m.extend([Item(1, "first"), Item(2, "x"), Item(2, "late")]);
        let out = m.into_sorted();
        assert_eq!(out, vec![Item(1, "first"), Item(2, "x")]);
    }

    #[test]
    fn test_zero_limit_keeps_nothing() {
        let mut m = BoundedMerge::new(0, Order::Desc);
        m.push(Item(1, "a"));
        assert!(m.is_empty());
    }
}
