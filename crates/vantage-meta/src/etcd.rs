use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use etcd_client::{Client, GetOptions, PutOptions};
use tokio::sync::Mutex;

use crate::types::{MembershipError, NodeStore};

/// Lease held by each key this store has written.
#[derive(Debug, Default)]
struct LeaseBook {
    leases: HashMap<String, i64>,
}

impl LeaseBook {
    fn current(&self, key: &str) -> Option<i64> {
        self.leases.get(key).copied()
    }

    /// Remembers `lease` for `key`, returning the one it replaces.
    fn record(&mut self, key: &str, lease: i64) -> Option<i64> {
        self.leases.insert(key.to_string(), lease)
    }
}

struct Inner {
    client: Client,
    leases: LeaseBook,
}

/// Registers keys under one lease per key. Later writes keep that lease
/// alive and only grant a new one once etcd has expired it.
#[derive(Clone)]
pub struct EtcdNodeStore {
    inner: Arc<Mutex<Inner>>,
}

impl EtcdNodeStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self, MembershipError> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                client,
                leases: LeaseBook::default(),
            })),
        })
    }

    fn ttl_to_seconds(ttl: Duration) -> i64 {
        (ttl.as_secs_f64().ceil() as i64).max(1)
    }

    /// Refreshes `lease`. `false` once etcd no longer knows it.
    async fn keep_alive(client: &mut Client, lease: i64) -> Result<bool, MembershipError> {
        let (mut keeper, mut responses) = client.lease_keep_alive(lease).await?;
        keeper.keep_alive().await?;
        Ok(matches!(responses.message().await?, Some(resp) if resp.ttl() > 0))
    }
}

#[async_trait::async_trait]
impl NodeStore for EtcdNodeStore {
    async fn put_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), MembershipError> {
        let mut inner = self.inner.lock().await;
        let Inner { client, leases } = &mut *inner;

        let kept = match leases.current(key) {
            Some(id) => Self::keep_alive(client, id).await?.then_some(id),
            None => None,
        };
        let lease = match kept {
            Some(id) => id,
            None => {
                let id = client.lease_grant(Self::ttl_to_seconds(ttl), None).await?.id();
                if let Some(expired) = leases.record(key, id) {
                    tracing::debug!(key, expired, lease = id, "node lease renewed");
                }
                id
            }
        };
        let opts = PutOptions::new().with_lease(lease);
        client.put(key, value, Some(opts)).await?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MembershipError> {
        let mut inner = self.inner.lock().await;
        let opts = GetOptions::new().with_prefix();
        let resp = inner.client.get(prefix, Some(opts)).await?;

        let mut out = Vec::new();
        for kv in resp.kvs() {
            let k = String::from_utf8_lossy(kv.key()).to_string();
            out.push((k, kv.value().to_vec()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_up_to_whole_seconds() {
        assert_eq!(EtcdNodeStore::ttl_to_seconds(Duration::from_millis(1)), 1);
        assert_eq!(EtcdNodeStore::ttl_to_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(EtcdNodeStore::ttl_to_seconds(Duration::ZERO), 1);
    }

    #[test]
    fn test_lease_book_tracks_one_lease_per_key() {
        let mut book = LeaseBook::default();
        assert_eq!(book.current("/vantage/nodes/a"), None);
        assert_eq!(book.record("/vantage/nodes/a", 7), None);
        assert_eq!(book.record("/vantage/nodes/b", 9), None);
        assert_eq!(book.current("/vantage/nodes/a"), Some(7));
        assert_eq!(book.record("/vantage/nodes/a", 8), Some(7));
        assert_eq!(book.current("/vantage/nodes/a"), Some(8));
        assert_eq!(book.current("/vantage/nodes/b"), Some(9));
    }
}
