use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::types::{MembershipError, NodeStore};

/// In-process [`NodeStore`]; entries expire like leased etcd keys.
#[derive(Debug, Clone, Default)]
pub struct MemoryNodeStore {
    inner: Arc<RwLock<BTreeMap<String, (Vec<u8>, Instant)>>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl NodeStore for MemoryNodeStore {
    async fn put_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), MembershipError> {
        let mut kv = self.inner.write().await;
        kv.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MembershipError> {
        let now = Instant::now();
        let mut kv = self.inner.write().await;
        kv.retain(|_, (_, expires)| *expires > now);
        Ok(kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = MemoryNodeStore::new();
        store
            .put_with_ttl("/v/nodes/a", b"1".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        store
            .put_with_ttl("/v/other", b"2".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(store.list_prefix("/v/nodes/").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.list_prefix("/v/nodes/").await.unwrap().is_empty());
    }
}
