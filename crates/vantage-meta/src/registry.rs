use std::collections::BTreeSet;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vantage_common::{ClusterInfo, NetworkService, PeerAddr};

use crate::etcd::EtcdNodeStore;
use crate::types::{Membership, MembershipError, NodeStore};

/// Membership backed by self-registration: each node writes
/// `/<prefix>/nodes/<node_id>` with a TTL and keeps refreshing it.
#[derive(Clone)]
pub struct RegistryMembership<S> {
    store: S,
    prefix: String,
    local: PeerAddr,
    http_service: NetworkService,
    ttl: Duration,
}

pub type EtcdMembership = RegistryMembership<EtcdNodeStore>;

impl EtcdMembership {
    pub async fn connect(
        endpoints: &[String],
        prefix: &str,
        local: PeerAddr,
        http_service: NetworkService,
        ttl: Duration,
    ) -> Result<Self, MembershipError> {
        let store = EtcdNodeStore::connect(endpoints).await?;
        Ok(Self::new(store, prefix, local, http_service, ttl))
    }
}

impl<S: NodeStore + Clone + 'static> RegistryMembership<S> {
    pub fn new(
        store: S,
        prefix: &str,
        local: PeerAddr,
        http_service: NetworkService,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.trim_end_matches('/').to_string(),
            local,
            http_service,
            ttl,
        }
    }

    fn nodes_prefix(&self) -> String {
        format!("{}/nodes/", self.prefix)
    }

    pub fn node_key(&self) -> String {
        format!("{}{}", self.nodes_prefix(), self.local.node_id)
    }

    pub async fn register(&self) -> Result<(), MembershipError> {
        let value = serde_json::to_vec(&self.local).map_err(|source| MembershipError::Decode {
            key: self.node_key(),
            source,
        })?;
        self.store.put_with_ttl(&self.node_key(), value, self.ttl).await
    }

    /// Registers now, then refreshes every third of the TTL until `cancel` fires.
    pub fn spawn_heartbeat(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        let period = (self.ttl / 3).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(node_id=%this.local.node_id, "membership heartbeat stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = this.register().await {
                            tracing::warn!(error=%e, node_id=%this.local.node_id, "membership heartbeat failed");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl<S: NodeStore + Clone + 'static> Membership for RegistryMembership<S> {
    async fn cluster_info(&self) -> Result<ClusterInfo, MembershipError> {
        let mut peers = BTreeSet::new();
        for (key, value) in self.store.list_prefix(&self.nodes_prefix()).await? {
            let peer: PeerAddr = match serde_json::from_slice(&value) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(key=%key, error=%e, "skipping unreadable node record");
                    continue;
                }
            };
            if peer.node_id != self.local.node_id {
                peers.insert(peer);
            }
        }
        Ok(ClusterInfo {
            local_node_id: self.local.node_id.clone(),
            peers,
            http_service: self.http_service.clone(),
        })
    }
}
