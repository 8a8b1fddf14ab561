use std::collections::BTreeSet;
use std::net::SocketAddr;

use vantage_common::{ClusterInfo, NetworkService, PeerAddr};

use crate::types::{Membership, MembershipError};

/// Fixed peer list from configuration.
#[derive(Debug, Clone)]
pub struct StaticMembership {
    info: ClusterInfo,
}

impl StaticMembership {
    pub fn new(local_node_id: &str, peers: BTreeSet<PeerAddr>, http_service: NetworkService) -> Self {
        let peers = peers
            .into_iter()
            .filter(|p| p.node_id != local_node_id)
            .collect();
        Self {
            info: ClusterInfo {
                local_node_id: local_node_id.to_string(),
                peers,
                http_service,
            },
        }
    }
}

#[async_trait::async_trait]
impl Membership for StaticMembership {
    async fn cluster_info(&self) -> Result<ClusterInfo, MembershipError> {
        Ok(self.info.clone())
    }
}

/// Parses `id=ip:port` entries separated by commas.
pub fn parse_peers(raw: &str) -> Result<BTreeSet<PeerAddr>, MembershipError> {
    let mut peers = BTreeSet::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let invalid = || MembershipError::InvalidPeer(trimmed.to_string());
        let (node_id, addr) = trimmed.split_once('=').ok_or_else(invalid)?;
        let addr: SocketAddr = addr.trim().parse().map_err(|_| invalid())?;
        if node_id.trim().is_empty() {
            return Err(invalid());
        }
        peers.insert(PeerAddr {
            node_id: node_id.trim().to_string(),
            addr: addr.ip(),
            port: Some(addr.port()),
        });
    }
    Ok(peers)
}
