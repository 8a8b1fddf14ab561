use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// How peers are reached: scheme plus port, shared by every node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NetworkService {
    pub scheme: String,
    pub port: u16,
}

impl NetworkService {
    pub fn http(port: u16) -> Self {
        Self {
            scheme: "http".to_string(),
            port,
        }
    }

    pub fn base_url(&self, addr: &IpAddr) -> String {
        self.base_url_with_port(addr, self.port)
    }

    pub fn base_url_with_port(&self, addr: &IpAddr, port: u16) -> String {
        match addr {
            IpAddr::V4(v4) => format!("{}://{}:{}", self.scheme, v4, port),
            IpAddr::V6(v6) => format!("{}://[{}]:{}", self.scheme, v6, port),
        }
    }
}

impl fmt::Display for NetworkService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.port)
    }
}

/// A peer as seen by the fan-out. `port` overrides the shared service port
/// (several nodes on one host).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerAddr {
    pub node_id: String,
    pub addr: IpAddr,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Snapshot of cluster membership, read at the start of each fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterInfo {
    pub local_node_id: String,
    pub peers: BTreeSet<PeerAddr>,
    pub http_service: NetworkService,
}

impl ClusterInfo {
    pub fn peer_base_url(&self, peer: &PeerAddr) -> String {
        self.http_service
            .base_url_with_port(&peer.addr, peer.port.unwrap_or(self.http_service.port))
    }
}
