use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use vantage_common::ClusterInfo;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("invalid node record at '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid peer '{0}', expected id=ip:port")]
    InvalidPeer(String),
}

/// Source of the peer set consulted at the start of every fan-out.
#[async_trait]
pub trait Membership: Send + Sync {
    async fn cluster_info(&self) -> Result<ClusterInfo, MembershipError>;
}

/// Key-value store with expiring entries, used for node registration.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Writes `value` under `key`, expiring after `ttl` unless written again.
    async fn put_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration)
        -> Result<(), MembershipError>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, MembershipError>;
}
