//! Cluster fan-out: one query to the local node and every peer, merged.

pub mod aggregate;
pub mod merge;
pub mod transport;

pub use aggregate::{AggregateError, Aggregator, ParticipantError, PeerQuery};
pub use merge::{BoundedMerge, MergeKey};
pub use transport::{HttpTransport, RemoteError, RemoteRequest, RemoteTransport};
