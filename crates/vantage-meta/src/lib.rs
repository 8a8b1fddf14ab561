pub mod etcd;
pub mod memory;
pub mod registry;
pub mod static_peers;
pub mod types;

pub use etcd::EtcdNodeStore;
pub use memory::MemoryNodeStore;
pub use registry::{EtcdMembership, RegistryMembership};
pub use static_peers::{parse_peers, StaticMembership};
pub use types::{Membership, MembershipError, NodeStore};
