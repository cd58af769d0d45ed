pub mod distributor;
pub mod les;
pub mod peer_set;
pub mod serde_utils;
pub mod sync;
pub mod transport;
pub mod types;

pub use distributor::{DistributeError, RequestDistributor};
pub use peer_set::{PeerHead, PeerInfo, PeerSet, PeerSetError};
pub use transport::{ChannelNetwork, LesChannel, LesNetwork, SyncChannel, SyncNetwork};
