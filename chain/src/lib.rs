pub mod config;
pub mod memory;
pub mod store;

pub use config::{ChainConfig, DEVNET_CONFIG, MAINNET_CONFIG};
pub use memory::MemoryChain;
pub use store::{ChainStore, StateView, StoreError};
