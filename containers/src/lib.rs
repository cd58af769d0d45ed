pub mod block;
pub mod cht;
pub mod receipt;
pub mod state;
pub mod trie;
pub mod types;

pub use block::{Block, Body, Header, Transaction};
pub use cht::ChtEntry;
pub use receipt::{receipts_root, Log, Receipt};
pub use state::Account;
pub use trie::{Trie, TrieError, TrieNode};
pub use types::{keccak256, Address, Bytes, Hash, HashOrNumber, U256, EMPTY_ROOT};
