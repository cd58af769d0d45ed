//! Storage collaborator consumed by the synchronizer.
//!
//! The sync core never looks inside the storage engine. It reads headers and
//! bodies to find common ancestors and writes verified data through the
//! `insert_*` family. Only the downloader's import step calls the writers.

use containers::{Account, Address, Block, Body, Bytes, Hash, Header, Receipt, U256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("unknown ancestor {parent} for block #{number}")]
    UnknownAncestor { number: u64, parent: Hash },
    #[error("block #{number} does not follow #{parent_number}")]
    NonContiguous { number: u64, parent_number: u64 },
    #[error("receipts count {receipts} does not match blocks count {blocks}")]
    ReceiptsMismatch { blocks: usize, receipts: usize },
    #[error("state {0} is not available")]
    MissingState(Hash),
    #[error("unknown block {0}")]
    UnknownBlock(Hash),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Read access to one committed state.
pub trait StateView: Send + Sync {
    fn root(&self) -> Hash;
    fn account(&self, address: &Address) -> Result<Option<Account>, StoreError>;
}

pub trait ChainStore: Send + Sync {
    fn genesis(&self) -> Header;

    /// Head of the header chain.
    fn current_header(&self) -> Header;

    /// Head of the fully imported block chain.
    fn current_block(&self) -> Header;

    /// Head of the chain imported with receipts but without execution.
    fn current_fast_block(&self) -> Header;

    fn get_header(&self, hash: &Hash) -> Option<Header>;
    fn get_header_by_number(&self, number: u64) -> Option<Header>;

    fn has_header(&self, hash: &Hash, number: u64) -> bool {
        self.get_header(hash)
            .is_some_and(|header| header.number == number)
    }

    /// Whether the block body is stored locally.
    fn has_block(&self, hash: &Hash, number: u64) -> bool;

    fn get_td(&self, hash: &Hash) -> Option<U256>;
    fn get_body(&self, hash: &Hash) -> Option<Body>;
    fn get_receipts(&self, hash: &Hash) -> Option<Vec<Receipt>>;

    fn insert_header_chain(&self, headers: &[Header]) -> Result<usize, StoreError>;
    fn insert_chain(&self, blocks: &[Block]) -> Result<usize, StoreError>;
    fn insert_receipt_chain(
        &self,
        blocks: &[Block],
        receipts: &[Vec<Receipt>],
    ) -> Result<usize, StoreError>;

    fn has_state_node(&self, hash: &Hash) -> bool;
    fn write_state_node(&self, hash: Hash, data: Bytes) -> Result<(), StoreError>;

    /// Promote a block imported without execution to the full chain head once its
    /// state is complete.
    fn commit_fast_head(&self, hash: &Hash) -> Result<(), StoreError>;

    fn state_at(&self, root: Hash) -> Result<Box<dyn StateView>, StoreError>;

    /// Drop every canonical block above `number`.
    fn rewind(&self, number: u64) -> Result<(), StoreError>;
}
