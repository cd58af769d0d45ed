use chain::StoreError;
use containers::{Hash, TrieError};
use thiserror::Error;

/// Why a response does not answer the request it was sent for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unexpected {0} response")]
    WrongResponse(&'static str),

    #[error("expected {expected} items, got {got}")]
    ItemCount { expected: usize, got: usize },

    #[error("{0} does not match its commitment")]
    Mismatch(&'static str),

    #[error("invalid proof: {0}")]
    Proof(#[from] TrieError),

    #[error("proof does not contain the requested key")]
    MissingValue,

    #[error("proven value cannot be decoded")]
    Decode,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrieveError {
    #[error("no server available for the request")]
    NoPeer,

    #[error("retrieval cancelled")]
    Cancelled,

    #[error("no valid answer after asking {attempts} servers")]
    RetrieveFailed { attempts: usize },

    #[error("retrieval timed out")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OdrError {
    #[error(transparent)]
    Retrieve(#[from] RetrieveError),

    #[error("block {0} is not known locally")]
    UnknownBlock(Hash),

    #[error("no trusted CHT root for section {0}")]
    MissingChtRoot(u64),

    #[error("no trusted bloom trie root for section {0}")]
    MissingBloomRoot(u64),

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("canonical header #{0} is missing")]
    MissingHeader(u64),

    #[error("total difficulty of block {0} is missing")]
    MissingTd(Hash),

    #[error("failed to build section trie: {0}")]
    Trie(#[from] TrieError),
}
