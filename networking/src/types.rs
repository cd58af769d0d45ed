use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use containers::{Body, Bytes, Hash, HashOrNumber, Header, Receipt};
use serde::{Deserialize, Serialize};

/// Correlation id carried by every request so a later response can be
/// matched to the reservation or retrieval that issued it.
pub type RequestId = u64;

/// Full-node protocol versions. Receipts and node data need 63.
pub const ETH62: u32 = 62;
pub const ETH63: u32 = 63;

/// Light protocol versions. Helper trie proofs need version 2.
pub const LPV1: u32 = 1;
pub const LPV2: u32 = 2;

/// Request categories a peer can be busy with independently.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Headers,
    Bodies,
    Receipts,
    NodeData,
    Odr,
}

impl RequestKind {
    pub const COUNT: usize = 5;

    pub fn index(self) -> usize {
        self as usize
    }

    /// Label used for metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Headers => "headers",
            RequestKind::Bodies => "bodies",
            RequestKind::Receipts => "receipts",
            RequestKind::NodeData => "states",
            RequestKind::Odr => "odr",
        }
    }
}

impl Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic source of request ids shared by everything that talks to peers.
#[derive(Debug, Default)]
pub struct RequestIds(AtomicU64);

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> RequestId {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    GetBlockHeaders {
        origin: HashOrNumber,
        amount: u64,
        skip: u64,
        reverse: bool,
    },
    GetBlockBodies(Vec<Hash>),
    GetReceipts(Vec<Hash>),
    GetNodeData(Vec<Hash>),
}

impl SyncRequest {
    pub fn headers(origin: impl Into<HashOrNumber>, amount: u64) -> Self {
        SyncRequest::GetBlockHeaders {
            origin: origin.into(),
            amount,
            skip: 0,
            reverse: false,
        }
    }

    /// Every `skip + 1`-th header starting at `origin`.
    pub fn skeleton(origin: impl Into<HashOrNumber>, amount: u64, skip: u64) -> Self {
        SyncRequest::GetBlockHeaders {
            origin: origin.into(),
            amount,
            skip,
            reverse: false,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            SyncRequest::GetBlockHeaders { .. } => RequestKind::Headers,
            SyncRequest::GetBlockBodies(_) => RequestKind::Bodies,
            SyncRequest::GetReceipts(_) => RequestKind::Receipts,
            SyncRequest::GetNodeData(_) => RequestKind::NodeData,
        }
    }
}

impl Display for SyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncRequest::GetBlockHeaders {
                origin,
                amount,
                skip: 0,
                ..
            } => write!(f, "GetBlockHeaders(origin={origin}, amount={amount})"),
            SyncRequest::GetBlockHeaders {
                origin,
                amount,
                skip,
                ..
            } => write!(f, "GetBlockHeaders(origin={origin}, amount={amount}, skip={skip})"),
            SyncRequest::GetBlockBodies(hashes) => write!(f, "GetBlockBodies({})", hashes.len()),
            SyncRequest::GetReceipts(hashes) => write!(f, "GetReceipts({})", hashes.len()),
            SyncRequest::GetNodeData(hashes) => write!(f, "GetNodeData({})", hashes.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResponse {
    BlockHeaders(Vec<Header>),
    BlockBodies(Vec<Body>),
    Receipts(Vec<Vec<Receipt>>),
    NodeData(Vec<Bytes>),
}

impl SyncResponse {
    pub fn kind(&self) -> RequestKind {
        match self {
            SyncResponse::BlockHeaders(_) => RequestKind::Headers,
            SyncResponse::BlockBodies(_) => RequestKind::Bodies,
            SyncResponse::Receipts(_) => RequestKind::Receipts,
            SyncResponse::NodeData(_) => RequestKind::NodeData,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SyncResponse::BlockHeaders(items) => items.len(),
            SyncResponse::BlockBodies(items) => items.len(),
            SyncResponse::Receipts(items) => items.len(),
            SyncResponse::NodeData(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Merkle proof request for one key of the state trie at `block_hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofRequest {
    pub block_hash: Hash,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRequest {
    pub block_hash: Hash,
    pub code_hash: Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderProofRequest {
    pub section: u64,
    pub number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HelperTrie {
    Cht,
    BloomTrie,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperTrieRequest {
    pub trie: HelperTrie,
    pub section: u64,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LesRequest {
    GetBlockBodies(Vec<Hash>),
    GetReceipts(Vec<Hash>),
    GetProofs(Vec<ProofRequest>),
    GetCode(Vec<CodeRequest>),
    GetHeaderProofs(Vec<HeaderProofRequest>),
    GetHelperTrieProofs(Vec<HelperTrieRequest>),
}

impl Display for LesRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LesRequest::GetBlockBodies(items) => write!(f, "GetBlockBodies({})", items.len()),
            LesRequest::GetReceipts(items) => write!(f, "GetReceipts({})", items.len()),
            LesRequest::GetProofs(items) => write!(f, "GetProofs({})", items.len()),
            LesRequest::GetCode(items) => write!(f, "GetCode({})", items.len()),
            LesRequest::GetHeaderProofs(items) => write!(f, "GetHeaderProofs({})", items.len()),
            LesRequest::GetHelperTrieProofs(items) => {
                write!(f, "GetHelperTrieProofs({})", items.len())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderProof {
    pub header: Header,
    pub proof: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LesResponse {
    BlockBodies(Vec<Body>),
    Receipts(Vec<Vec<Receipt>>),
    /// Unordered set of trie nodes covering every requested key.
    Proofs(Vec<Bytes>),
    Code(Vec<Bytes>),
    HeaderProofs(Vec<HeaderProof>),
    HelperTrieProofs {
        nodes: Vec<Bytes>,
        values: Vec<Bytes>,
    },
}
