mod state_sync_tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chain::{ChainStore, MemoryChain};
use consensus::{Engine, Faker};
use containers::state::{build_state, build_storage};
use containers::{
    keccak256, receipts_root, Account, Address, Block, Body, Bytes, Hash, HashOrNumber, Header,
    Log, Receipt, Transaction, U256, EMPTY_ROOT,
};
use libp2p_identity::PeerId;
use parking_lot::Mutex;

use crate::peer_set::{PeerHead, PeerInfo, PeerSet};
use crate::sync::config::SyncConfig;
use crate::sync::downloader::Downloader;
use crate::sync::states::NodeMode;
use crate::transport::SyncNetwork;
use crate::types::{RequestId, RequestKind, SyncRequest, SyncResponse, ETH63};

/// State trie served by test peers: a handful of accounts, some sharing one
/// storage trie and one contract.
pub struct TestState {
    pub root: Hash,
    pub accounts: Vec<(Address, Account)>,
    pub nodes: HashMap<Hash, Bytes>,
}

pub fn test_state() -> TestState {
    let slots: Vec<(Hash, Hash)> = (1..=6u8)
        .map(|i| (Hash::with_last_byte(i), Hash::repeat_byte(i)))
        .collect();
    let storage = build_storage(slots.iter().map(|(slot, value)| (slot, value))).unwrap();
    let code = Bytes::from_static(b"contract code");
    let code_hash = keccak256(&code);

    let accounts: Vec<(Address, Account)> = (1..=40u8)
        .map(|i| {
            let contract = i % 10 == 0;
            let account = Account {
                nonce: i as u64,
                balance: U256::from(1_000u64 * i as u64),
                storage_root: if contract { storage.root() } else { EMPTY_ROOT },
                code_hash: if contract { code_hash } else { EMPTY_ROOT },
            };
            (Address::with_last_byte(i), account)
        })
        .collect();
    let state = build_state(accounts.iter().map(|(address, account)| (address, account))).unwrap();

    let mut nodes: HashMap<Hash, Bytes> = state
        .nodes()
        .chain(storage.nodes())
        .map(|(hash, node)| (*hash, Bytes::from(node.clone())))
        .collect();
    nodes.insert(code_hash, code);

    TestState {
        root: state.root(),
        accounts,
        nodes,
    }
}

/// Canonical chain as seen by one or more test peers.
#[derive(Debug, Clone)]
pub struct TestChain {
    pub blocks: Vec<Block>,
    pub receipts: Vec<Vec<Receipt>>,
    pub nodes: HashMap<Hash, Bytes>,
    state_root: Hash,
}

impl TestChain {
    pub fn genesis() -> Self {
        Self {
            blocks: vec![Block::default()],
            receipts: vec![Vec::new()],
            nodes: HashMap::new(),
            state_root: EMPTY_ROOT,
        }
    }

    /// Commit every following block to `state` and serve its nodes.
    pub fn with_state(mut self, state: &TestState) -> Self {
        self.state_root = state.root;
        self.nodes = state.nodes.clone();
        self
    }

    /// Append `count` blocks. Blocks whose number is a multiple of `tx_every`
    /// carry a transaction and a receipt. `seed` tells forks of the same
    /// parent apart.
    pub fn extend(mut self, count: u64, seed: u8, tx_every: u64) -> Self {
        for _ in 0..count {
            let parent = self.head().clone();
            let number = parent.number + 1;
            let (body, receipts) = if tx_every > 0 && number % tx_every == 0 {
                let body = Body {
                    transactions: vec![Transaction {
                        nonce: number,
                        to: Some(Address::repeat_byte(seed)),
                        value: U256::from(number),
                        gas: 21_000,
                        input: Bytes::new(),
                    }],
                    uncles: Vec::new(),
                };
                let receipts = vec![Receipt {
                    success: true,
                    cumulative_gas_used: 21_000,
                    logs: vec![Log {
                        address: Address::repeat_byte(seed),
                        topics: vec![Hash::with_last_byte(seed)],
                        data: Bytes::from(number.to_be_bytes().to_vec()),
                    }],
                }];
                (body, receipts)
            } else {
                (Body::default(), Vec::new())
            };
            let header = Header {
                parent_hash: parent.hash(),
                uncle_hash: body.uncle_hash(),
                state_root: self.state_root,
                tx_root: body.tx_root(),
                receipt_root: receipts_root(&receipts),
                difficulty: U256::from(1u64),
                number,
                gas_limit: 8_000_000,
                gas_used: if body.is_empty() { 0 } else { 21_000 },
                time: parent.time + 12,
                extra: Bytes::from(vec![seed]),
                ..Default::default()
            };
            self.blocks.push(Block::new(header, body));
            self.receipts.push(receipts);
        }
        self
    }

    /// The first `number + 1` blocks, to fork from.
    pub fn prefix(&self, number: u64) -> Self {
        let len = number as usize + 1;
        Self {
            blocks: self.blocks[..len].to_vec(),
            receipts: self.receipts[..len].to_vec(),
            nodes: self.nodes.clone(),
            state_root: self.state_root,
        }
    }

    pub fn head(&self) -> &Header {
        &self.blocks[self.blocks.len() - 1].header
    }

    pub fn header(&self, number: u64) -> &Header {
        &self.blocks[number as usize].header
    }

    /// Local store holding this chain up to `number`.
    pub fn store(&self, number: u64) -> MemoryChain {
        let store = MemoryChain::new(self.blocks[0].clone());
        if number > 0 {
            store.insert_chain(&self.blocks[1..=number as usize]).unwrap();
        }
        store
    }

    fn index_of(&self, hash: &Hash) -> Option<usize> {
        self.blocks.iter().position(|block| block.hash() == *hash)
    }

    pub fn serve(&self, request: &SyncRequest) -> SyncResponse {
        match request {
            SyncRequest::GetBlockHeaders {
                origin,
                amount,
                skip,
                ..
            } => {
                let start = match origin {
                    HashOrNumber::Number(number) => Some(*number as usize),
                    HashOrNumber::Hash(hash) => self.index_of(hash),
                };
                let headers = start
                    .map(|start| {
                        self.blocks
                            .iter()
                            .skip(start)
                            .step_by(*skip as usize + 1)
                            .take(*amount as usize)
                            .map(|block| block.header.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                SyncResponse::BlockHeaders(headers)
            }
            SyncRequest::GetBlockBodies(hashes) => SyncResponse::BlockBodies(
                hashes
                    .iter()
                    .filter_map(|hash| self.index_of(hash))
                    .map(|index| self.blocks[index].body.clone())
                    .collect(),
            ),
            SyncRequest::GetReceipts(hashes) => SyncResponse::Receipts(
                hashes
                    .iter()
                    .filter_map(|hash| self.index_of(hash))
                    .map(|index| self.receipts[index].clone())
                    .collect(),
            ),
            SyncRequest::GetNodeData(hashes) => SyncResponse::NodeData(
                hashes
                    .iter()
                    .filter_map(|hash| self.nodes.get(hash).cloned())
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Honest,
    /// Never answers.
    Stall,
    /// Answers every request with nothing.
    Empty,
    /// Adds a transaction to every body it serves.
    CorruptBodies,
    /// Serves a sibling in place of the last header of every header response.
    /// The batch still links internally.
    ForgedHeaders,
}

fn empty_response(kind: RequestKind) -> SyncResponse {
    match kind {
        RequestKind::Bodies => SyncResponse::BlockBodies(Vec::new()),
        RequestKind::Receipts => SyncResponse::Receipts(Vec::new()),
        RequestKind::NodeData => SyncResponse::NodeData(Vec::new()),
        _ => SyncResponse::BlockHeaders(Vec::new()),
    }
}

/// Mock network for testing
pub struct MockNetwork {
    peers: Mutex<HashMap<PeerId, (Arc<TestChain>, Behavior)>>,
    log: Mutex<Vec<(PeerId, SyncRequest)>>,
    disconnected: Mutex<Vec<PeerId>>,
    latency: Duration,
}

impl MockNetwork {
    pub fn new(latency: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
            latency,
        }
    }

    pub fn add_peer(&self, peer: PeerId, chain: Arc<TestChain>, behavior: Behavior) {
        self.peers.lock().insert(peer, (chain, behavior));
    }

    pub fn requests_to(&self, peer: &PeerId) -> Vec<SyncRequest> {
        self.log
            .lock()
            .iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn disconnected(&self) -> Vec<PeerId> {
        self.disconnected.lock().clone()
    }
}

#[async_trait]
impl SyncNetwork for MockNetwork {
    async fn request(
        &self,
        peer: PeerId,
        _id: RequestId,
        request: SyncRequest,
    ) -> Result<SyncResponse> {
        self.log.lock().push((peer, request.clone()));
        let entry = self.peers.lock().get(&peer).cloned();
        let Some((chain, behavior)) = entry else {
            return Err(anyhow!("unknown peer {peer}"));
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match behavior {
            Behavior::Honest => Ok(chain.serve(&request)),
            Behavior::Stall => futures::future::pending().await,
            Behavior::Empty => Ok(empty_response(request.kind())),
            Behavior::CorruptBodies => {
                let mut response = chain.serve(&request);
                if let SyncResponse::BlockBodies(bodies) = &mut response {
                    for body in bodies.iter_mut() {
                        body.transactions.push(Transaction {
                            nonce: 999,
                            ..Default::default()
                        });
                    }
                }
                Ok(response)
            }
            Behavior::ForgedHeaders => {
                let mut response = chain.serve(&request);
                if let SyncResponse::BlockHeaders(headers) = &mut response {
                    if let Some(last) = headers.last_mut() {
                        last.extra = Bytes::from_static(b"forged");
                    }
                }
                Ok(response)
            }
        }
    }

    fn disconnect(&self, peer: PeerId) {
        self.disconnected.lock().push(peer);
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        header_batch: 16,
        body_batch: 8,
        receipt_batch: 8,
        state_batch: 16,
        request_timeout_ms: 200,
        expiry_interval_ms: 20,
        max_reorg_depth: 64,
        max_queued_blocks: 64,
        header_run_ahead: 4,
        max_import_batch: 16,
        fs_min_full_blocks: 16,
        distribute_timeout_ms: 1_000,
        ..SyncConfig::default()
    }
}

pub fn peer_info(number: u64) -> PeerInfo {
    PeerInfo::new(
        PeerId::random(),
        ETH63,
        PeerHead {
            number,
            ..Default::default()
        },
    )
}

pub fn faker() -> Arc<dyn Engine> {
    Arc::new(Faker::default())
}

pub struct Harness {
    pub store: MemoryChain,
    pub network: Arc<MockNetwork>,
    pub downloader: Downloader<MockNetwork>,
}

impl Harness {
    pub fn new(store: MemoryChain, config: SyncConfig, node_mode: NodeMode) -> Self {
        Self::with_latency(store, config, node_mode, Duration::ZERO)
    }

    pub fn with_latency(
        store: MemoryChain,
        config: SyncConfig,
        node_mode: NodeMode,
        latency: Duration,
    ) -> Self {
        Self::build(store, config, node_mode, latency, faker())
    }

    pub fn with_engine(
        store: MemoryChain,
        config: SyncConfig,
        node_mode: NodeMode,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self::build(store, config, node_mode, Duration::ZERO, engine)
    }

    fn build(
        store: MemoryChain,
        config: SyncConfig,
        node_mode: NodeMode,
        latency: Duration,
        engine: Arc<dyn Engine>,
    ) -> Self {
        let network = Arc::new(MockNetwork::new(latency));
        let downloader = Downloader::new(
            config,
            node_mode,
            Arc::new(store.clone()),
            engine,
            network.clone(),
            Arc::new(PeerSet::new()),
        )
        .unwrap();
        Self {
            store,
            network,
            downloader,
        }
    }

    pub fn add_peer(&self, chain: &Arc<TestChain>, version: u32, behavior: Behavior) -> PeerId {
        let id = PeerId::random();
        self.network.add_peer(id, chain.clone(), behavior);
        let head = chain.head();
        self.downloader
            .register_peer(
                id,
                version,
                PeerHead {
                    hash: head.hash(),
                    number: head.number,
                    td: U256::from(head.number),
                },
            )
            .unwrap();
        id
    }
}
