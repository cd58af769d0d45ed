mod odr_tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chain::{ChainStore, MemoryChain, DEVNET_CONFIG};
use containers::cht::{bloom_trie_key, build_cht, cht_key};
use containers::trie::lookup;
use containers::{Block, Bytes, ChtEntry, Hash, Trie, U256};
use libp2p_identity::PeerId;
use parking_lot::Mutex;

use super::config::LesConfig;
use super::odr::LesOdr;
use super::retrieve::RetrieveManager;
use super::server_pool::ServerPool;
use crate::peer_set::{PeerHead, PeerSet};
use crate::sync::tests::{test_state, TestChain, TestState};
use crate::transport::LesNetwork;
use crate::types::{HeaderProof, LesRequest, LesResponse, RequestId, SyncRequest, SyncResponse};

/// Bloom bits stored in the served bloom trie.
pub const BLOOM_BITS: [u16; 2] = [7, 9];

pub fn bloom_vector(bit: u16, section: u64) -> Bytes {
    Bytes::from(vec![bit as u8, section as u8, 0xaa])
}

/// Everything a light server knows: the chain, its state, CHT sections and
/// a bloom trie per section.
pub struct LesServer {
    pub chain: TestChain,
    pub state: TestState,
    pub chts: Vec<Trie>,
    pub bloom_tries: Vec<Trie>,
}

impl LesServer {
    pub fn new(blocks: u64) -> Self {
        let state = test_state();
        let chain = TestChain::genesis().with_state(&state).extend(blocks, 1, 5);
        let frequency = DEVNET_CONFIG.cht_frequency;
        let sections = (blocks + 1) / frequency;

        let chts = (0..sections)
            .map(|section| {
                let start = section * frequency;
                build_cht((start..start + frequency).map(|number| {
                    (
                        number,
                        ChtEntry {
                            hash: chain.header(number).hash(),
                            td: U256::from(number),
                        },
                    )
                }))
                .unwrap()
            })
            .collect();
        let bloom_tries = (0..sections.max(1))
            .map(|section| {
                Trie::build(BLOOM_BITS.iter().map(|bit| {
                    (
                        bloom_trie_key(*bit, section),
                        bloom_vector(*bit, section).to_vec(),
                    )
                }))
                .unwrap()
            })
            .collect();

        Self {
            chain,
            state,
            chts,
            bloom_tries,
        }
    }

    fn index_of(&self, hash: &Hash) -> Option<usize> {
        self.chain.blocks.iter().position(|block| block.hash() == *hash)
    }

    fn prove_state(&self, root: Hash, key: &[u8], proof: &mut Vec<Bytes>) {
        let _ = lookup(root, key, |hash| {
            let node = self.chain.nodes.get(hash)?;
            proof.push(node.clone());
            Some(node.to_vec())
        });
    }

    pub fn serve(&self, request: &LesRequest) -> LesResponse {
        match request {
            LesRequest::GetBlockBodies(hashes) => {
                match self.chain.serve(&SyncRequest::GetBlockBodies(hashes.clone())) {
                    SyncResponse::BlockBodies(bodies) => LesResponse::BlockBodies(bodies),
                    _ => LesResponse::BlockBodies(Vec::new()),
                }
            }
            LesRequest::GetReceipts(hashes) => {
                match self.chain.serve(&SyncRequest::GetReceipts(hashes.clone())) {
                    SyncResponse::Receipts(receipts) => LesResponse::Receipts(receipts),
                    _ => LesResponse::Receipts(Vec::new()),
                }
            }
            LesRequest::GetProofs(requests) => {
                let mut proof = Vec::new();
                for request in requests {
                    if let Some(index) = self.index_of(&request.block_hash) {
                        let root = self.chain.blocks[index].header.state_root;
                        self.prove_state(root, &request.key, &mut proof);
                    }
                }
                LesResponse::Proofs(proof)
            }
            LesRequest::GetCode(requests) => LesResponse::Code(
                requests
                    .iter()
                    .filter_map(|request| self.chain.nodes.get(&request.code_hash).cloned())
                    .collect(),
            ),
            LesRequest::GetHeaderProofs(requests) => LesResponse::HeaderProofs(
                requests
                    .iter()
                    .filter_map(|request| {
                        let cht = self.chts.get(request.section as usize)?;
                        Some(HeaderProof {
                            header: self.chain.header(request.number).clone(),
                            proof: cht.prove(&cht_key(request.number)),
                        })
                    })
                    .collect(),
            ),
            LesRequest::GetHelperTrieProofs(requests) => {
                let mut nodes = Vec::new();
                let mut values = Vec::new();
                for request in requests {
                    if let Some(trie) = self.bloom_tries.get(request.section as usize) {
                        nodes.extend(trie.prove(&request.key));
                        values.extend(trie.get(&request.key).map(Bytes::from));
                    }
                }
                LesResponse::HelperTrieProofs { nodes, values }
            }
        }
    }

    /// A plausible but wrong answer to `request`.
    pub fn corrupt(&self, request: &LesRequest) -> LesResponse {
        match self.serve(request) {
            LesResponse::BlockBodies(mut bodies) => {
                for body in &mut bodies {
                    body.transactions.clear();
                    body.uncles.push(Default::default());
                }
                LesResponse::BlockBodies(bodies)
            }
            LesResponse::Receipts(mut lists) => {
                for receipts in &mut lists {
                    for receipt in receipts.iter_mut() {
                        receipt.success = !receipt.success;
                    }
                }
                LesResponse::Receipts(lists)
            }
            LesResponse::Proofs(mut nodes) => {
                // Without the root nothing can be proven.
                if !nodes.is_empty() {
                    nodes.remove(0);
                }
                LesResponse::Proofs(nodes)
            }
            LesResponse::Code(codes) => {
                LesResponse::Code(codes.iter().map(|_| Bytes::from_static(b"evil")).collect())
            }
            LesResponse::HeaderProofs(mut proofs) => {
                for proof in &mut proofs {
                    proof.header = self.chain.header(proof.header.number + 1).clone();
                }
                LesResponse::HeaderProofs(proofs)
            }
            LesResponse::HelperTrieProofs { nodes, values } => LesResponse::HelperTrieProofs {
                nodes,
                values: values.iter().map(|_| Bytes::from_static(&[0])).collect(),
            },
        }
    }

    /// Headers of the served chain, without bodies, up to `number`. This is
    /// what a light client holds after a header sync.
    pub fn header_store(&self, number: u64) -> MemoryChain {
        let store = MemoryChain::new(self.chain.blocks[0].clone());
        let headers: Vec<_> = (1..=number)
            .map(|number| self.chain.header(number).clone())
            .collect();
        store.insert_header_chain(&headers).unwrap();
        store
    }

    pub fn hash(&self, number: u64) -> Hash {
        self.chain.header(number).hash()
    }

    pub fn block(&self, number: u64) -> &Block {
        &self.chain.blocks[number as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Honest,
    /// Never answers.
    Stall,
    /// Answers with data that fails validation.
    Corrupt,
    /// The transport fails every request.
    Unreachable,
}

/// Mock network for testing
pub struct MockLesNetwork {
    server: Arc<LesServer>,
    peers: Mutex<HashMap<PeerId, Behavior>>,
    log: Mutex<Vec<(PeerId, LesRequest)>>,
    disconnected: Mutex<Vec<PeerId>>,
}

impl MockLesNetwork {
    pub fn new(server: Arc<LesServer>) -> Self {
        Self {
            server,
            peers: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
        }
    }

    pub fn add_peer(&self, peer: PeerId, behavior: Behavior) {
        self.peers.lock().insert(peer, behavior);
    }

    pub fn requests_to(&self, peer: &PeerId) -> Vec<LesRequest> {
        self.log
            .lock()
            .iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.log.lock().len()
    }

    pub fn disconnected(&self) -> Vec<PeerId> {
        self.disconnected.lock().clone()
    }
}

#[async_trait]
impl LesNetwork for MockLesNetwork {
    async fn request(
        &self,
        peer: PeerId,
        _id: RequestId,
        request: LesRequest,
    ) -> Result<LesResponse> {
        self.log.lock().push((peer, request.clone()));
        let behavior = self.peers.lock().get(&peer).copied();
        match behavior {
            Some(Behavior::Honest) => Ok(self.server.serve(&request)),
            Some(Behavior::Corrupt) => Ok(self.server.corrupt(&request)),
            Some(Behavior::Stall) => futures::future::pending().await,
            Some(Behavior::Unreachable) => Err(anyhow!("connection to {peer} reset")),
            None => Err(anyhow!("unknown peer {peer}")),
        }
    }

    fn disconnect(&self, peer: PeerId) {
        self.disconnected.lock().push(peer);
    }
}

pub fn test_config() -> LesConfig {
    LesConfig {
        soft_timeout_ms: 50,
        hard_timeout_ms: 300,
        retrieve_timeout_ms: 3_000,
        distribute_timeout_ms: 200,
        ..LesConfig::default()
    }
}

pub struct Harness {
    pub server: Arc<LesServer>,
    pub store: MemoryChain,
    pub peers: Arc<PeerSet>,
    pub pool: Arc<ServerPool>,
    pub network: Arc<MockLesNetwork>,
    pub odr: LesOdr<MockLesNetwork>,
}

impl Harness {
    /// Light client holding the served chain's headers up to `local_head`.
    pub fn new(server: Arc<LesServer>, local_head: u64, config: LesConfig) -> Self {
        let store = server.header_store(local_head);
        let peers = Arc::new(PeerSet::new());
        let network = Arc::new(MockLesNetwork::new(server.clone()));
        let pool = Arc::new(ServerPool::new(&server.hash(0), &config));
        let retriever = RetrieveManager::new(config, network.clone(), peers.clone())
            .with_server_pool(pool.clone());
        let odr = LesOdr::new(retriever, Arc::new(store.clone()), DEVNET_CONFIG);
        Self {
            server,
            store,
            peers,
            pool,
            network,
            odr,
        }
    }

    pub fn add_peer(&self, version: u32, behavior: Behavior) -> PeerId {
        let head = self.server.chain.head().number;
        self.add_peer_at(version, head, behavior)
    }

    pub fn add_peer_at(&self, version: u32, head: u64, behavior: Behavior) -> PeerId {
        let id = PeerId::random();
        self.network.add_peer(id, behavior);
        self.peers
            .register(
                id,
                version,
                PeerHead {
                    hash: self.server.hash(head),
                    number: head,
                    td: U256::from(head),
                },
            )
            .unwrap();
        id
    }

    /// Make `peer` the first choice of the distributor.
    pub fn prefer(&self, peer: &PeerId) {
        self.peers.update_rtt(peer, Duration::ZERO);
    }
}

#[test]
fn served_chain_matches_local_headers() {
    let server = LesServer::new(80);
    let store = server.header_store(80);
    assert_eq!(store.current_header().number, 80);
    assert_eq!(server.chts.len(), 1);
    assert_eq!(
        server.serve(&LesRequest::GetBlockBodies(vec![server.hash(5)])),
        LesResponse::BlockBodies(vec![server.block(5).body.clone()])
    );
}
