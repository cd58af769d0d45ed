use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chain::{ChainConfig, ChainStore};
use containers::state::state_key;
use containers::trie::lookup;
use containers::{keccak256, Account, Address, Body, Bytes, Hash, Header, Receipt, EMPTY_ROOT};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{IndexError, OdrError};
use super::indexer::ChtIndexer;
use super::request::{
    AccountRequest, BloomBitsRequest, BlockBodyRequest, ChtRequest, ContractCodeRequest,
    ProvenHeader, ReceiptsRequest,
};
use super::retrieve::RetrieveManager;
use crate::transport::LesNetwork;

/// Answers chain and state queries for a light client.
///
/// Local data is used when present. Everything else is fetched through the
/// [`RetrieveManager`] and checked against a root the client already trusts:
/// the state, transaction or receipt root of a locally verified header, or a
/// CHT or bloom trie section root. Trie nodes that passed such a check are
/// cached and reused for later state reads.
pub struct LesOdr<N: LesNetwork> {
    retriever: RetrieveManager<N>,
    store: Arc<dyn ChainStore>,
    chain_config: ChainConfig,
    cht_roots: RwLock<BTreeMap<u64, Hash>>,
    bloom_roots: RwLock<BTreeMap<u64, Hash>>,
    proof_cache: Mutex<LruCache<Hash, Bytes>>,
}

impl<N: LesNetwork> LesOdr<N> {
    pub fn new(
        retriever: RetrieveManager<N>,
        store: Arc<dyn ChainStore>,
        chain_config: ChainConfig,
    ) -> Self {
        let cache_size =
            NonZeroUsize::new(retriever.config().proof_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            retriever,
            store,
            chain_config,
            cht_roots: RwLock::new(BTreeMap::new()),
            bloom_roots: RwLock::new(BTreeMap::new()),
            proof_cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    pub fn retriever(&self) -> &RetrieveManager<N> {
        &self.retriever
    }

    pub fn add_cht_root(&self, section: u64, root: Hash) {
        debug!(section, %root, "Trusting CHT root");
        self.cht_roots.write().insert(section, root);
    }

    pub fn add_bloom_trie_root(&self, section: u64, root: Hash) {
        debug!(section, %root, "Trusting bloom trie root");
        self.bloom_roots.write().insert(section, root);
    }

    pub fn cht_root(&self, section: u64) -> Option<Hash> {
        self.cht_roots.read().get(&section).copied()
    }

    pub fn bloom_trie_root(&self, section: u64) -> Option<Hash> {
        self.bloom_roots.read().get(&section).copied()
    }

    /// Trust every CHT section the indexer finalized since its last run.
    pub fn apply_indexer(&self, indexer: &mut ChtIndexer) -> Result<usize, IndexError> {
        let built = indexer.update()?;
        let count = built.len();
        for (section, root) in built {
            self.add_cht_root(section, root);
        }
        Ok(count)
    }

    fn local_header(&self, block_hash: &Hash) -> Result<Header, OdrError> {
        self.store
            .get_header(block_hash)
            .ok_or(OdrError::UnknownBlock(*block_hash))
    }

    fn cache_nodes<I: IntoIterator<Item = Bytes>>(&self, nodes: I) {
        let mut cache = self.proof_cache.lock();
        for node in nodes {
            cache.put(keccak256(&node), node);
        }
    }

    pub fn cached_nodes(&self) -> usize {
        self.proof_cache.lock().len()
    }

    /// Account of `address` in the state after block `block_hash`.
    pub async fn account_at(
        &self,
        block_hash: &Hash,
        address: &Address,
        cancel: &CancellationToken,
    ) -> Result<Option<Account>, OdrError> {
        let header = self.local_header(block_hash)?;
        let key = state_key(address);
        let cached = {
            let mut cache = self.proof_cache.lock();
            lookup(header.state_root, key.as_slice(), |hash| {
                cache.get(hash).map(|node| node.to_vec())
            })
        };
        if let Ok(value) = cached {
            if let Some(account) = value.map(|raw| Account::decode(&raw)).transpose().ok() {
                debug!(%address, number = header.number, "Account served from proof cache");
                return Ok(account);
            }
        }

        let proven = self
            .retriever
            .retrieve(&AccountRequest { header, address: *address }, cancel)
            .await?;
        self.cache_nodes(proven.nodes);
        Ok(proven.account)
    }

    /// Contract code with hash `code_hash`, as deployed at `block_hash`.
    pub async fn code(
        &self,
        block_hash: &Hash,
        code_hash: &Hash,
        cancel: &CancellationToken,
    ) -> Result<Bytes, OdrError> {
        if *code_hash == EMPTY_ROOT {
            return Ok(Bytes::new());
        }
        let cached = self.proof_cache.lock().get(code_hash).cloned();
        if let Some(code) = cached {
            return Ok(code);
        }
        let header = self.local_header(block_hash)?;
        let request = ContractCodeRequest {
            block_hash: *block_hash,
            number: header.number,
            code_hash: *code_hash,
        };
        let code = self.retriever.retrieve(&request, cancel).await?;
        self.cache_nodes([code.clone()]);
        Ok(code)
    }

    pub async fn receipts(
        &self,
        block_hash: &Hash,
        cancel: &CancellationToken,
    ) -> Result<Vec<Receipt>, OdrError> {
        let header = self.local_header(block_hash)?;
        if header.has_empty_receipts() {
            return Ok(Vec::new());
        }
        if let Some(receipts) = self.store.get_receipts(block_hash) {
            return Ok(receipts);
        }
        Ok(self
            .retriever
            .retrieve(&ReceiptsRequest { header }, cancel)
            .await?)
    }

    pub async fn body(&self, block_hash: &Hash, cancel: &CancellationToken) -> Result<Body, OdrError> {
        let header = self.local_header(block_hash)?;
        if header.has_empty_body() {
            return Ok(Body::default());
        }
        if let Some(body) = self.store.get_body(block_hash) {
            return Ok(body);
        }
        Ok(self
            .retriever
            .retrieve(&BlockBodyRequest { header }, cancel)
            .await?)
    }

    /// Canonical header at `number` with its total difficulty. Headers the
    /// client does not hold are proven against the CHT section covering them.
    pub async fn canonical_header(
        &self,
        number: u64,
        cancel: &CancellationToken,
    ) -> Result<ProvenHeader, OdrError> {
        if let Some(header) = self.store.get_header_by_number(number) {
            if let Some(td) = self.store.get_td(&header.hash()) {
                return Ok(ProvenHeader { header, td });
            }
        }

        let section = self.chain_config.cht_section(number);
        let cht_root = self
            .cht_root(section)
            .ok_or(OdrError::MissingChtRoot(section))?;
        let request = ChtRequest {
            section,
            number,
            section_end: (section + 1) * self.chain_config.cht_frequency - 1,
            cht_root,
        };
        Ok(self.retriever.retrieve(&request, cancel).await?)
    }

    /// Bloom bit vector `bit` for each of `sections`, in the same order.
    pub async fn bloom_bits(
        &self,
        bit: u16,
        sections: &[u64],
        cancel: &CancellationToken,
    ) -> Result<Vec<Bytes>, OdrError> {
        if sections.is_empty() {
            return Ok(Vec::new());
        }
        let roots = sections
            .iter()
            .map(|section| {
                self.bloom_trie_root(*section)
                    .map(|root| (*section, root))
                    .ok_or(OdrError::MissingBloomRoot(*section))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let last_section = sections.iter().copied().max().unwrap_or_default();
        let request = BloomBitsRequest {
            bit,
            sections: roots,
            last_block: (last_section + 1) * self.chain_config.bloom_trie_frequency - 1,
        };
        Ok(self.retriever.retrieve(&request, cancel).await?)
    }

    /// Bloom bit vector `bit` for every bloom trie section overlapping blocks
    /// `from..=to`.
    pub async fn bloom_bits_for_blocks(
        &self,
        bit: u16,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Bytes>, OdrError> {
        if from > to {
            return Ok(Vec::new());
        }
        let sections = (self.chain_config.bloom_section(from)..=self.chain_config.bloom_section(to))
            .collect::<Vec<_>>();
        self.bloom_bits(bit, &sections, cancel).await
    }
}
