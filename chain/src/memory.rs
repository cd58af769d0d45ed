use std::collections::HashMap;
use std::sync::Arc;

use containers::state::state_key;
use containers::trie::{lookup, Trie};
use containers::{Account, Address, Block, Body, Bytes, Hash, Header, Receipt, U256, EMPTY_ROOT};
use parking_lot::RwLock;
use tracing::debug;

use crate::store::{ChainStore, StateView, StoreError};

#[derive(Debug, Default)]
struct Inner {
    headers: HashMap<Hash, Header>,
    tds: HashMap<Hash, U256>,
    /// Canonical header hashes indexed by block number.
    canonical: Vec<Hash>,
    bodies: HashMap<Hash, Body>,
    receipts: HashMap<Hash, Vec<Receipt>>,
    head_header: Hash,
    head_block: Hash,
    head_fast: Hash,
    state_nodes: HashMap<Hash, Vec<u8>>,
    /// Block numbers in the order they were written.
    import_log: Vec<u64>,
    fail_from: Option<u64>,
}

impl Inner {
    fn header(&self, hash: &Hash) -> Header {
        self.headers.get(hash).cloned().unwrap_or_default()
    }

    fn check_writable(&self, number: u64) -> Result<(), StoreError> {
        match self.fail_from {
            Some(from) if number >= from => Err(StoreError::Backend(format!(
                "write of block #{number} rejected"
            ))),
            _ => Ok(()),
        }
    }

    /// Insert a header whose parent is known, returning whether it was new.
    fn write_header(&mut self, header: &Header) -> Result<bool, StoreError> {
        let hash = header.hash();
        if self.headers.contains_key(&hash) {
            return Ok(false);
        }
        let parent = self
            .headers
            .get(&header.parent_hash)
            .ok_or(StoreError::UnknownAncestor {
                number: header.number,
                parent: header.parent_hash,
            })?;
        if parent.number + 1 != header.number {
            return Err(StoreError::NonContiguous {
                number: header.number,
                parent_number: parent.number,
            });
        }
        let td = self.tds.get(&header.parent_hash).copied().unwrap_or_default() + header.difficulty;
        self.headers.insert(hash, header.clone());
        self.tds.insert(hash, td);

        let head_td = self.tds.get(&self.head_header).copied().unwrap_or_default();
        if td > head_td {
            self.set_canonical(hash);
            self.head_header = hash;
        }
        Ok(true)
    }

    /// Rewrite the canonical index so that it ends at `hash`.
    fn set_canonical(&mut self, hash: Hash) {
        let mut current = self.header(&hash);
        let mut current_hash = hash;
        self.canonical.truncate(current.number as usize + 1);
        loop {
            let number = current.number as usize;
            if self.canonical.len() <= number {
                self.canonical.resize(number + 1, Hash::ZERO);
            }
            if self.canonical[number] == current_hash {
                break;
            }
            self.canonical[number] = current_hash;
            if number == 0 {
                break;
            }
            current_hash = current.parent_hash;
            current = self.header(&current_hash);
        }
    }

    fn td(&self, hash: &Hash) -> U256 {
        self.tds.get(hash).copied().unwrap_or_default()
    }

    fn write_block(&mut self, block: &Block) -> Result<Hash, StoreError> {
        self.check_writable(block.number())?;
        if !self.bodies.contains_key(&block.parent_hash()) {
            return Err(StoreError::UnknownAncestor {
                number: block.number(),
                parent: block.parent_hash(),
            });
        }
        self.write_header(&block.header)?;
        let hash = block.hash();
        self.bodies.insert(hash, block.body.clone());
        self.import_log.push(block.number());
        Ok(hash)
    }
}

/// In-memory [`ChainStore`] used by tests and the demo node.
#[derive(Clone, Debug)]
pub struct MemoryChain {
    inner: Arc<RwLock<Inner>>,
    genesis: Header,
}

impl MemoryChain {
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.hash();
        let mut inner = Inner {
            head_header: hash,
            head_block: hash,
            head_fast: hash,
            canonical: vec![hash],
            ..Default::default()
        };
        inner.tds.insert(hash, genesis.header.difficulty);
        inner.headers.insert(hash, genesis.header.clone());
        inner.bodies.insert(hash, genesis.body);
        Self {
            inner: Arc::new(RwLock::new(inner)),
            genesis: genesis.header,
        }
    }

    /// Create a chain whose genesis state is `state`.
    pub fn with_state(genesis: Block, state: &Trie) -> Self {
        let chain = Self::new(genesis);
        chain.import_state(state);
        chain
    }

    pub fn import_state(&self, state: &Trie) {
        let mut inner = self.inner.write();
        for (hash, node) in state.nodes() {
            inner.state_nodes.insert(*hash, node.clone());
        }
    }

    /// Block numbers in the order they were imported.
    pub fn import_log(&self) -> Vec<u64> {
        self.inner.read().import_log.clone()
    }

    /// Make every write of block `number` or above fail.
    pub fn fail_writes_from(&self, number: u64) {
        self.inner.write().fail_from = Some(number);
    }

    pub fn state_node_count(&self) -> usize {
        self.inner.read().state_nodes.len()
    }
}

impl ChainStore for MemoryChain {
    fn genesis(&self) -> Header {
        self.genesis.clone()
    }

    fn current_header(&self) -> Header {
        let inner = self.inner.read();
        inner.header(&inner.head_header)
    }

    fn current_block(&self) -> Header {
        let inner = self.inner.read();
        inner.header(&inner.head_block)
    }

    fn current_fast_block(&self) -> Header {
        let inner = self.inner.read();
        inner.header(&inner.head_fast)
    }

    fn get_header(&self, hash: &Hash) -> Option<Header> {
        self.inner.read().headers.get(hash).cloned()
    }

    fn get_header_by_number(&self, number: u64) -> Option<Header> {
        let inner = self.inner.read();
        let hash = inner.canonical.get(number as usize)?;
        inner.headers.get(hash).cloned()
    }

    fn has_block(&self, hash: &Hash, number: u64) -> bool {
        let inner = self.inner.read();
        inner.bodies.contains_key(hash)
            && inner.headers.get(hash).is_some_and(|header| header.number == number)
    }

    fn get_td(&self, hash: &Hash) -> Option<U256> {
        self.inner.read().tds.get(hash).copied()
    }

    fn get_body(&self, hash: &Hash) -> Option<Body> {
        self.inner.read().bodies.get(hash).cloned()
    }

    fn get_receipts(&self, hash: &Hash) -> Option<Vec<Receipt>> {
        self.inner.read().receipts.get(hash).cloned()
    }

    fn insert_header_chain(&self, headers: &[Header]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write();
        let mut written = 0;
        for header in headers {
            inner.check_writable(header.number)?;
            if inner.write_header(header)? {
                inner.import_log.push(header.number);
                written += 1;
            }
        }
        debug!(count = written, head = inner.header(&inner.head_header).number, "Inserted headers");
        Ok(written)
    }

    fn insert_chain(&self, blocks: &[Block]) -> Result<usize, StoreError> {
        let mut inner = self.inner.write();
        for block in blocks {
            let hash = inner.write_block(block)?;
            if inner.td(&hash) > inner.td(&inner.head_block) {
                inner.head_block = hash;
                inner.head_fast = hash;
            }
        }
        Ok(blocks.len())
    }

    fn insert_receipt_chain(
        &self,
        blocks: &[Block],
        receipts: &[Vec<Receipt>],
    ) -> Result<usize, StoreError> {
        if blocks.len() != receipts.len() {
            return Err(StoreError::ReceiptsMismatch {
                blocks: blocks.len(),
                receipts: receipts.len(),
            });
        }
        let mut inner = self.inner.write();
        for (block, block_receipts) in blocks.iter().zip(receipts) {
            let hash = inner.write_block(block)?;
            inner.receipts.insert(hash, block_receipts.clone());
            if inner.td(&hash) > inner.td(&inner.head_fast) {
                inner.head_fast = hash;
            }
        }
        Ok(blocks.len())
    }

    fn has_state_node(&self, hash: &Hash) -> bool {
        *hash == EMPTY_ROOT || self.inner.read().state_nodes.contains_key(hash)
    }

    fn write_state_node(&self, hash: Hash, data: Bytes) -> Result<(), StoreError> {
        self.inner.write().state_nodes.insert(hash, data.to_vec());
        Ok(())
    }

    fn commit_fast_head(&self, hash: &Hash) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let header = inner
            .headers
            .get(hash)
            .cloned()
            .ok_or(StoreError::UnknownBlock(*hash))?;
        if !inner.bodies.contains_key(hash) {
            return Err(StoreError::UnknownBlock(*hash));
        }
        if header.state_root != EMPTY_ROOT && !inner.state_nodes.contains_key(&header.state_root) {
            return Err(StoreError::MissingState(header.state_root));
        }
        inner.head_block = *hash;
        if inner.td(hash) > inner.td(&inner.head_fast) {
            inner.head_fast = *hash;
        }
        Ok(())
    }

    fn state_at(&self, root: Hash) -> Result<Box<dyn StateView>, StoreError> {
        if !self.has_state_node(&root) {
            return Err(StoreError::MissingState(root));
        }
        Ok(Box::new(MemoryState {
            root,
            inner: self.inner.clone(),
        }))
    }

    fn rewind(&self, number: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let keep = (number as usize + 1).min(inner.canonical.len());
        inner.canonical.truncate(keep);
        let dropped: Vec<Hash> = inner
            .headers
            .iter()
            .filter(|(_, header)| header.number > number)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &dropped {
            inner.headers.remove(hash);
            inner.tds.remove(hash);
            inner.bodies.remove(hash);
            inner.receipts.remove(hash);
        }
        let head = inner.canonical[keep - 1];
        inner.head_header = head;
        inner.head_block = head;
        inner.head_fast = head;
        Ok(())
    }
}

struct MemoryState {
    root: Hash,
    inner: Arc<RwLock<Inner>>,
}

impl StateView for MemoryState {
    fn root(&self) -> Hash {
        self.root
    }

    fn account(&self, address: &Address) -> Result<Option<Account>, StoreError> {
        let inner = self.inner.read();
        let key = state_key(address);
        let value = lookup(self.root, key.as_slice(), |hash| inner.state_nodes.get(hash).cloned())
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        value
            .map(|raw| Account::decode(&raw).map_err(|err| StoreError::Backend(err.to_string())))
            .transpose()
    }
}
