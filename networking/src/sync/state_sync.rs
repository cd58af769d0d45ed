use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chain::{ChainStore, StoreError};
use containers::{keccak256, Account, Bytes, Hash, TrieNode, EMPTY_ROOT};
use thiserror::Error;
use tracing::debug;

/// Trie a state node belongs to, which decides how its leaves are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Account,
    Storage,
    Code,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateSyncError {
    #[error("node {0} was not requested")]
    Unrequested(Hash),
    #[error("node {0} cannot be decoded")]
    Undecodable(Hash),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[derive(Debug)]
struct NodeRequest {
    kind: NodeKind,
    data: Option<Bytes>,
    parents: Vec<Hash>,
    /// Children that are not in storage yet.
    deps: usize,
}

/// Scheduler for downloading the state trie below one root.
///
/// Nodes are requested breadth first and every hash is requested once, no
/// matter how many parents reference it. A node is written to storage only
/// after all of its children are, so any node found in storage roots a
/// complete subtrie and an interrupted download can resume from the root.
pub struct StateSync {
    root: Hash,
    store: Arc<dyn ChainStore>,
    requests: HashMap<Hash, NodeRequest>,
    queue: VecDeque<Hash>,
    pulled: u64,
    committed: u64,
}

impl StateSync {
    pub fn new(root: Hash, store: Arc<dyn ChainStore>) -> Self {
        let mut sync = Self {
            root,
            store,
            requests: HashMap::new(),
            queue: VecDeque::new(),
            pulled: 0,
            committed: 0,
        };
        if !sync.store.has_state_node(&root) {
            sync.schedule(root, NodeKind::Account, None);
        }
        sync
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn is_done(&self) -> bool {
        self.requests.is_empty()
    }

    /// Hashes waiting to be requested.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Nodes delivered so far.
    pub fn pulled(&self) -> u64 {
        self.pulled
    }

    /// Nodes known to be part of the trie: written or still outstanding.
    pub fn known(&self) -> u64 {
        self.committed + self.requests.len() as u64
    }

    pub fn is_requested(&self, hash: &Hash) -> bool {
        self.requests
            .get(hash)
            .is_some_and(|request| request.data.is_none())
    }

    /// Take up to `max` hashes to request, oldest first.
    pub fn missing(&mut self, max: usize) -> Vec<Hash> {
        let count = max.min(self.queue.len());
        self.queue.drain(..count).collect()
    }

    /// Put hashes that were not delivered back at the front of the queue.
    pub fn requeue<I>(&mut self, hashes: I)
    where
        I: IntoIterator<Item = Hash>,
        I::IntoIter: DoubleEndedIterator,
    {
        for hash in hashes.into_iter().rev() {
            if self.is_requested(&hash) {
                self.queue.push_front(hash);
            }
        }
    }

    /// Accept one delivered node. The caller has already matched the node
    /// to a request by its hash.
    pub fn process(&mut self, data: Bytes) -> Result<Hash, StateSyncError> {
        let hash = keccak256(&data);
        let kind = match self.requests.get(&hash) {
            Some(request) if request.data.is_none() => request.kind,
            _ => return Err(StateSyncError::Unrequested(hash)),
        };
        let children = Self::children(hash, kind, &data)?;
        self.pulled += 1;

        let mut deps = 0;
        for (child, child_kind) in children {
            if self.store.has_state_node(&child) {
                continue;
            }
            self.schedule(child, child_kind, Some(hash));
            deps += 1;
        }

        if let Some(request) = self.requests.get_mut(&hash) {
            request.data = Some(data);
            request.deps += deps;
        }
        if deps == 0 {
            self.commit(hash)?;
        }
        Ok(hash)
    }

    fn schedule(&mut self, hash: Hash, kind: NodeKind, parent: Option<Hash>) {
        match self.requests.get_mut(&hash) {
            Some(request) => request.parents.extend(parent),
            None => {
                self.requests.insert(
                    hash,
                    NodeRequest {
                        kind,
                        data: None,
                        parents: parent.into_iter().collect(),
                        deps: 0,
                    },
                );
                self.queue.push_back(hash);
            }
        }
    }

    fn children(
        hash: Hash,
        kind: NodeKind,
        data: &[u8],
    ) -> Result<Vec<(Hash, NodeKind)>, StateSyncError> {
        if kind == NodeKind::Code {
            return Ok(Vec::new());
        }
        let node = TrieNode::decode(data).map_err(|_| StateSyncError::Undecodable(hash))?;
        let children = match &node {
            TrieNode::Branch(_) => node.children().into_iter().map(|child| (child, kind)).collect(),
            TrieNode::Leaf { value, .. } if kind == NodeKind::Account => {
                let account =
                    Account::decode(value).map_err(|_| StateSyncError::Undecodable(hash))?;
                let mut refs = Vec::new();
                if account.storage_root != EMPTY_ROOT {
                    refs.push((account.storage_root, NodeKind::Storage));
                }
                if account.has_code() {
                    refs.push((account.code_hash, NodeKind::Code));
                }
                refs
            }
            TrieNode::Leaf { .. } => Vec::new(),
        };
        Ok(children)
    }

    /// Write a node whose children are all stored, then any parents this completes.
    fn commit(&mut self, hash: Hash) -> Result<(), StoreError> {
        let mut ready = vec![hash];
        while let Some(hash) = ready.pop() {
            let Some(request) = self.requests.remove(&hash) else {
                continue;
            };
            let Some(data) = request.data else {
                continue;
            };
            self.store.write_state_node(hash, data)?;
            self.committed += 1;

            for parent in request.parents {
                if let Some(parent_request) = self.requests.get_mut(&parent) {
                    parent_request.deps -= 1;
                    if parent_request.deps == 0 && parent_request.data.is_some() {
                        ready.push(parent);
                    }
                }
            }
        }
        if self.requests.is_empty() {
            debug!(root = %self.root, nodes = self.committed, "State download complete");
        }
        Ok(())
    }
}
