//! Hexary Merkle trie.
//!
//! Every commitment in the ledger (transaction root, receipt root, state root,
//! CHT and bloom-trie roots) is the root of one of these tries. Nodes are
//! addressed by the keccak hash of their encoding, so any subset of nodes
//! reachable from a trusted root is a self-verifying proof.
//!
//! The trie has two node kinds:
//! - **Branch**: sixteen optional child hashes, one per key nibble
//! - **Leaf**: the remaining key nibbles and the stored value
//!
//! All keys of one trie have the same length, which guarantees that a branch
//! is never also the end of a key.

use std::collections::{BTreeMap, HashMap};

use crate::types::{keccak256, Bytes, DecodeError, Decoder, Encoder, Hash, EMPTY_ROOT};

const BRANCH_TAG: u8 = 0;
const LEAF_TAG: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrieError {
    #[error("malformed trie node: {0}")]
    Decode(#[from] DecodeError),
    #[error("unknown trie node tag {0}")]
    UnknownTag(u8),
    #[error("invalid nibble {0} in leaf path")]
    InvalidNibble(u8),
    #[error("trailing bytes after trie node")]
    TrailingBytes,
    #[error("keys must all be {expected} bytes, got {got}")]
    KeyLength { expected: usize, got: usize },
    #[error("missing trie node {0}")]
    MissingNode(Hash),
    #[error("trie node does not match its hash {0}")]
    HashMismatch(Hash),
    #[error("trie path is deeper than the key")]
    PathTooDeep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrieNode {
    Branch(Box<[Option<Hash>; 16]>),
    Leaf { path: Vec<u8>, value: Vec<u8> },
}

impl TrieNode {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            TrieNode::Branch(children) => {
                encoder.u8(BRANCH_TAG);
                for child in children.iter() {
                    match child {
                        Some(hash) => encoder.u8(1).hash(hash),
                        None => encoder.u8(0),
                    };
                }
            }
            TrieNode::Leaf { path, value } => {
                encoder.u8(LEAF_TAG).bytes(path).bytes(value);
            }
        }
        encoder.finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self, TrieError> {
        let mut decoder = Decoder::new(data);
        let node = match decoder.u8()? {
            BRANCH_TAG => {
                let mut children: [Option<Hash>; 16] = [None; 16];
                for slot in children.iter_mut() {
                    *slot = match decoder.u8()? {
                        0 => None,
                        1 => Some(decoder.hash()?),
                        tag => return Err(TrieError::UnknownTag(tag)),
                    };
                }
                TrieNode::Branch(Box::new(children))
            }
            LEAF_TAG => {
                let path = decoder.bytes()?;
                if let Some(nibble) = path.iter().find(|nibble| **nibble > 0x0f) {
                    return Err(TrieError::InvalidNibble(*nibble));
                }
                let value = decoder.bytes()?;
                TrieNode::Leaf { path, value }
            }
            tag => return Err(TrieError::UnknownTag(tag)),
        };
        if !decoder.is_empty() {
            return Err(TrieError::TrailingBytes);
        }
        Ok(node)
    }

    pub fn hash(&self) -> Hash {
        keccak256(self.encode())
    }

    /// Hashes of the child nodes referenced by this node.
    pub fn children(&self) -> Vec<Hash> {
        match self {
            TrieNode::Branch(children) => children.iter().flatten().copied().collect(),
            TrieNode::Leaf { .. } => Vec::new(),
        }
    }
}

/// Split a key into its nibbles, high nibble first.
pub fn to_nibbles(key: &[u8]) -> Vec<u8> {
    key.iter().flat_map(|byte| [byte >> 4, byte & 0x0f]).collect()
}

/// A fully materialised trie: its root and every node keyed by hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trie {
    root: Hash,
    nodes: HashMap<Hash, Vec<u8>>,
}

impl Trie {
    /// Build a trie from key/value pairs. Later duplicates of a key win.
    pub fn build<I, K, V>(entries: I) -> Result<Self, TrieError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: Into<Vec<u8>>,
    {
        let mut key_len = None;
        let mut sorted = BTreeMap::new();
        for (key, value) in entries {
            let key = key.as_ref();
            match key_len {
                None => key_len = Some(key.len()),
                Some(expected) if expected != key.len() => {
                    return Err(TrieError::KeyLength {
                        expected,
                        got: key.len(),
                    });
                }
                Some(_) => {}
            }
            sorted.insert(to_nibbles(key), value.into());
        }
        Ok(Self::from_sorted(sorted.into_iter().collect()))
    }

    fn from_sorted(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        let mut nodes = HashMap::new();
        let root = if entries.is_empty() {
            EMPTY_ROOT
        } else {
            Self::build_node(&entries, 0, &mut nodes)
        };
        Self { root, nodes }
    }

    fn build_node(
        entries: &[(Vec<u8>, Vec<u8>)],
        depth: usize,
        nodes: &mut HashMap<Hash, Vec<u8>>,
    ) -> Hash {
        let node = if let [(path, value)] = entries {
            TrieNode::Leaf {
                path: path[depth..].to_vec(),
                value: value.clone(),
            }
        } else {
            // Distinct keys of equal length always diverge before `depth` reaches the end.
            let mut children: [Option<Hash>; 16] = [None; 16];
            let mut start = 0;
            while start < entries.len() {
                let nibble = entries[start].0[depth];
                let end = start
                    + entries[start..]
                        .iter()
                        .take_while(|(path, _)| path[depth] == nibble)
                        .count();
                children[nibble as usize] =
                    Some(Self::build_node(&entries[start..end], depth + 1, nodes));
                start = end;
            }
            TrieNode::Branch(Box::new(children))
        };

        let encoded = node.encode();
        let hash = keccak256(&encoded);
        nodes.insert(hash, encoded);
        hash
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn node(&self, hash: &Hash) -> Option<&[u8]> {
        self.nodes.get(hash).map(Vec::as_slice)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&Hash, &Vec<u8>)> {
        self.nodes.iter()
    }

    pub fn into_nodes(self) -> HashMap<Hash, Vec<u8>> {
        self.nodes
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        lookup(self.root, key, |hash| self.nodes.get(hash).cloned())
            .ok()
            .flatten()
    }

    /// Collect the nodes on the path to `key`. Works for absent keys too.
    pub fn prove(&self, key: &[u8]) -> Vec<Bytes> {
        let mut proof = Vec::new();
        let _ = lookup(self.root, key, |hash| {
            let node = self.nodes.get(hash).cloned();
            if let Some(node) = &node {
                proof.push(Bytes::from(node.clone()));
            }
            node
        });
        proof
    }
}

/// Walk from `root` to `key`, fetching nodes through `fetch` and checking
/// that each node hashes to the reference that led to it.
pub fn lookup<F>(root: Hash, key: &[u8], mut fetch: F) -> Result<Option<Vec<u8>>, TrieError>
where
    F: FnMut(&Hash) -> Option<Vec<u8>>,
{
    if root == EMPTY_ROOT {
        return Ok(None);
    }
    let path = to_nibbles(key);
    let mut expected = root;
    let mut depth = 0;
    loop {
        let data = fetch(&expected).ok_or(TrieError::MissingNode(expected))?;
        if keccak256(&data) != expected {
            return Err(TrieError::HashMismatch(expected));
        }
        match TrieNode::decode(&data)? {
            TrieNode::Branch(children) => {
                let nibble = *path.get(depth).ok_or(TrieError::PathTooDeep)?;
                match children[nibble as usize] {
                    Some(child) => {
                        expected = child;
                        depth += 1;
                    }
                    None => return Ok(None),
                }
            }
            TrieNode::Leaf { path: rest, value } => {
                return Ok((rest[..] == path[depth..]).then_some(value));
            }
        }
    }
}

/// Verify a Merkle proof for `key` against a trusted `root`.
///
/// The proof is treated as an unordered node set. `Ok(None)` is a valid proof
/// of absence.
pub fn verify_proof(root: Hash, key: &[u8], proof: &[Bytes]) -> Result<Option<Vec<u8>>, TrieError> {
    let nodes: HashMap<Hash, &Bytes> = proof.iter().map(|node| (keccak256(node), node)).collect();
    lookup(root, key, |hash| nodes.get(hash).map(|node| node.to_vec()))
}

/// Root of a list committed by position, as used for transactions and receipts.
pub fn derive_root(items: &[Vec<u8>]) -> Hash {
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = items
        .iter()
        .enumerate()
        .map(|(index, item)| (to_nibbles(&(index as u64).to_be_bytes()), item.clone()))
        .collect();
    entries.sort();
    Trie::from_sorted(entries).root()
}
