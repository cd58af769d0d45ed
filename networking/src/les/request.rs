use std::collections::HashMap;

use containers::cht::{bloom_trie_key, cht_key};
use containers::state::state_key;
use containers::trie::{lookup, verify_proof};
use containers::{
    keccak256, receipts_root, Account, Address, Body, Bytes, ChtEntry, Hash, Header, Receipt, U256,
};

use super::error::ValidationError;
use crate::peer_set::PeerInfo;
use crate::types::{
    CodeRequest, HeaderProofRequest, HelperTrie, HelperTrieRequest, LesRequest, LesResponse,
    ProofRequest, LPV1, LPV2,
};

/// A typed on-demand query together with the check that makes any peer's
/// answer trustworthy.
///
/// Every implementation validates against data the light client already
/// trusts: a locally verified header or a trusted helper trie root.
pub trait OdrRequest: Send + Sync {
    type Output: Send;

    /// Label for logs and metrics.
    fn kind(&self) -> &'static str;

    /// Whether `peer` can be asked at all.
    fn can_serve(&self, peer: &PeerInfo) -> bool;

    fn to_wire(&self) -> LesRequest;

    fn validate(&self, response: LesResponse) -> Result<Self::Output, ValidationError>;
}

fn speaks_les(peer: &PeerInfo, min_version: u32) -> bool {
    (min_version..=LPV2).contains(&peer.version)
}

fn single<T>(mut items: Vec<T>) -> Result<T, ValidationError> {
    match items.len() {
        1 => items.pop().ok_or(ValidationError::ItemCount { expected: 1, got: 0 }),
        got => Err(ValidationError::ItemCount { expected: 1, got }),
    }
}

fn response_name(response: &LesResponse) -> &'static str {
    match response {
        LesResponse::BlockBodies(_) => "BlockBodies",
        LesResponse::Receipts(_) => "Receipts",
        LesResponse::Proofs(_) => "Proofs",
        LesResponse::Code(_) => "Code",
        LesResponse::HeaderProofs(_) => "HeaderProofs",
        LesResponse::HelperTrieProofs { .. } => "HelperTrieProofs",
    }
}

/// Body of a block whose header is known.
#[derive(Debug, Clone)]
pub struct BlockBodyRequest {
    pub header: Header,
}

impl OdrRequest for BlockBodyRequest {
    type Output = Body;

    fn kind(&self) -> &'static str {
        "body"
    }

    fn can_serve(&self, peer: &PeerInfo) -> bool {
        speaks_les(peer, LPV1) && peer.has_block(self.header.number)
    }

    fn to_wire(&self) -> LesRequest {
        LesRequest::GetBlockBodies(vec![self.header.hash()])
    }

    fn validate(&self, response: LesResponse) -> Result<Body, ValidationError> {
        let LesResponse::BlockBodies(bodies) = response else {
            return Err(ValidationError::WrongResponse(response_name(&response)));
        };
        let body = single(bodies)?;
        if !body.matches(&self.header) {
            return Err(ValidationError::Mismatch("block body"));
        }
        Ok(body)
    }
}

#[derive(Debug, Clone)]
pub struct ReceiptsRequest {
    pub header: Header,
}

impl OdrRequest for ReceiptsRequest {
    type Output = Vec<Receipt>;

    fn kind(&self) -> &'static str {
        "receipts"
    }

    fn can_serve(&self, peer: &PeerInfo) -> bool {
        speaks_les(peer, LPV1) && peer.has_block(self.header.number)
    }

    fn to_wire(&self) -> LesRequest {
        LesRequest::GetReceipts(vec![self.header.hash()])
    }

    fn validate(&self, response: LesResponse) -> Result<Vec<Receipt>, ValidationError> {
        let LesResponse::Receipts(lists) = response else {
            return Err(ValidationError::WrongResponse(response_name(&response)));
        };
        let receipts = single(lists)?;
        if receipts_root(&receipts) != self.header.receipt_root {
            return Err(ValidationError::Mismatch("receipts"));
        }
        Ok(receipts)
    }
}

/// Account proven against the state root of a verified header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenAccount {
    pub account: Option<Account>,
    /// Proof nodes, all reachable from the state root.
    pub nodes: Vec<Bytes>,
}

#[derive(Debug, Clone)]
pub struct AccountRequest {
    pub header: Header,
    pub address: Address,
}

impl OdrRequest for AccountRequest {
    type Output = ProvenAccount;

    fn kind(&self) -> &'static str {
        "account"
    }

    fn can_serve(&self, peer: &PeerInfo) -> bool {
        speaks_les(peer, LPV1) && peer.has_block(self.header.number)
    }

    fn to_wire(&self) -> LesRequest {
        LesRequest::GetProofs(vec![ProofRequest {
            block_hash: self.header.hash(),
            key: state_key(&self.address).to_vec(),
        }])
    }

    fn validate(&self, response: LesResponse) -> Result<ProvenAccount, ValidationError> {
        let LesResponse::Proofs(nodes) = response else {
            return Err(ValidationError::WrongResponse(response_name(&response)));
        };
        let key = state_key(&self.address);
        let proof: HashMap<Hash, &Bytes> =
            nodes.iter().map(|node| (keccak256(node), node)).collect();
        // Only keep the nodes the lookup actually walked through.
        let mut used = Vec::new();
        let value = lookup(self.header.state_root, key.as_slice(), |hash| {
            let node = proof.get(hash)?;
            used.push((*node).clone());
            Some(node.to_vec())
        })?;
        let account = value
            .map(|raw| Account::decode(&raw).map_err(|_| ValidationError::Decode))
            .transpose()?;
        Ok(ProvenAccount {
            account,
            nodes: used,
        })
    }
}

/// Contract code, verified by its hash.
#[derive(Debug, Clone)]
pub struct ContractCodeRequest {
    pub block_hash: Hash,
    pub number: u64,
    pub code_hash: Hash,
}

impl OdrRequest for ContractCodeRequest {
    type Output = Bytes;

    fn kind(&self) -> &'static str {
        "code"
    }

    fn can_serve(&self, peer: &PeerInfo) -> bool {
        speaks_les(peer, LPV1) && peer.has_block(self.number)
    }

    fn to_wire(&self) -> LesRequest {
        LesRequest::GetCode(vec![CodeRequest {
            block_hash: self.block_hash,
            code_hash: self.code_hash,
        }])
    }

    fn validate(&self, response: LesResponse) -> Result<Bytes, ValidationError> {
        let LesResponse::Code(codes) = response else {
            return Err(ValidationError::WrongResponse(response_name(&response)));
        };
        let code = single(codes)?;
        if keccak256(&code) != self.code_hash {
            return Err(ValidationError::Mismatch("code"));
        }
        Ok(code)
    }
}

/// Canonical header proven by a CHT section root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenHeader {
    pub header: Header,
    pub td: U256,
}

#[derive(Debug, Clone)]
pub struct ChtRequest {
    pub section: u64,
    pub number: u64,
    /// Last block of the section, which a server must have.
    pub section_end: u64,
    pub cht_root: Hash,
}

impl OdrRequest for ChtRequest {
    type Output = ProvenHeader;

    fn kind(&self) -> &'static str {
        "cht"
    }

    fn can_serve(&self, peer: &PeerInfo) -> bool {
        speaks_les(peer, LPV1) && peer.has_block(self.section_end)
    }

    fn to_wire(&self) -> LesRequest {
        LesRequest::GetHeaderProofs(vec![HeaderProofRequest {
            section: self.section,
            number: self.number,
        }])
    }

    fn validate(&self, response: LesResponse) -> Result<ProvenHeader, ValidationError> {
        let LesResponse::HeaderProofs(proofs) = response else {
            return Err(ValidationError::WrongResponse(response_name(&response)));
        };
        let proof = single(proofs)?;
        let raw = verify_proof(self.cht_root, &cht_key(self.number), &proof.proof)?
            .ok_or(ValidationError::MissingValue)?;
        let entry = ChtEntry::decode(&raw).map_err(|_| ValidationError::Decode)?;
        if proof.header.number != self.number || proof.header.hash() != entry.hash {
            return Err(ValidationError::Mismatch("header"));
        }
        Ok(ProvenHeader {
            header: proof.header,
            td: entry.td,
        })
    }
}

/// One bloom bit vector per section, each proven by that section's bloom
/// trie root. Needs protocol version 2.
#[derive(Debug, Clone)]
pub struct BloomBitsRequest {
    pub bit: u16,
    /// `(section, trusted root)` pairs.
    pub sections: Vec<(u64, Hash)>,
    pub last_block: u64,
}

impl OdrRequest for BloomBitsRequest {
    type Output = Vec<Bytes>;

    fn kind(&self) -> &'static str {
        "bloombits"
    }

    fn can_serve(&self, peer: &PeerInfo) -> bool {
        speaks_les(peer, LPV2) && peer.has_block(self.last_block)
    }

    fn to_wire(&self) -> LesRequest {
        LesRequest::GetHelperTrieProofs(
            self.sections
                .iter()
                .map(|(section, _)| HelperTrieRequest {
                    trie: HelperTrie::BloomTrie,
                    section: *section,
                    key: bloom_trie_key(self.bit, *section).to_vec(),
                })
                .collect(),
        )
    }

    fn validate(&self, response: LesResponse) -> Result<Vec<Bytes>, ValidationError> {
        let LesResponse::HelperTrieProofs { nodes, values } = response else {
            return Err(ValidationError::WrongResponse(response_name(&response)));
        };
        if values.len() != self.sections.len() {
            return Err(ValidationError::ItemCount {
                expected: self.sections.len(),
                got: values.len(),
            });
        }
        for ((section, root), value) in self.sections.iter().zip(&values) {
            let proven = verify_proof(*root, &bloom_trie_key(self.bit, *section), &nodes)?
                .ok_or(ValidationError::MissingValue)?;
            if proven[..] != value[..] {
                return Err(ValidationError::Mismatch("bloom bits"));
            }
        }
        Ok(values)
    }
}
