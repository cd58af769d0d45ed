use serde::{Deserialize, Serialize};

use crate::trie::derive_root;
use crate::types::{keccak256, Address, Bytes, Encoder, Hash, U256, EMPTY_ROOT};

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub parent_hash: Hash,
    pub uncle_hash: Hash,
    pub coinbase: Address,
    pub state_root: Hash,
    pub tx_root: Hash,
    pub receipt_root: Hash,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub time: u64,
    pub extra: Bytes,
    pub nonce: u64,
}

impl Header {
    fn encode_fields(&self, with_nonce: bool) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder
            .hash(&self.parent_hash)
            .hash(&self.uncle_hash)
            .address(&self.coinbase)
            .hash(&self.state_root)
            .hash(&self.tx_root)
            .hash(&self.receipt_root)
            .u256(&self.difficulty)
            .u64(self.number)
            .u64(self.gas_limit)
            .u64(self.gas_used)
            .u64(self.time)
            .bytes(&self.extra);
        if with_nonce {
            encoder.u64(self.nonce);
        }
        encoder.finish()
    }

    /// Block hash, committing to every field including the seal nonce.
    pub fn hash(&self) -> Hash {
        keccak256(self.encode_fields(true))
    }

    /// Hash of the header without its seal, which is what the seal signs over.
    pub fn seal_hash(&self) -> Hash {
        keccak256(self.encode_fields(false))
    }

    /// Whether the block has neither transactions nor uncles, so no body fetch is needed.
    pub fn has_empty_body(&self) -> bool {
        self.tx_root == EMPTY_ROOT && self.uncle_hash == EMPTY_ROOT
    }

    pub fn has_empty_receipts(&self) -> bool {
        self.receipt_root == EMPTY_ROOT
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub gas: u64,
    pub input: Bytes,
}

impl Transaction {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.u64(self.nonce);
        match &self.to {
            Some(to) => encoder.u8(1).address(to),
            None => encoder.u8(0),
        };
        encoder.u256(&self.value).u64(self.gas).bytes(&self.input);
        encoder.finish()
    }

    pub fn hash(&self) -> Hash {
        keccak256(self.encode())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Body {
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<Header>,
}

impl Body {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.uncles.is_empty()
    }

    pub fn tx_root(&self) -> Hash {
        let encoded: Vec<Vec<u8>> = self.transactions.iter().map(Transaction::encode).collect();
        derive_root(&encoded)
    }

    pub fn uncle_hash(&self) -> Hash {
        if self.uncles.is_empty() {
            return EMPTY_ROOT;
        }
        let mut encoder = Encoder::new();
        for uncle in &self.uncles {
            encoder.hash(&uncle.hash());
        }
        keccak256(encoder.finish())
    }

    /// Check the body against the commitments in `header`.
    pub fn matches(&self, header: &Header) -> bool {
        self.tx_root() == header.tx_root && self.uncle_hash() == header.uncle_hash
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub body: Body,
}

impl Block {
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(nonce: u64) -> Transaction {
        Transaction {
            nonce,
            to: Some(Address::repeat_byte(0x11)),
            value: U256::from(1_000u64),
            gas: 21_000,
            input: Bytes::new(),
        }
    }

    #[test]
    fn test_seal_hash_ignores_nonce() {
        let mut header = Header {
            number: 7,
            ..Default::default()
        };
        let seal_hash = header.seal_hash();
        let hash = header.hash();

        header.nonce = 99;
        assert_eq!(header.seal_hash(), seal_hash);
        assert_ne!(header.hash(), hash);
    }

    #[test]
    fn test_header_json_uses_camel_case() {
        let header = Header {
            number: 3,
            gas_limit: 8_000_000,
            ..Default::default()
        };
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["gasLimit"], 8_000_000);
        assert!(json.get("parentHash").is_some());

        let decoded: Header = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.hash(), header.hash());
    }

    #[test]
    fn test_body_matches_header_commitments() {
        let body = Body {
            transactions: vec![transfer(0), transfer(1)],
            uncles: vec![],
        };
        let header = Header {
            tx_root: body.tx_root(),
            uncle_hash: body.uncle_hash(),
            ..Default::default()
        };
        assert!(body.matches(&header));
        assert!(!header.has_empty_body());

        let tampered = Body {
            transactions: vec![transfer(0)],
            uncles: vec![],
        };
        assert!(!tampered.matches(&header));
    }

    #[test]
    fn test_empty_body_has_empty_commitments() {
        let body = Body::default();
        assert!(body.is_empty());
        assert!(body.matches(&Header::default()));
        assert!(Header::default().has_empty_body());
    }
}
