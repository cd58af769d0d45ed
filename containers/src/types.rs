pub use alloy_primitives::{keccak256, Address, Bytes, B256 as Hash, U256};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Root of an empty trie and hash of an empty uncle list.
pub const EMPTY_ROOT: Hash = Hash::ZERO;

/// Block identifier used as the origin of header requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HashOrNumber {
    Hash(Hash),
    Number(u64),
}

impl From<Hash> for HashOrNumber {
    fn from(hash: Hash) -> Self {
        HashOrNumber::Hash(hash)
    }
}

impl From<u64> for HashOrNumber {
    fn from(number: u64) -> Self {
        HashOrNumber::Number(number)
    }
}

impl fmt::Display for HashOrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashOrNumber::Hash(hash) => write!(f, "{hash}"),
            HashOrNumber::Number(number) => write!(f, "#{number}"),
        }
    }
}

/// Length-prefixed byte writer used for hashing and for the trie value encodings.
///
/// This is not a wire format: it only has to be deterministic and unambiguous.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u256(&mut self, value: &U256) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes::<32>());
        self
    }

    pub fn hash(&mut self, value: &Hash) -> &mut Self {
        self.buf.extend_from_slice(value.as_slice());
        self
    }

    pub fn address(&mut self, value: &Address) -> &mut Self {
        self.buf.extend_from_slice(value.as_slice());
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Cursor over bytes produced by [`Encoder`].
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unexpected end of input")]
pub struct DecodeError;

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() < len {
            return Err(DecodeError);
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn u256(&mut self) -> Result<U256, DecodeError> {
        let mut raw = [0u8; 32];
        raw.copy_from_slice(self.take(32)?);
        Ok(U256::from_be_bytes(raw))
    }

    pub fn hash(&mut self) -> Result<Hash, DecodeError> {
        Ok(Hash::from_slice(self.take(32)?))
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        let len = u32::from_be_bytes(raw) as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
