/// Canonical hash trie and bloom trie keys.
///
/// A CHT section commits to `(hash, total difficulty)` for every block
/// number in the section. A bloom trie section commits to compressed bloom
/// bit vectors, one entry per bloom bit.
use serde::{Deserialize, Serialize};

use crate::trie::{Trie, TrieError};
use crate::types::{DecodeError, Decoder, Encoder, Hash, U256};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChtEntry {
    pub hash: Hash,
    pub td: U256,
}

impl ChtEntry {
    pub fn encode(&self) -> Vec<u8> {
        Encoder::new().hash(&self.hash).u256(&self.td).finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(data);
        let entry = Self {
            hash: decoder.hash()?,
            td: decoder.u256()?,
        };
        if !decoder.is_empty() {
            return Err(DecodeError);
        }
        Ok(entry)
    }
}

pub fn cht_key(number: u64) -> [u8; 8] {
    number.to_be_bytes()
}

/// Build a CHT over `(number, entry)` pairs.
pub fn build_cht<I>(entries: I) -> Result<Trie, TrieError>
where
    I: IntoIterator<Item = (u64, ChtEntry)>,
{
    Trie::build(
        entries
            .into_iter()
            .map(|(number, entry)| (cht_key(number), entry.encode())),
    )
}

pub fn bloom_trie_key(bit: u16, section: u64) -> [u8; 10] {
    let mut key = [0u8; 10];
    key[..2].copy_from_slice(&bit.to_be_bytes());
    key[2..].copy_from_slice(&section.to_be_bytes());
    key
}
