use serde::{Deserialize, Serialize};

use crate::trie::{Trie, TrieError};
use crate::types::{keccak256, Address, DecodeError, Decoder, Encoder, Hash, U256, EMPTY_ROOT};

/// Account record stored in the state trie under `keccak(address)`.
///
/// `storage_root` is the root of the account's storage trie and `code_hash`
/// the keccak hash of its code; both are [`EMPTY_ROOT`] when absent.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: Hash,
    pub code_hash: Hash,
}

impl Account {
    pub fn encode(&self) -> Vec<u8> {
        Encoder::new()
            .u64(self.nonce)
            .u256(&self.balance)
            .hash(&self.storage_root)
            .hash(&self.code_hash)
            .finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(data);
        let account = Self {
            nonce: decoder.u64()?,
            balance: decoder.u256()?,
            storage_root: decoder.hash()?,
            code_hash: decoder.hash()?,
        };
        if !decoder.is_empty() {
            return Err(DecodeError);
        }
        Ok(account)
    }

    pub fn has_code(&self) -> bool {
        self.code_hash != EMPTY_ROOT
    }
}

pub fn state_key(address: &Address) -> Hash {
    keccak256(address)
}

pub fn storage_key(slot: &Hash) -> Hash {
    keccak256(slot)
}

/// Build the account trie for a set of accounts.
pub fn build_state<'a, I>(accounts: I) -> Result<Trie, TrieError>
where
    I: IntoIterator<Item = (&'a Address, &'a Account)>,
{
    Trie::build(
        accounts
            .into_iter()
            .map(|(address, account)| (state_key(address), account.encode())),
    )
}

/// Build a storage trie from slot/value pairs.
pub fn build_storage<'a, I>(slots: I) -> Result<Trie, TrieError>
where
    I: IntoIterator<Item = (&'a Hash, &'a Hash)>,
{
    Trie::build(
        slots
            .into_iter()
            .map(|(slot, value)| (storage_key(slot), value.to_vec())),
    )
}
