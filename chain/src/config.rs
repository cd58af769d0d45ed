use serde::{Deserialize, Serialize};

pub const MAINNET_NETWORK_ID: u64 = 1;
pub const DEVNET_NETWORK_ID: u64 = 1337;

/// Blocks per canonical hash trie section served to light clients.
pub const CHT_FREQUENCY: u64 = 32_768;
/// Blocks per bloom trie section.
pub const BLOOM_TRIE_FREQUENCY: u64 = 32_768;
/// Confirmations required before a helper trie section is committed.
pub const HELPER_TRIE_CONFIRMATIONS: u64 = 2_048;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub network_id: u64,
    pub cht_frequency: u64,
    pub bloom_trie_frequency: u64,
    pub helper_trie_confirmations: u64,
}

impl ChainConfig {
    /// CHT section that contains block `number`.
    pub fn cht_section(&self, number: u64) -> u64 {
        number / self.cht_frequency
    }

    pub fn bloom_section(&self, number: u64) -> u64 {
        number / self.bloom_trie_frequency
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        MAINNET_CONFIG
    }
}

pub const MAINNET_CONFIG: ChainConfig = ChainConfig {
    network_id: MAINNET_NETWORK_ID,
    cht_frequency: CHT_FREQUENCY,
    bloom_trie_frequency: BLOOM_TRIE_FREQUENCY,
    helper_trie_confirmations: HELPER_TRIE_CONFIRMATIONS,
};

/// Small sections so local networks produce helper tries quickly.
pub const DEVNET_CONFIG: ChainConfig = ChainConfig {
    network_id: DEVNET_NETWORK_ID,
    cht_frequency: 64,
    bloom_trie_frequency: 64,
    helper_trie_confirmations: 8,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_math_is_consistent() {
        assert_eq!(DEVNET_CONFIG.cht_section(63), 0);
        assert_eq!(DEVNET_CONFIG.cht_section(64), 1);
        assert_eq!(MAINNET_CONFIG.bloom_section(32_767), 0);
    }
}
