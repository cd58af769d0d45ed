use serde::{Deserialize, Serialize};

use crate::trie::derive_root;
use crate::types::{Address, Bytes, Encoder, Hash};

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub success: bool,
    pub cumulative_gas_used: u64,
    pub logs: Vec<Log>,
}

impl Receipt {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder
            .u8(self.success as u8)
            .u64(self.cumulative_gas_used)
            .u64(self.logs.len() as u64);
        for log in &self.logs {
            encoder.address(&log.address).u64(log.topics.len() as u64);
            for topic in &log.topics {
                encoder.hash(topic);
            }
            encoder.bytes(&log.data);
        }
        encoder.finish()
    }
}

/// Root committing to a block's receipts in transaction order.
pub fn receipts_root(receipts: &[Receipt]) -> Hash {
    let encoded: Vec<Vec<u8>> = receipts.iter().map(Receipt::encode).collect();
    derive_root(&encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EMPTY_ROOT;

    #[test]
    fn test_receipts_root_commits_to_logs() {
        let receipt = Receipt {
            success: true,
            cumulative_gas_used: 21_000,
            logs: vec![Log {
                address: Address::repeat_byte(1),
                topics: vec![Hash::repeat_byte(2)],
                data: Bytes::from_static(b"payload"),
            }],
        };
        let mut altered = receipt.clone();
        altered.logs[0].data = Bytes::from_static(b"altered");

        assert_ne!(receipts_root(&[receipt]), receipts_root(&[altered]));
        assert_eq!(receipts_root(&[]), EMPTY_ROOT);
    }
}
