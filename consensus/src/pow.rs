use std::collections::HashSet;

use containers::{keccak256, Block, Header, U256};
use tracing::debug;

use crate::engine::{verify_linkage, ConsensusError, Engine};

pub const MAX_UNCLES: usize = 2;
/// How far back an uncle may branch off the canonical chain.
pub const MAX_UNCLE_DEPTH: u64 = 7;

/// Proof-of-work engine. The seal is valid when
/// `keccak(seal_hash || nonce) <= 2^256 / difficulty`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Pow;

impl Pow {
    pub fn seal_value(header: &Header) -> U256 {
        let mut preimage = header.seal_hash().to_vec();
        preimage.extend_from_slice(&header.nonce.to_be_bytes());
        U256::from_be_bytes(keccak256(preimage).0)
    }

    pub fn verify_seal(&self, header: &Header) -> Result<(), ConsensusError> {
        if header.difficulty.is_zero() {
            return Err(ConsensusError::InvalidDifficulty(header.difficulty));
        }
        let target = U256::MAX / header.difficulty;
        if Self::seal_value(header) > target {
            return Err(ConsensusError::InvalidSeal(header.number));
        }
        Ok(())
    }
}

impl Engine for Pow {
    fn name(&self) -> &'static str {
        "pow"
    }

    fn verify_header(&self, header: &Header, parent: &Header) -> Result<(), ConsensusError> {
        verify_linkage(header, parent)?;
        if header.time <= parent.time {
            return Err(ConsensusError::InvalidTimestamp {
                parent_time: parent.time,
                time: header.time,
                gap: 1,
            });
        }
        self.verify_seal(header)
    }

    fn verify_uncles(&self, block: &Block) -> Result<(), ConsensusError> {
        let uncles = &block.body.uncles;
        if uncles.len() > MAX_UNCLES {
            return Err(ConsensusError::TooManyUncles(uncles.len()));
        }

        let number = block.number();
        let mut seen = HashSet::new();
        for uncle in uncles {
            let hash = uncle.hash();
            if !seen.insert(hash) || hash == block.hash() {
                return Err(ConsensusError::DuplicateUncle(hash));
            }
            if uncle.number >= number || uncle.number + MAX_UNCLE_DEPTH < number {
                return Err(ConsensusError::InvalidUncleNumber {
                    uncle: uncle.number,
                    number,
                });
            }
            self.verify_seal(uncle)?;
        }

        debug!(number, uncles = uncles.len(), "uncles verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use containers::{Body, Bytes, Hash};

    use super::*;

    fn mine(mut header: Header) -> Header {
        while Pow.verify_seal(&header).is_err() {
            header.nonce += 1;
        }
        header
    }

    fn child_of(parent: &Header, difficulty: u64) -> Header {
        mine(Header {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            time: parent.time + 13,
            gas_limit: 8_000_000,
            difficulty: U256::from(difficulty),
            ..Default::default()
        })
    }

    #[test]
    fn unit_difficulty_always_seals() {
        let header = Header {
            difficulty: U256::from(1),
            nonce: 12345,
            ..Default::default()
        };
        assert_eq!(Pow.verify_seal(&header), Ok(()));
    }

    #[test]
    fn mined_header_verifies() {
        let genesis = Header::default();
        let header = child_of(&genesis, 64);
        assert_eq!(Pow.verify_header(&header, &genesis), Ok(()));
    }

    #[test]
    fn tampered_nonce_fails_seal() {
        let genesis = Header::default();
        let mut header = child_of(&genesis, 1 << 10);
        // Search for a nonce whose seal misses the target.
        header.nonce += 1;
        while Pow.verify_seal(&header).is_ok() {
            header.nonce += 1;
        }
        assert_eq!(
            Pow.verify_header(&header, &genesis),
            Err(ConsensusError::InvalidSeal(1))
        );
    }

    #[test]
    fn zero_difficulty_rejected() {
        let genesis = Header::default();
        let mut header = child_of(&genesis, 1);
        header.difficulty = U256::ZERO;
        assert_eq!(
            Pow.verify_header(&header, &genesis),
            Err(ConsensusError::InvalidDifficulty(U256::ZERO))
        );
    }

    #[test]
    fn timestamp_must_advance() {
        let genesis = Header {
            time: 100,
            ..Default::default()
        };
        let mut header = child_of(&genesis, 1);
        header.time = 100;
        assert!(matches!(
            Pow.verify_header(&header, &genesis),
            Err(ConsensusError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn uncle_rules() {
        let genesis = Header::default();
        let one = child_of(&genesis, 1);
        let two = child_of(&one, 1);
        let sibling = mine(Header {
            extra: Bytes::from(vec![1u8]),
            ..one.clone()
        });

        let block = Block::new(
            child_of(&two, 1),
            Body {
                transactions: vec![],
                uncles: vec![sibling.clone()],
            },
        );
        assert_eq!(Pow.verify_uncles(&block), Ok(()));

        let block = Block::new(
            block.header.clone(),
            Body {
                transactions: vec![],
                uncles: vec![sibling.clone(), sibling.clone()],
            },
        );
        assert!(matches!(
            Pow.verify_uncles(&block),
            Err(ConsensusError::DuplicateUncle(_))
        ));

        let future = Header {
            number: 10,
            parent_hash: Hash::repeat_byte(1),
            difficulty: U256::from(1),
            ..Default::default()
        };
        let block = Block::new(
            block.header.clone(),
            Body {
                transactions: vec![],
                uncles: vec![future],
            },
        );
        assert!(matches!(
            Pow.verify_uncles(&block),
            Err(ConsensusError::InvalidUncleNumber { uncle: 10, .. })
        ));

        let block = Block::new(
            block.header.clone(),
            Body {
                transactions: vec![],
                uncles: vec![sibling.clone(), genesis.clone(), one.clone()],
            },
        );
        assert_eq!(
            Pow.verify_uncles(&block),
            Err(ConsensusError::TooManyUncles(3))
        );
    }
}
