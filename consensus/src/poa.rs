use containers::{Address, Block, Header, U256, EMPTY_ROOT};
use serde::{Deserialize, Serialize};

use crate::engine::{verify_linkage, ConsensusError, Engine};

/// Difficulty of a block sealed by the in-turn signer.
pub const DIFF_IN_TURN: u64 = 2;
pub const DIFF_NO_TURN: u64 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoaConfig {
    /// Minimum seconds between consecutive blocks.
    pub period: u64,
    pub signers: Vec<Address>,
}

/// Proof-of-authority engine: blocks are produced by a fixed signer set,
/// identified by the header coinbase.
#[derive(Clone, Debug)]
pub struct Poa {
    config: PoaConfig,
}

impl Poa {
    pub fn new(config: PoaConfig) -> Self {
        Self { config }
    }

    pub fn is_signer(&self, address: &Address) -> bool {
        self.config.signers.contains(address)
    }

    /// Signer expected to seal block `number`.
    pub fn in_turn(&self, number: u64) -> Option<Address> {
        if self.config.signers.is_empty() {
            return None;
        }
        let index = (number % self.config.signers.len() as u64) as usize;
        self.config.signers.get(index).copied()
    }
}

impl Engine for Poa {
    fn name(&self) -> &'static str {
        "poa"
    }

    fn verify_header(&self, header: &Header, parent: &Header) -> Result<(), ConsensusError> {
        verify_linkage(header, parent)?;

        if parent.time + self.config.period > header.time {
            return Err(ConsensusError::InvalidTimestamp {
                parent_time: parent.time,
                time: header.time,
                gap: self.config.period,
            });
        }
        if header.uncle_hash != EMPTY_ROOT {
            return Err(ConsensusError::UnexpectedUncles);
        }
        if !self.is_signer(&header.coinbase) {
            return Err(ConsensusError::UnauthorizedSigner(header.coinbase));
        }

        let expected = if self.in_turn(header.number) == Some(header.coinbase) {
            DIFF_IN_TURN
        } else {
            DIFF_NO_TURN
        };
        if header.difficulty != U256::from(expected) {
            return Err(ConsensusError::InvalidDifficulty(header.difficulty));
        }
        Ok(())
    }

    fn verify_uncles(&self, block: &Block) -> Result<(), ConsensusError> {
        if !block.body.uncles.is_empty() {
            return Err(ConsensusError::UnexpectedUncles);
        }
        Ok(())
    }
}
