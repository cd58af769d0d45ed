use std::sync::Arc;

use containers::{Address, Block, Hash, Header, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Faker, Poa, PoaConfig, Pow};

/// Largest extra-data field accepted on a header.
pub const MAX_EXTRA_DATA: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    #[error("block #{number} has parent {got}, expected {expected}")]
    ParentMismatch {
        number: u64,
        expected: Hash,
        got: Hash,
    },

    #[error("block #{number} does not follow parent #{parent}")]
    InvalidNumber { parent: u64, number: u64 },

    #[error("invalid timestamp {time} (parent {parent_time}, minimum gap {gap})")]
    InvalidTimestamp { parent_time: u64, time: u64, gap: u64 },

    #[error("extra-data too long: {len} > {max}")]
    ExtraTooLong { len: usize, max: usize },

    #[error("gas used {used} exceeds gas limit {limit}")]
    GasUsedExceedsLimit { used: u64, limit: u64 },

    #[error("invalid difficulty {0}")]
    InvalidDifficulty(U256),

    #[error("invalid seal on block #{0}")]
    InvalidSeal(u64),

    #[error("unauthorized signer {0}")]
    UnauthorizedSigner(Address),

    #[error("too many uncles: {0}")]
    TooManyUncles(usize),

    #[error("duplicate uncle {0}")]
    DuplicateUncle(Hash),

    #[error("uncle #{uncle} outside allowed range for block #{number}")]
    InvalidUncleNumber { uncle: u64, number: u64 },

    #[error("uncles not allowed")]
    UnexpectedUncles,

    #[error("block #{0} rejected")]
    Rejected(u64),
}

/// Header validity rules consumed by the synchronizer.
///
/// An engine is chosen once when the node is built and shared behind an
/// `Arc<dyn Engine>` from then on.
pub trait Engine: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn verify_header(&self, header: &Header, parent: &Header) -> Result<(), ConsensusError>;

    /// Verify a contiguous run of headers on top of `parent`, returning the
    /// index of the first failing header.
    fn verify_headers(
        &self,
        parent: &Header,
        headers: &[Header],
    ) -> Result<(), (usize, ConsensusError)> {
        let mut parent = parent;
        for (index, header) in headers.iter().enumerate() {
            self.verify_header(header, parent)
                .map_err(|err| (index, err))?;
            parent = header;
        }
        Ok(())
    }

    fn verify_uncles(&self, block: &Block) -> Result<(), ConsensusError>;
}

/// Checks every real engine applies before its own seal rules.
pub fn verify_linkage(header: &Header, parent: &Header) -> Result<(), ConsensusError> {
    let parent_hash = parent.hash();
    if header.parent_hash != parent_hash {
        return Err(ConsensusError::ParentMismatch {
            number: header.number,
            expected: parent_hash,
            got: header.parent_hash,
        });
    }
    if header.number != parent.number + 1 {
        return Err(ConsensusError::InvalidNumber {
            parent: parent.number,
            number: header.number,
        });
    }
    if header.extra.len() > MAX_EXTRA_DATA {
        return Err(ConsensusError::ExtraTooLong {
            len: header.extra.len(),
            max: MAX_EXTRA_DATA,
        });
    }
    if header.gas_used > header.gas_limit {
        return Err(ConsensusError::GasUsedExceedsLimit {
            used: header.gas_used,
            limit: header.gas_limit,
        });
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineKind {
    Pow,
    Poa(PoaConfig),
    Faker {
        #[serde(default)]
        fail_at: Option<u64>,
    },
}

impl Default for EngineKind {
    fn default() -> Self {
        Self::Pow
    }
}

pub fn build_engine(kind: &EngineKind) -> Arc<dyn Engine> {
    match kind {
        EngineKind::Pow => Arc::new(Pow::default()),
        EngineKind::Poa(config) => Arc::new(Poa::new(config.clone())),
        EngineKind::Faker { fail_at } => Arc::new(Faker { fail_at: *fail_at }),
    }
}
