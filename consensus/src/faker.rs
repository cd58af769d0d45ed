use containers::{Block, Header};

use crate::engine::{ConsensusError, Engine};

/// Engine that accepts everything, optionally refusing one block number.
/// Used by tests that exercise the pipeline rather than the seal rules.
#[derive(Clone, Copy, Debug, Default)]
pub struct Faker {
    pub fail_at: Option<u64>,
}

impl Faker {
    pub fn failing_at(number: u64) -> Self {
        Self {
            fail_at: Some(number),
        }
    }
}

impl Engine for Faker {
    fn name(&self) -> &'static str {
        "faker"
    }

    fn verify_header(&self, header: &Header, _parent: &Header) -> Result<(), ConsensusError> {
        match self.fail_at {
            Some(number) if number == header.number => Err(ConsensusError::Rejected(number)),
            _ => Ok(()),
        }
    }

    fn verify_uncles(&self, _block: &Block) -> Result<(), ConsensusError> {
        Ok(())
    }
}
