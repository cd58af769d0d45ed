use std::time::Duration;

use serde::Deserialize;

use crate::types::LPV2;

/// After this long without an answer a retrieval also asks another peer.
pub const SOFT_REQUEST_TIMEOUT: Duration = Duration::from_millis(300);

/// A single request that has not been answered after this long has failed.
pub const HARD_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the whole retrieval, retries included.
pub const RETRIEVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Distinct peers asked before a retrieval gives up.
pub const MAX_RETRIEVE_ATTEMPTS: usize = 5;

/// Requests of one retrieval that may be outstanding at once.
pub const MAX_PARALLEL_REQUESTS: usize = 3;

/// Hard timeouts after which a server is dropped.
pub const MAX_SERVER_TIMEOUTS: u32 = 3;

/// Verified trie nodes kept for answering repeated state reads.
pub const PROOF_CACHE_SIZE: usize = 4_096;

pub const DIAL_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DIAL_BACKOFF_CAP: Duration = Duration::from_secs(600);

/// How long a retrieval waits for any suitable server to become idle.
pub const DISTRIBUTE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LesConfig {
    pub protocol_version: u32,
    pub soft_timeout_ms: u64,
    pub hard_timeout_ms: u64,
    pub retrieve_timeout_ms: u64,
    pub max_attempts: usize,
    pub max_parallel: usize,
    pub max_timeouts: u32,
    pub proof_cache_size: usize,
    pub dial_backoff_base_ms: u64,
    pub dial_backoff_cap_ms: u64,
    pub distribute_timeout_ms: u64,
}

impl LesConfig {
    pub fn soft_timeout(&self) -> Duration {
        Duration::from_millis(self.soft_timeout_ms)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieve_timeout_ms)
    }

    pub fn dial_backoff_base(&self) -> Duration {
        Duration::from_millis(self.dial_backoff_base_ms)
    }

    pub fn dial_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.dial_backoff_cap_ms)
    }

    pub fn distribute_timeout(&self) -> Duration {
        Duration::from_millis(self.distribute_timeout_ms)
    }
}

impl Default for LesConfig {
    fn default() -> Self {
        Self {
            protocol_version: LPV2,
            soft_timeout_ms: SOFT_REQUEST_TIMEOUT.as_millis() as u64,
            hard_timeout_ms: HARD_REQUEST_TIMEOUT.as_millis() as u64,
            retrieve_timeout_ms: RETRIEVE_TIMEOUT.as_millis() as u64,
            max_attempts: MAX_RETRIEVE_ATTEMPTS,
            max_parallel: MAX_PARALLEL_REQUESTS,
            max_timeouts: MAX_SERVER_TIMEOUTS,
            proof_cache_size: PROOF_CACHE_SIZE,
            dial_backoff_base_ms: DIAL_BACKOFF_BASE.as_millis() as u64,
            dial_backoff_cap_ms: DIAL_BACKOFF_CAP.as_millis() as u64,
            distribute_timeout_ms: DISTRIBUTE_TIMEOUT.as_millis() as u64,
        }
    }
}
