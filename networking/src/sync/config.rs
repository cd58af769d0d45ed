use std::time::Duration;

use serde::Deserialize;

use super::states::SyncMode;

/// Downloader configuration constants.
///
/// Operational parameters for synchronization: batch sizes, timeouts, and limits.

/// Maximum headers to request in a single GetBlockHeaders request.
pub const MAX_HEADER_FETCH: u64 = 192;

/// Maximum skeleton headers to request from the sync peer at once. Each one
/// anchors the end of a header batch.
pub const MAX_SKELETON_SIZE: u64 = 128;

/// Maximum block bodies to request at once.
pub const MAX_BODY_FETCH: usize = 128;

/// Maximum block receipts to request at once.
pub const MAX_RECEIPT_FETCH: usize = 256;

/// Maximum state trie nodes to request at once.
pub const MAX_STATE_FETCH: usize = 384;

/// Deepest reorg the ancestor search will follow before giving up on a peer.
pub const MAX_FORK_ANCESTRY: u64 = 90_000;

/// Blocks below the target that are still imported in full during fast sync.
/// The fast sync pivot sits this far below the target.
pub const FS_MIN_FULL_BLOCKS: u64 = 64;

/// Maximum downloaded but not yet imported blocks.
pub const MAX_QUEUED_BLOCKS: usize = 8_192;

/// Header batches that may be in flight ahead of the last verified one.
pub const HEADER_RUN_AHEAD_BATCHES: usize = 8;

/// Maximum blocks handed to storage in one import call.
pub const MAX_IMPORT_BATCH: usize = 2_048;

pub const MAX_SYNC_PEERS: usize = 25;

/// Timeouts before a peer is dropped.
pub const MAX_PEER_TIMEOUTS: u32 = 3;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between reservation expiry sweeps.
pub const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// How long a fetcher waits for an idle peer before the session fails.
pub const DISTRIBUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the sync event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub max_peers: usize,
    pub header_batch: u64,
    pub body_batch: usize,
    pub receipt_batch: usize,
    pub state_batch: usize,
    pub request_timeout_ms: u64,
    pub expiry_interval_ms: u64,
    pub max_peer_timeouts: u32,
    pub max_reorg_depth: u64,
    pub max_queued_blocks: usize,
    pub header_run_ahead: usize,
    pub max_import_batch: usize,
    pub fs_min_full_blocks: u64,
    pub distribute_timeout_ms: u64,
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_interval_ms)
    }

    pub fn distribute_timeout(&self) -> Duration {
        Duration::from_millis(self.distribute_timeout_ms)
    }

    /// Block at which fast sync switches from receipts to full import, if the
    /// target is far enough from genesis to have one.
    pub fn pivot_for(&self, target: u64) -> Option<u64> {
        (target > self.fs_min_full_blocks).then(|| target - self.fs_min_full_blocks)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::default(),
            max_peers: MAX_SYNC_PEERS,
            header_batch: MAX_HEADER_FETCH,
            body_batch: MAX_BODY_FETCH,
            receipt_batch: MAX_RECEIPT_FETCH,
            state_batch: MAX_STATE_FETCH,
            request_timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
            expiry_interval_ms: EXPIRY_CHECK_INTERVAL.as_millis() as u64,
            max_peer_timeouts: MAX_PEER_TIMEOUTS,
            max_reorg_depth: MAX_FORK_ANCESTRY,
            max_queued_blocks: MAX_QUEUED_BLOCKS,
            header_run_ahead: HEADER_RUN_AHEAD_BATCHES,
            max_import_batch: MAX_IMPORT_BATCH,
            fs_min_full_blocks: FS_MIN_FULL_BLOCKS,
            distribute_timeout_ms: DISTRIBUTE_TIMEOUT.as_millis() as u64,
        }
    }
}
