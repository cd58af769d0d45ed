use chain::StoreError;
use libp2p_identity::PeerId;
use thiserror::Error;

use super::states::SyncMode;
use crate::types::RequestKind;

/// Failures a sync session can end with.
///
/// Peer faults are absorbed by dropping the peer and requeueing its work,
/// so they only end a session when they hit the session's own peer during
/// ancestor search. Storage failures are the only fatal class.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("a sync session is already running")]
    Busy,

    #[error("sync mode {0} is not supported by this node")]
    InvalidSyncMode(SyncMode),

    #[error("peer {0} is not registered")]
    UnknownPeer(PeerId),

    #[error("{kind} request to {peer} timed out")]
    Timeout { peer: PeerId, kind: RequestKind },

    #[error("invalid data from {peer}: {reason}")]
    InvalidData { peer: PeerId, reason: String },

    #[error("no peer available for {0} requests")]
    NoPeerAvailable(RequestKind),

    #[error("common ancestor is deeper than {floor}")]
    TooDeepReorg { floor: u64 },

    #[error("no common ancestor found")]
    NoCommonAncestor,

    #[error("sync cancelled")]
    Cancelled,

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl SyncError {
    /// Faults attributable to a single peer.
    pub fn is_peer_fault(&self) -> bool {
        matches!(self, SyncError::Timeout { .. } | SyncError::InvalidData { .. })
    }

    /// Errors that must stop the node rather than just the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Storage(_))
    }

    /// Errors after which a new session, possibly with another peer, can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Busy
                | SyncError::NoPeerAvailable(_)
                | SyncError::Timeout { .. }
                | SyncError::InvalidData { .. }
                | SyncError::UnknownPeer(_)
                | SyncError::Cancelled
        )
    }
}
