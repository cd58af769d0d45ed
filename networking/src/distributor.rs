use std::sync::Arc;
use std::time::Duration;

use libp2p_identity::PeerId;
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::peer_set::{PeerInfo, PeerSet};
use crate::types::RequestKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DistributeError {
    #[error("no suitable peer became available for {0} requests")]
    NoPeer(RequestKind),
    #[error("distribution cancelled")]
    Cancelled,
}

/// Hands requests to peers, one outstanding request per peer and kind.
#[derive(Debug, Clone)]
pub struct RequestDistributor {
    peers: Arc<PeerSet>,
}

impl RequestDistributor {
    pub fn new(peers: Arc<PeerSet>) -> Self {
        Self { peers }
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    /// Pick the fastest idle peer accepted by `predicate` without waiting.
    pub fn try_distribute<F>(&self, kind: RequestKind, predicate: F) -> Option<PeerInfo>
    where
        F: Fn(&PeerInfo) -> bool,
    {
        self.peers.reserve_idle(kind, predicate)
    }

    /// Like [`Self::try_distribute`], but waits up to `timeout` for a suitable
    /// peer to become idle. Cancelling `cancel` abandons the wait without
    /// touching peer state.
    pub async fn distribute<F>(
        &self,
        kind: RequestKind,
        predicate: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PeerInfo, DistributeError>
    where
        F: Fn(&PeerInfo) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.peers.idle_notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(peer) = self.try_distribute(kind, &predicate) {
                return Ok(peer);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(DistributeError::Cancelled),
                _ = sleep_until(deadline) => {
                    debug!(%kind, "Timed out waiting for an idle peer");
                    return Err(DistributeError::NoPeer(kind));
                }
                _ = &mut notified => {}
            }
        }
    }

    pub fn release(&self, peer: &PeerId, kind: RequestKind) {
        self.peers.set_idle(peer, kind);
    }
}
