use std::collections::HashMap;
use std::time::Duration;

use containers::{Hash, U256};
use libp2p_identity::PeerId;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{futures::Notified, Notify};
use tracing::{debug, info, warn};

use crate::types::RequestKind;

/// Round trip estimate assumed for a peer we have not measured yet.
pub const INITIAL_RTT: Duration = Duration::from_millis(500);

/// Weight of a new round trip sample in the moving average, out of 8.
const RTT_SAMPLE_WEIGHT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerSetError {
    #[error("peer {0} is already registered")]
    AlreadyRegistered(PeerId),
    #[error("peer {0} is not registered")]
    NotRegistered(PeerId),
}

/// Head advertised by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerHead {
    pub hash: Hash,
    pub number: u64,
    pub td: U256,
}

/// Sync-relevant state of one connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub version: u32,
    pub head: PeerHead,
    pub rtt: Duration,
    pub timeouts: u32,
    pub dropped: bool,
    busy: [bool; RequestKind::COUNT],
}

impl PeerInfo {
    pub fn new(id: PeerId, version: u32, head: PeerHead) -> Self {
        Self {
            id,
            version,
            head,
            rtt: INITIAL_RTT,
            timeouts: 0,
            dropped: false,
            busy: [false; RequestKind::COUNT],
        }
    }

    pub fn is_busy(&self, kind: RequestKind) -> bool {
        self.busy[kind.index()]
    }

    /// Whether the peer can take a new request of `kind`.
    pub fn is_idle(&self, kind: RequestKind) -> bool {
        !self.dropped && !self.is_busy(kind)
    }

    pub fn has_block(&self, number: u64) -> bool {
        self.head.number >= number
    }
}

/// Connected sync peers.
///
/// All mutation happens under one write lock. Every change that can make a
/// peer eligible for work wakes tasks waiting in [`PeerSet::idle_notified`].
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    idle: Notify,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: PeerId, version: u32, head: PeerHead) -> Result<(), PeerSetError> {
        {
            let mut peers = self.peers.write();
            if peers.contains_key(&id) {
                return Err(PeerSetError::AlreadyRegistered(id));
            }
            peers.insert(id, PeerInfo::new(id, version, head));
        }
        info!(peer = %id, version, head = head.number, "Peer registered");
        self.idle.notify_waiters();
        Ok(())
    }

    pub fn unregister(&self, id: &PeerId) -> Option<PeerInfo> {
        let removed = self.peers.write().remove(id);
        if removed.is_some() {
            info!(peer = %id, "Peer unregistered");
            self.idle.notify_waiters();
        }
        removed
    }

    pub fn peer(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.read().keys().copied().collect()
    }

    /// Live peers whose advertised head is above `number`.
    pub fn peers_with_head_above(&self, number: u64) -> Vec<PeerInfo> {
        self.peers
            .read()
            .values()
            .filter(|peer| !peer.dropped && peer.head.number > number)
            .cloned()
            .collect()
    }

    /// Live peer with the heaviest advertised head.
    pub fn best_peer(&self) -> Option<PeerInfo> {
        self.peers
            .read()
            .values()
            .filter(|peer| !peer.dropped)
            .max_by(|a, b| {
                a.head
                    .td
                    .cmp(&b.head.td)
                    .then(a.head.number.cmp(&b.head.number))
            })
            .cloned()
    }

    /// Pick the idle peer with the lowest round trip time among those
    /// accepted by `predicate` and mark it busy for `kind`.
    pub fn reserve_idle<F>(&self, kind: RequestKind, predicate: F) -> Option<PeerInfo>
    where
        F: Fn(&PeerInfo) -> bool,
    {
        let mut peers = self.peers.write();
        let best = peers
            .values()
            .filter(|peer| peer.is_idle(kind) && predicate(peer))
            .min_by(|a, b| a.rtt.cmp(&b.rtt).then(a.timeouts.cmp(&b.timeouts)))
            .map(|peer| peer.id)?;
        let peer = peers.get_mut(&best)?;
        peer.busy[kind.index()] = true;
        Some(peer.clone())
    }

    /// Mark the peer busy for `kind`. Returns false if it is unknown, dropped
    /// or already busy.
    pub fn set_busy(&self, id: &PeerId, kind: RequestKind) -> bool {
        let mut peers = self.peers.write();
        match peers.get_mut(id) {
            Some(peer) if peer.is_idle(kind) => {
                peer.busy[kind.index()] = true;
                true
            }
            _ => false,
        }
    }

    pub fn set_idle(&self, id: &PeerId, kind: RequestKind) {
        let released = match self.peers.write().get_mut(id) {
            Some(peer) => {
                peer.busy[kind.index()] = false;
                true
            }
            None => false,
        };
        if released {
            self.idle.notify_waiters();
        }
    }

    /// Flag a peer as misbehaving. It keeps its entry until the transport
    /// unregisters it but is never handed work again. Returns true the first
    /// time the peer is dropped.
    pub fn mark_dropped(&self, id: &PeerId) -> bool {
        let newly_dropped = match self.peers.write().get_mut(id) {
            Some(peer) if !peer.dropped => {
                peer.dropped = true;
                true
            }
            _ => false,
        };
        if newly_dropped {
            warn!(peer = %id, "Peer marked for drop");
            // Waiters may be blocked on this peer only.
            self.idle.notify_waiters();
        }
        newly_dropped
    }

    pub fn is_dropped(&self, id: &PeerId) -> bool {
        self.peers.read().get(id).is_some_and(|peer| peer.dropped)
    }

    /// Count a timeout against the peer and return its new total.
    pub fn record_timeout(&self, id: &PeerId) -> u32 {
        match self.peers.write().get_mut(id) {
            Some(peer) => {
                peer.timeouts += 1;
                peer.timeouts
            }
            None => 0,
        }
    }

    pub fn update_rtt(&self, id: &PeerId, sample: Duration) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            peer.rtt = (peer.rtt * (8 - RTT_SAMPLE_WEIGHT) + sample * RTT_SAMPLE_WEIGHT) / 8;
            debug!(peer = %id, rtt_ms = peer.rtt.as_millis() as u64, "Updated round trip estimate");
        }
    }

    pub fn update_head(&self, id: &PeerId, head: PeerHead) {
        let updated = match self.peers.write().get_mut(id) {
            Some(peer) => {
                peer.head = head;
                true
            }
            None => false,
        };
        if updated {
            self.idle.notify_waiters();
        }
    }

    /// Future that resolves at the next change that might make a peer
    /// eligible for work. Enable it before checking for idle peers so that
    /// no wakeup is lost in between.
    pub fn idle_notified(&self) -> Notified<'_> {
        self.idle.notified()
    }
}
