use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use containers::Hash;
use libp2p::Multiaddr;
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info};

use super::config::LesConfig;
use crate::types::{LPV1, LPV2};

/// Score given to a server we have never talked to.
const INITIAL_SCORE: f64 = 0.5;

/// Weight of a new outcome in the score average.
const SCORE_WEIGHT: f64 = 0.1;

/// Discovery topic under which servers of `version` on the chain starting at
/// `genesis` advertise themselves.
pub fn les_topic(genesis: &Hash, version: u32) -> Option<String> {
    let prefix = match version {
        LPV1 => "LES",
        LPV2 => "LES2",
        _ => return None,
    };
    Some(format!("{prefix}@{}", hex::encode(&genesis[..8])))
}

/// Dial backoff after `failures` consecutive failed dials, before jitter.
pub fn dial_backoff(failures: u32, base: Duration, cap: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connection {
    Idle,
    Dialing,
    Connected(PeerId),
}

#[derive(Debug, Clone)]
struct Entry {
    score: f64,
    latency: Option<Duration>,
    dial_failures: u32,
    next_dial: Option<Instant>,
    connection: Connection,
}

impl Entry {
    fn new() -> Self {
        Self {
            score: INITIAL_SCORE,
            latency: None,
            dial_failures: 0,
            next_dial: None,
            connection: Connection::Idle,
        }
    }

    fn dialable(&self, now: Instant) -> bool {
        self.connection == Connection::Idle && self.next_dial.is_none_or(|at| at <= now)
    }

    fn record(&mut self, outcome: f64) {
        self.score = self.score * (1.0 - SCORE_WEIGHT) + outcome * SCORE_WEIGHT;
    }

    /// Better servers sort first: higher score, then lower latency, with
    /// unmeasured latency last.
    fn rank(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| match (self.latency, other.latency) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Multiaddr, Entry>,
    peers: HashMap<PeerId, Multiaddr>,
}

/// Known light servers and how well they have served us.
///
/// The connection layer dials whatever [`ServerPool::suggest`] returns and
/// reports back through `connected`, `disconnected` and
/// `record_dial_failure`. The retrieval layer feeds request outcomes into
/// the score through `record_success` and `record_failure`.
#[derive(Debug)]
pub struct ServerPool {
    topic: Option<String>,
    backoff_base: Duration,
    backoff_cap: Duration,
    inner: Mutex<Inner>,
}

impl ServerPool {
    pub fn new(genesis: &Hash, config: &LesConfig) -> Self {
        let topic = les_topic(genesis, config.protocol_version);
        info!(topic = topic.as_deref().unwrap_or("none"), "Created server pool");
        Self {
            topic,
            backoff_base: config.dial_backoff_base(),
            backoff_cap: config.dial_backoff_cap(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Returns false if the address was already known.
    pub fn add_candidate(&self, addr: Multiaddr) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&addr) {
            return false;
        }
        debug!(%addr, "New server candidate");
        inner.entries.insert(addr, Entry::new());
        true
    }

    pub fn add_candidates<I>(&self, addrs: I) -> usize
    where
        I: IntoIterator<Item = Multiaddr>,
    {
        addrs
            .into_iter()
            .filter(|addr| self.add_candidate(addr.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn score(&self, addr: &Multiaddr) -> Option<f64> {
        self.inner.lock().entries.get(addr).map(|entry| entry.score)
    }

    /// Best server that is neither connected, being dialed nor backing off.
    /// The returned address is marked as being dialed.
    pub fn suggest(&self) -> Option<Multiaddr> {
        self.suggest_at(Instant::now())
    }

    pub(crate) fn suggest_at(&self, now: Instant) -> Option<Multiaddr> {
        let mut inner = self.inner.lock();
        let (addr, entry) = inner
            .entries
            .iter_mut()
            .filter(|(_, entry)| entry.dialable(now))
            .min_by(|(_, a), (_, b)| a.rank(b))?;
        entry.connection = Connection::Dialing;
        debug!(%addr, score = entry.score, "Suggesting server");
        Some(addr.clone())
    }

    pub fn connected(&self, addr: Multiaddr, peer: PeerId) {
        let mut inner = self.inner.lock();
        let entry = inner.entries.entry(addr.clone()).or_insert_with(Entry::new);
        entry.connection = Connection::Connected(peer);
        entry.dial_failures = 0;
        entry.next_dial = None;
        inner.peers.insert(peer, addr);
    }

    pub fn disconnected(&self, peer: &PeerId) {
        let mut inner = self.inner.lock();
        let Some(addr) = inner.peers.remove(peer) else {
            return;
        };
        if let Some(entry) = inner.entries.get_mut(&addr) {
            entry.connection = Connection::Idle;
        }
    }

    pub fn record_success(&self, peer: &PeerId, latency: Duration) {
        self.update(peer, |entry| {
            entry.record(1.0);
            entry.latency = Some(match entry.latency {
                Some(previous) => (previous * 7 + latency) / 8,
                None => latency,
            });
        });
    }

    pub fn record_failure(&self, peer: &PeerId) {
        self.update(peer, |entry| entry.record(0.0));
    }

    fn update<F: FnOnce(&mut Entry)>(&self, peer: &PeerId, f: F) {
        let mut inner = self.inner.lock();
        let Inner { entries, peers } = &mut *inner;
        if let Some(entry) = peers.get(peer).and_then(|addr| entries.get_mut(addr)) {
            f(entry);
        }
    }

    /// Put the address back into rotation after an exponentially growing,
    /// jittered delay.
    pub fn record_dial_failure(&self, addr: &Multiaddr) {
        self.record_dial_failure_at(addr, Instant::now());
    }

    pub(crate) fn record_dial_failure_at(&self, addr: &Multiaddr, now: Instant) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(addr) else {
            return;
        };
        entry.dial_failures += 1;
        entry.connection = Connection::Idle;
        entry.record(0.0);
        let backoff = dial_backoff(entry.dial_failures, self.backoff_base, self.backoff_cap);
        let jitter_ms = backoff.as_millis() as u64 / 10;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        entry.next_dial = Some(now + backoff + jitter);
        debug!(
            %addr,
            failures = entry.dial_failures,
            backoff_ms = backoff.as_millis() as u64,
            "Dial failed, backing off"
        );
    }
}
