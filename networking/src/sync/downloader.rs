use std::sync::Arc;

use chain::ChainStore;
use consensus::Engine;
use containers::{Block, Hash, Header, Receipt};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use libp2p_identity::PeerId;
use metrics::{Metrics, SharedMetrics};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{SyncConfig, EVENT_CHANNEL_CAPACITY, MAX_SKELETON_SIZE};
use super::error::SyncError;
use super::progress::Progress;
use super::queue::{FetchResult, HeaderBatch, Queue, QueueError, ReservedRequest};
use super::states::{NodeMode, SyncMode, SyncState};
use crate::distributor::RequestDistributor;
use crate::peer_set::{PeerHead, PeerInfo, PeerSet, PeerSetError};
use crate::transport::SyncNetwork;
use crate::types::{RequestId, RequestIds, RequestKind, SyncRequest, SyncResponse, ETH63};

/// Lifecycle notifications for subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Started { origin: u64, target: u64 },
    Done { imported: u64, head: Hash },
    Failed { error: SyncError },
    Cancelled,
}

/// Outcome of a successful session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub mode: SyncMode,
    /// Highest block shared with the sync peer.
    pub ancestor: u64,
    pub target: u64,
    /// Blocks, or headers in light mode, written to storage.
    pub imported: u64,
    pub head: Hash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SyncState,
    pub mode: Option<SyncMode>,
    pub peer: Option<PeerId>,
    pub ancestor: u64,
    pub target: u64,
    pub pivot: Option<u64>,
    /// Set once the first session completes. Transaction acceptance keys off
    /// this.
    pub synced_once: bool,
}

/// Response of one pipelined request.
struct Fetched {
    peer: PeerId,
    id: RequestId,
    kind: RequestKind,
    result: Result<SyncResponse, FetchFailure>,
}

enum FetchFailure {
    Timeout,
    Network(anyhow::Error),
}

enum Dispatch {
    Sent(PeerId, ReservedRequest),
    NoWork,
    NoPeer,
}

/// Minimum protocol version a peer needs to serve `kind`.
fn min_version(kind: RequestKind) -> u32 {
    match kind {
        RequestKind::Receipts | RequestKind::NodeData => ETH63,
        _ => 0,
    }
}

/// Drives sync sessions against the registered peers.
///
/// A session runs inside [`Downloader::synchronize`]: the ancestor search,
/// then one fetcher per request kind, the header verifier, the importer and
/// the expiry sweep, all polled concurrently on the caller's task. Any of
/// them failing ends the session, and [`Downloader::cancel`] makes every one
/// of them return at its next suspension point.
pub struct Downloader<N: SyncNetwork> {
    config: SyncConfig,
    node_mode: NodeMode,
    store: Arc<dyn ChainStore>,
    engine: Arc<dyn Engine>,
    network: Arc<N>,
    peers: Arc<PeerSet>,
    distributor: RequestDistributor,
    queue: Queue,
    ids: Arc<RequestIds>,
    status: Mutex<SessionStatus>,
    progress: RwLock<Progress>,
    events: broadcast::Sender<SyncEvent>,
    cancel: Mutex<CancellationToken>,
    /// Held around every storage write so that cancellation and rewinds
    /// never interleave with an import.
    import_lock: Mutex<()>,
    metrics: Option<SharedMetrics>,
}

/// Ends the session if `synchronize` is dropped before it returns.
struct SessionGuard<'a, N: SyncNetwork> {
    downloader: &'a Downloader<N>,
    finished: bool,
}

impl<N: SyncNetwork> Drop for SessionGuard<'_, N> {
    fn drop(&mut self) {
        if !self.finished {
            self.downloader.end_session(&Err(SyncError::Cancelled));
        }
    }
}

impl<N: SyncNetwork> Downloader<N> {
    pub fn new(
        config: SyncConfig,
        node_mode: NodeMode,
        store: Arc<dyn ChainStore>,
        engine: Arc<dyn Engine>,
        network: Arc<N>,
        peers: Arc<PeerSet>,
    ) -> Result<Self, SyncError> {
        if !node_mode.supports(config.mode) {
            return Err(SyncError::InvalidSyncMode(config.mode));
        }
        let ids = Arc::new(RequestIds::new());
        let queue = Queue::new(config.clone(), engine.clone(), store.clone(), ids.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let head = Self::local_head(store.as_ref(), config.mode).number;

        Ok(Self {
            config,
            node_mode,
            store,
            engine,
            network,
            distributor: RequestDistributor::new(peers.clone()),
            peers,
            queue,
            ids,
            status: Mutex::new(SessionStatus::default()),
            progress: RwLock::new(Progress {
                starting_block: head,
                current_block: head,
                highest_block: head,
                ..Default::default()
            }),
            events,
            cancel: Mutex::new(CancellationToken::new()),
            import_lock: Mutex::new(()),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record<F: FnOnce(&Metrics)>(&self, f: F) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }

    fn local_head(store: &dyn ChainStore, mode: SyncMode) -> Header {
        match mode {
            SyncMode::Full => store.current_block(),
            SyncMode::Fast => store.current_fast_block(),
            SyncMode::LightLegacy => store.current_header(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn progress(&self) -> Progress {
        *self.progress.read()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.lock().clone()
    }

    pub fn state(&self) -> SyncState {
        self.status.lock().state
    }

    pub fn has_synced(&self) -> bool {
        self.status.lock().synced_once
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn register_peer(&self, id: PeerId, version: u32, head: PeerHead) -> Result<(), PeerSetError> {
        self.peers.register(id, version, head)?;
        self.record(|m| m.set_peers(self.peers.len() as i64));
        Ok(())
    }

    /// Remove a peer and hand its outstanding tasks back to the queue.
    pub fn unregister_peer(&self, id: &PeerId) {
        let revoked = self.queue.revoke(id);
        self.peers.unregister(id);
        if !revoked.is_empty() {
            debug!(peer = %id, tasks = revoked.len(), "Requeued tasks of departed peer");
        }
        self.record(|m| m.set_peers(self.peers.len() as i64));
    }

    /// Abort the running session, if any. Blocks verified and imported before
    /// the call are kept.
    pub fn cancel(&self) {
        let token = self.cancel.lock();
        if !token.is_cancelled() {
            info!("Cancelling sync session");
            token.cancel();
        }
    }

    /// Cancel any running session and roll the chain back to `number`.
    pub fn rewind(&self, number: u64) -> Result<(), SyncError> {
        self.cancel();
        let _guard = self.import_lock.lock();
        self.store.rewind(number)?;
        let mut progress = self.progress.write();
        progress.current_block = progress.current_block.min(number);
        info!(number, "Rewound chain");
        Ok(())
    }

    /// Synchronize with `peer` up to the block `head` it announced.
    pub async fn synchronize(
        &self,
        peer: PeerId,
        head: Hash,
        mode: SyncMode,
    ) -> Result<SyncReport, SyncError> {
        if !self.node_mode.supports(mode) {
            return Err(SyncError::InvalidSyncMode(mode));
        }
        let cancel = self.begin_session(peer, mode)?;
        let mut guard = SessionGuard {
            downloader: self,
            finished: false,
        };
        let result = self.run(peer, head, mode, &cancel).await;
        guard.finished = true;
        self.end_session(&result);
        result
    }

    fn begin_session(&self, peer: PeerId, mode: SyncMode) -> Result<CancellationToken, SyncError> {
        let mut status = self.status.lock();
        if status.state.is_active() {
            return Err(SyncError::Busy);
        }
        status.state = SyncState::FindAncestor;
        status.mode = Some(mode);
        status.peer = Some(peer);
        status.pivot = None;

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        let head = Self::local_head(self.store.as_ref(), mode).number;
        let mut progress = self.progress.write();
        *progress = Progress {
            starting_block: head,
            current_block: head,
            highest_block: head,
            ..Default::default()
        };
        info!(peer = %peer, %mode, head, "Starting sync session");
        Ok(token)
    }

    fn end_session(&self, result: &Result<SyncReport, SyncError>) {
        for reservation in self.queue.reset() {
            self.distributor.release(&reservation.peer, reservation.kind);
        }

        let (next, label, event) = match result {
            Ok(report) => (
                SyncState::Idle,
                "success",
                SyncEvent::Done {
                    imported: report.imported,
                    head: report.head,
                },
            ),
            Err(SyncError::Cancelled) => (SyncState::Cancelled, "cancelled", SyncEvent::Cancelled),
            Err(error) => (
                SyncState::Failed,
                "failed",
                SyncEvent::Failed {
                    error: error.clone(),
                },
            ),
        };
        {
            let mut status = self.status.lock();
            if !status.state.can_transition_to(next) {
                warn!(from = ?status.state, to = ?next, "Unexpected sync state transition");
            }
            status.state = next;
            if result.is_ok() {
                status.synced_once = true;
            }
        }
        self.record(|m| m.inc_sync_session(label));

        match result {
            Ok(report) => info!(
                imported = report.imported,
                head = report.target,
                "Sync session finished"
            ),
            Err(SyncError::Cancelled) => info!("Sync session cancelled"),
            Err(err) => warn!(%err, "Sync session failed"),
        }
        let _ = self.events.send(event);
    }

    /// Move the session forward, ignoring moves that are no longer possible.
    fn advance(&self, next: SyncState) {
        let mut status = self.status.lock();
        if status.state != next && status.state.can_transition_to(next) {
            debug!(from = ?status.state, to = ?next, "Sync state transition");
            status.state = next;
        }
    }

    async fn run(
        &self,
        peer: PeerId,
        head: Hash,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let info = self
            .peers
            .peer(&peer)
            .filter(|info| !info.dropped)
            .ok_or(SyncError::UnknownPeer(peer))?;

        let target = self.fetch_target(&info, head, cancel).await?;
        self.progress.write().advance_highest(target.number);
        self.record(|m| m.set_highest_block(target.number));

        let ancestor = self.find_ancestor(&info, &target, mode, cancel).await?;
        let report = SyncReport {
            mode,
            ancestor: ancestor.number,
            target: target.number,
            imported: 0,
            head: target.hash(),
        };
        if ancestor.number >= target.number {
            debug!(ancestor = ancestor.number, "Already in sync with peer");
            return Ok(report);
        }

        let origin = ancestor.number + 1;
        let skeleton = self.fetch_skeleton(&info, origin, &target, cancel).await?;
        let pivot = match mode {
            SyncMode::Fast => self.config.pivot_for(target.number).filter(|pivot| *pivot >= origin),
            _ => None,
        };
        {
            let mut status = self.status.lock();
            status.ancestor = ancestor.number;
            status.target = target.number;
            status.pivot = pivot;
        }
        self.queue.prepare(origin, target.number, mode, pivot);
        self.queue.anchor_headers(&[ancestor.clone(), target.clone()]);
        self.queue.anchor_headers(&skeleton);
        self.advance(SyncState::FetchHeaders);
        let _ = self.events.send(SyncEvent::Started {
            origin: ancestor.number,
            target: target.number,
        });
        info!(
            ancestor = ancestor.number,
            target = target.number,
            ?pivot,
            "Found common ancestor, fetching chain"
        );

        let pipeline = async {
            tokio::try_join!(
                self.fetch_loop(RequestKind::Headers, cancel),
                self.fetch_loop(RequestKind::Bodies, cancel),
                self.fetch_loop(RequestKind::Receipts, cancel),
                self.fetch_loop(RequestKind::NodeData, cancel),
                self.process_headers(ancestor, &target, mode, cancel),
                self.import_results(mode, pivot, cancel),
            )
        };
        let (_, _, _, _, headers_written, blocks_written) = tokio::select! {
            result = pipeline => result?,
            err = self.expiry_loop(cancel) => return Err(err),
        };

        self.advance(SyncState::Import);
        Ok(SyncReport {
            imported: headers_written + blocks_written,
            ..report
        })
    }

    /// Send a header request straight to the session peer.
    async fn request_headers(
        &self,
        peer: &PeerInfo,
        request: SyncRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Header>, SyncError> {
        let id = self.ids.next();
        let request = self.network.request(peer.id, id, request);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            response = tokio::time::timeout(self.config.request_timeout(), request) => response,
        };
        match response {
            Ok(Ok(SyncResponse::BlockHeaders(headers))) => Ok(headers),
            Ok(Ok(other)) => {
                let reason = format!("{} response to a header request", other.kind());
                self.drop_peer(&peer.id, &reason);
                Err(SyncError::InvalidData {
                    peer: peer.id,
                    reason,
                })
            }
            Ok(Err(err)) => {
                debug!(peer = %peer.id, %err, "Header request failed");
                self.penalize(&peer.id, RequestKind::Headers);
                Err(SyncError::Timeout {
                    peer: peer.id,
                    kind: RequestKind::Headers,
                })
            }
            Err(_) => {
                self.penalize(&peer.id, RequestKind::Headers);
                Err(SyncError::Timeout {
                    peer: peer.id,
                    kind: RequestKind::Headers,
                })
            }
        }
    }

    fn invalid(&self, peer: &PeerId, reason: String) -> SyncError {
        self.drop_peer(peer, &reason);
        SyncError::InvalidData {
            peer: *peer,
            reason,
        }
    }

    async fn fetch_target(
        &self,
        peer: &PeerInfo,
        head: Hash,
        cancel: &CancellationToken,
    ) -> Result<Header, SyncError> {
        let headers = self
            .request_headers(peer, SyncRequest::headers(head, 1), cancel)
            .await?;
        match headers.as_slice() {
            [header] if header.hash() == head => Ok(header.clone()),
            _ => Err(self.invalid(&peer.id, format!("announced head {head} not served"))),
        }
    }

    /// Fetch the peer's header at `number` and return it if we have that
    /// block too.
    async fn probe(
        &self,
        peer: &PeerInfo,
        number: u64,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<Option<Header>, SyncError> {
        let headers = self
            .request_headers(peer, SyncRequest::headers(number, 1), cancel)
            .await?;
        let header = match headers.as_slice() {
            [header] if header.number == number => header.clone(),
            _ => return Err(self.invalid(&peer.id, format!("header #{number} not served"))),
        };
        let hash = header.hash();
        let known = match mode {
            SyncMode::LightLegacy => self.store.has_header(&hash, number),
            SyncMode::Full | SyncMode::Fast => self.store.has_block(&hash, number),
        };
        Ok(known.then_some(header))
    }

    /// Locate the highest block both sides have.
    ///
    /// The local head is probed first, which settles the common case of a
    /// peer simply being ahead. Otherwise the search is a binary search over
    /// the range the reorg limit allows.
    async fn find_ancestor(
        &self,
        peer: &PeerInfo,
        target: &Header,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<Header, SyncError> {
        let local = Self::local_head(self.store.as_ref(), mode).number;
        let start = local.min(target.number);
        if let Some(header) = self.probe(peer, start, mode, cancel).await? {
            return Ok(header);
        }

        let floor = local.saturating_sub(self.config.max_reorg_depth);
        let Some(mut best) = self.probe(peer, floor, mode, cancel).await? else {
            return Err(if floor == 0 {
                SyncError::NoCommonAncestor
            } else {
                SyncError::TooDeepReorg { floor }
            });
        };

        let (mut low, mut high) = (floor, start);
        while low + 1 < high {
            let mid = low + (high - low) / 2;
            match self.probe(peer, mid, mode, cancel).await? {
                Some(header) => {
                    low = mid;
                    best = header;
                }
                None => high = mid,
            }
        }
        debug!(peer = %peer.id, ancestor = best.number, local, "Binary ancestor search done");
        Ok(best)
    }

    /// Fetch from the sync peer the last header of every header batch below
    /// the target. Batches filled by any peer must end on these headers.
    async fn fetch_skeleton(
        &self,
        peer: &PeerInfo,
        origin: u64,
        target: &Header,
        cancel: &CancellationToken,
    ) -> Result<Vec<Header>, SyncError> {
        let batch = self.config.header_batch.max(1);
        let total = target.number.saturating_sub(origin) / batch;
        let mut skeleton = Vec::with_capacity(total as usize);
        while (skeleton.len() as u64) < total {
            let index = skeleton.len() as u64 + 1;
            let from = origin + index * batch - 1;
            let amount = MAX_SKELETON_SIZE.min(total - index + 1);
            let request = SyncRequest::skeleton(from, amount, batch - 1);
            let headers = self.request_headers(peer, request, cancel).await?;
            let expected = (0..amount).map(|offset| from + offset * batch);
            if headers.len() as u64 != amount
                || !headers.iter().zip(expected).all(|(header, number)| header.number == number)
            {
                return Err(self.invalid(&peer.id, format!("bad skeleton from #{from}")));
            }
            skeleton.extend(headers);
        }
        if !skeleton.is_empty() {
            debug!(peer = %peer.id, anchors = skeleton.len(), "Fetched header skeleton");
        }
        Ok(skeleton)
    }

    /// Reserve the next task of `kind` with the fastest idle peer able to
    /// serve it.
    fn dispatch(&self, kind: RequestKind) -> Dispatch {
        let version = min_version(kind);
        let peer = self.distributor.try_distribute(kind, |peer| {
            peer.version >= version && self.queue.can_serve(peer, kind)
        });
        let Some(peer) = peer else {
            return if self.queue.has_work(kind) {
                Dispatch::NoPeer
            } else {
                Dispatch::NoWork
            };
        };
        match self.queue.reserve(&peer, kind) {
            Some(request) => Dispatch::Sent(peer.id, request),
            None => {
                self.distributor.release(&peer.id, kind);
                Dispatch::NoWork
            }
        }
    }

    fn send(&self, peer: PeerId, request: ReservedRequest) -> BoxFuture<'static, Fetched> {
        let network = self.network.clone();
        let timeout = self.config.request_timeout();
        debug!(peer = %peer, id = request.id, request = %request.request, "Sending request");
        async move {
            let result =
                match tokio::time::timeout(timeout, network.request(peer, request.id, request.request)).await
                {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(err)) => Err(FetchFailure::Network(err)),
                    Err(_) => Err(FetchFailure::Timeout),
                };
            Fetched {
                peer,
                id: request.id,
                kind: request.kind,
                result,
            }
        }
        .boxed()
    }

    /// Keep every idle peer busy with tasks of `kind` until the queue has no
    /// more of them.
    async fn fetch_loop(&self, kind: RequestKind, cancel: &CancellationToken) -> Result<(), SyncError> {
        let mut in_flight = FuturesUnordered::new();
        let mut starved_since: Option<Instant> = None;

        loop {
            let peers_changed = self.peers.idle_notified();
            let work_changed = self.queue.changed();
            tokio::pin!(peers_changed, work_changed);
            peers_changed.as_mut().enable();
            work_changed.as_mut().enable();

            let mut starved = false;
            loop {
                match self.dispatch(kind) {
                    Dispatch::Sent(peer, request) => in_flight.push(self.send(peer, request)),
                    Dispatch::NoPeer => {
                        starved = true;
                        break;
                    }
                    Dispatch::NoWork => break,
                }
            }

            if in_flight.is_empty() && self.queue.is_finished(kind) {
                return Ok(());
            }
            let deadline = if starved && in_flight.is_empty() {
                let since = *starved_since.get_or_insert_with(Instant::now);
                let deadline = since + self.config.distribute_timeout();
                if Instant::now() >= deadline {
                    warn!(%kind, "No peer available to fetch from");
                    return Err(SyncError::NoPeerAvailable(kind));
                }
                Some(deadline)
            } else {
                starved_since = None;
                None
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                Some(fetched) = in_flight.next(), if !in_flight.is_empty() => {
                    self.handle_response(fetched)?;
                }
                _ = &mut peers_changed => {}
                _ = &mut work_changed => {}
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }
        }
    }

    fn handle_response(&self, fetched: Fetched) -> Result<(), SyncError> {
        let Fetched {
            peer,
            id,
            kind,
            result,
        } = fetched;
        let response = match result {
            Ok(response) => response,
            Err(failure) => {
                if let FetchFailure::Network(err) = &failure {
                    debug!(peer = %peer, %kind, id, %err, "Request failed");
                }
                // Whoever takes the reservation back settles the peer.
                if let Some(reservation) = self.queue.expire_request(id) {
                    self.on_expired(&reservation.peer, reservation.kind, id);
                }
                return Ok(());
            }
        };

        let items = response.len() as u64;
        match self.queue.deliver(id, &peer, response) {
            Ok(delivery) => {
                self.peers.update_rtt(&peer, delivery.elapsed);
                self.distributor.release(&peer, kind);
                self.record(|m| {
                    m.inc_items_in(kind.as_str(), delivery.accepted as u64);
                    m.observe_request_time(kind.as_str(), delivery.elapsed.as_secs_f64());
                });
                if kind == RequestKind::NodeData {
                    let (pulled, known) = self.queue.state_progress();
                    self.progress.write().record_states(pulled, known);
                }
                debug!(peer = %peer, %kind, id, accepted = delivery.accepted, "Delivery accepted");
            }
            Err(QueueError::StaleDelivery(_)) => {
                debug!(peer = %peer, %kind, id, "Discarding stale delivery");
                self.record(|m| m.inc_items_dropped(kind.as_str(), items));
            }
            Err(QueueError::EmptyDelivery(_)) => self.on_expired(&peer, kind, id),
            Err(QueueError::InvalidData(reason)) => {
                self.record(|m| m.inc_items_dropped(kind.as_str(), items));
                self.distributor.release(&peer, kind);
                self.drop_peer(&peer, &reason);
            }
            Err(QueueError::Cancelled) => return Err(SyncError::Cancelled),
            Err(QueueError::Storage(err)) => return Err(err.into()),
        }
        Ok(())
    }

    /// Settle a peer whose reservation lapsed or came back empty.
    fn on_expired(&self, peer: &PeerId, kind: RequestKind, id: RequestId) {
        warn!(peer = %peer, %kind, id, "Request timed out");
        self.penalize(peer, kind);
        self.distributor.release(peer, kind);
    }

    fn penalize(&self, peer: &PeerId, kind: RequestKind) {
        self.record(|m| m.inc_timeouts(kind.as_str()));
        // A timed out peer sorts behind peers that answer.
        self.peers.update_rtt(peer, self.config.request_timeout());
        let timeouts = self.peers.record_timeout(peer);
        if timeouts >= self.config.max_peer_timeouts {
            self.drop_peer(peer, "too many timeouts");
        }
    }

    /// Stop using a peer for the rest of its connection and requeue its work.
    fn drop_peer(&self, peer: &PeerId, reason: &str) {
        if !self.peers.mark_dropped(peer) {
            return;
        }
        warn!(peer = %peer, reason, "Dropping peer");
        self.network.disconnect(*peer);
        for reservation in self.queue.revoke(peer) {
            self.distributor.release(&reservation.peer, reservation.kind);
        }
    }

    async fn expiry_loop(&self, cancel: &CancellationToken) -> SyncError {
        let mut interval = tokio::time::interval(self.config.expiry_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SyncError::Cancelled,
                _ = interval.tick() => {}
            }
            for reservation in self.queue.expire(Instant::now()) {
                self.on_expired(&reservation.peer, reservation.kind, reservation.id);
            }
        }
    }

    /// Check a header batch against the last accepted header and the engine.
    fn verify_batch(&self, parent: &Header, batch: &HeaderBatch, target: &Header) -> Result<(), String> {
        let Some(first) = batch.headers.first() else {
            return Err("empty header batch".into());
        };
        if first.parent_hash != parent.hash() {
            return Err(format!(
                "header #{} does not link to #{}",
                first.number, parent.number
            ));
        }
        self.engine
            .verify_headers(parent, &batch.headers)
            .map_err(|(index, err)| format!("header #{}: {err}", batch.from + index as u64))?;
        match batch.headers.last() {
            Some(last) if last.number == target.number && last.hash() != target.hash() => {
                Err(format!("header #{} is not the announced head", last.number))
            }
            _ => Ok(()),
        }
    }

    /// Release delivered header batches in order, verify them and hand them
    /// to the queue. Returns the number of headers written in light mode.
    async fn process_headers(
        &self,
        ancestor: Header,
        target: &Header,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<u64, SyncError> {
        let mut parent = ancestor;
        let mut written = 0;
        loop {
            let ready = self.queue.ready();
            tokio::pin!(ready);
            ready.as_mut().enable();

            while let Some(batch) = self.queue.next_header_batch() {
                if let Err(reason) = self.verify_batch(&parent, &batch, target) {
                    warn!(peer = %batch.supplier, from = batch.from, %reason, "Rejected header batch");
                    let supplier = batch.supplier;
                    let count = batch.headers.len() as u64;
                    self.queue.reject_headers(batch);
                    self.record(|m| m.inc_items_dropped(metrics::KIND_HEADERS, count));
                    self.drop_peer(&supplier, &reason);
                    continue;
                }

                if mode == SyncMode::LightLegacy {
                    written += self.write_headers(&batch.headers, cancel)?;
                }
                self.queue
                    .accept_headers(&batch, cancel)
                    .await
                    .map_err(|_| SyncError::Cancelled)?;
                if let Some(last) = batch.headers.last() {
                    debug!(from = batch.from, to = last.number, "Accepted header batch");
                    parent = last.clone();
                }
            }

            if self.queue.headers_complete() {
                self.advance(match mode {
                    SyncMode::LightLegacy => SyncState::Import,
                    _ => SyncState::FetchData,
                });
                return Ok(written);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = &mut ready => {}
            }
        }
    }

    fn write_headers(&self, headers: &[Header], cancel: &CancellationToken) -> Result<u64, SyncError> {
        let _guard = self.import_lock.lock();
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.store.insert_header_chain(headers)?;
        if let Some(last) = headers.last() {
            self.progress.write().advance_current(last.number);
            self.record(|m| m.set_current_block(last.number));
        }
        Ok(headers.len() as u64)
    }

    /// Hand complete results to storage in order. Returns the number of
    /// blocks written.
    async fn import_results(
        &self,
        mode: SyncMode,
        pivot: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64, SyncError> {
        let mut imported = 0;
        loop {
            let ready = self.queue.ready();
            tokio::pin!(ready);
            ready.as_mut().enable();

            let results = self.queue.results(self.config.max_import_batch);
            if !results.is_empty() {
                imported += self.import(results, mode, pivot, cancel)?;
                continue;
            }
            if self.queue.is_drained() {
                return Ok(imported);
            }
            if self.queue.headers_complete()
                && [RequestKind::Bodies, RequestKind::Receipts, RequestKind::NodeData]
                    .into_iter()
                    .all(|kind| self.queue.is_finished(kind))
            {
                self.advance(SyncState::Import);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = &mut ready => {}
            }
        }
    }

    fn import(
        &self,
        results: Vec<FetchResult>,
        mode: SyncMode,
        pivot: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<u64, SyncError> {
        let _guard = self.import_lock.lock();
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let count = results.len() as u64;
        let (first, last) = match (results.first(), results.last()) {
            (Some(first), Some(last)) => (first.number(), last.number()),
            _ => return Ok(0),
        };

        let pivot = pivot.filter(|_| mode == SyncMode::Fast);
        let (receipt_part, full_part): (Vec<FetchResult>, Vec<FetchResult>) = results
            .into_iter()
            .partition(|result| pivot.is_some_and(|pivot| result.number() <= pivot));

        if !receipt_part.is_empty() {
            let (blocks, receipts): (Vec<Block>, Vec<Vec<Receipt>>) =
                receipt_part.into_iter().map(FetchResult::into_parts).unzip();
            self.store.insert_receipt_chain(&blocks, &receipts)?;
            if let Some(pivot_block) = blocks.iter().find(|block| Some(block.number()) == pivot) {
                self.store.commit_fast_head(&pivot_block.hash())?;
                info!(number = pivot_block.number(), "Committed fast sync pivot");
            }
        }
        if !full_part.is_empty() {
            let blocks: Vec<Block> = full_part
                .into_iter()
                .map(|result| result.into_parts().0)
                .collect();
            self.store.insert_chain(&blocks)?;
        }

        self.progress.write().advance_current(last);
        self.record(|m| m.set_current_block(last));
        debug!(first, last, "Imported blocks");
        Ok(count)
    }
}

impl<N: SyncNetwork> std::fmt::Debug for Downloader<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("node_mode", &self.node_mode)
            .field("status", &*self.status.lock())
            .field("progress", &*self.progress.read())
            .finish()
    }
}
