use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chain::{ChainStore, StoreError};
use consensus::Engine;
use containers::{keccak256, receipts_root, Block, Body, Hash, Header, Receipt};
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{futures::Notified, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::SyncConfig;
use super::state_sync::{StateSync, StateSyncError};
use super::states::SyncMode;
use crate::peer_set::PeerInfo;
use crate::types::{RequestId, RequestIds, RequestKind, SyncRequest, SyncResponse};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("delivery for request {0} is stale")]
    StaleDelivery(RequestId),

    #[error("request {0} was answered with no data")]
    EmptyDelivery(RequestId),

    #[error("{0}")]
    InvalidData(String),

    #[error("queue wait cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Work covered by one reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskItems {
    Headers { from: u64, count: u64 },
    Blocks(Vec<u64>),
    Nodes(Vec<Hash>),
}

impl TaskItems {
    pub fn len(&self) -> usize {
        match self {
            TaskItems::Headers { count, .. } => *count as usize,
            TaskItems::Blocks(numbers) => numbers.len(),
            TaskItems::Nodes(hashes) => hashes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A task handed to one peer, with the deadline after which it is taken back.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: RequestId,
    pub peer: PeerId,
    pub kind: RequestKind,
    pub items: TaskItems,
    pub issued: Instant,
    pub deadline: Instant,
}

/// A reservation turned into the request that should be sent for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    pub items: usize,
    pub request: SyncRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub kind: RequestKind,
    pub accepted: usize,
    /// Time between reservation and delivery.
    pub elapsed: Duration,
}

/// Header batch delivered and linked internally, waiting for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBatch {
    pub from: u64,
    pub headers: Vec<Header>,
    pub supplier: PeerId,
}

/// Download slot for one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub header: Header,
    pub body: Option<Body>,
    pub receipts: Option<Vec<Receipt>>,
}

impl FetchResult {
    fn new(header: Header, needs_body: bool, needs_receipts: bool) -> Self {
        Self {
            header,
            body: (!needs_body).then(Body::default),
            receipts: (!needs_receipts).then(Vec::new),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.body.is_some() && self.receipts.is_some()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn into_parts(self) -> (Block, Vec<Receipt>) {
        let body = self.body.unwrap_or_default();
        (Block::new(self.header, body), self.receipts.unwrap_or_default())
    }
}

fn data_slot(kind: RequestKind) -> Option<usize> {
    match kind {
        RequestKind::Bodies => Some(0),
        RequestKind::Receipts => Some(1),
        _ => None,
    }
}

#[derive(Default)]
struct QueueInner {
    mode: Option<SyncMode>,
    pivot: Option<u64>,
    target: u64,

    /// Header tasks by first block number.
    header_pending: BTreeMap<u64, u64>,
    /// Delivered header batches not yet released for verification.
    header_done: BTreeMap<u64, (PeerId, Vec<Header>)>,
    /// First block number whose headers have not been accepted.
    header_next: u64,
    /// Hashes the sync peer committed to at batch boundaries, by number.
    anchors: BTreeMap<u64, Hash>,

    /// One slot per accepted header, oldest first.
    results: VecDeque<FetchResult>,
    result_offset: u64,
    /// Block numbers still missing bodies and receipts respectively.
    block_pending: [BTreeSet<u64>; 2],

    state: Option<StateSync>,

    reservations: HashMap<RequestId, Reservation>,
}

impl QueueInner {
    fn headers_complete(&self) -> bool {
        self.mode.is_some() && self.header_next > self.target
    }

    fn state_done(&self) -> bool {
        match self.pivot {
            None => true,
            Some(_) => self.state.as_ref().is_some_and(StateSync::is_done),
        }
    }

    fn result(&self, number: u64) -> Option<&FetchResult> {
        let index = number.checked_sub(self.result_offset)?;
        self.results.get(index as usize)
    }

    fn result_mut(&mut self, number: u64) -> Option<&mut FetchResult> {
        let index = number.checked_sub(self.result_offset)?;
        self.results.get_mut(index as usize)
    }

    fn has_reservations(&self, kind: RequestKind) -> bool {
        self.reservations.values().any(|reservation| reservation.kind == kind)
    }

    /// Return the items of a lapsed or failed reservation to the backlog.
    fn requeue(&mut self, kind: RequestKind, items: TaskItems) {
        match items {
            TaskItems::Headers { from, count } => {
                if from >= self.header_next {
                    self.header_pending.insert(from, count);
                }
            }
            TaskItems::Blocks(numbers) => {
                if let Some(slot) = data_slot(kind) {
                    let offset = self.result_offset;
                    self.block_pending[slot].extend(numbers.into_iter().filter(|n| *n >= offset));
                }
            }
            TaskItems::Nodes(hashes) => {
                if let Some(state) = self.state.as_mut() {
                    state.requeue(hashes);
                }
            }
        }
    }
}

/// Backlog of fetch tasks for one sync session.
///
/// Headers are fetched in fixed-size batches that may be delivered in any
/// order but are released for verification strictly in sequence. Verified
/// headers become result slots whose bodies, receipts and (at the fast sync
/// pivot) state are fetched in parallel; complete slots are released to the
/// importer in order, and a missing slot blocks everything behind it.
///
/// The number of slots is capped. Accepting more headers waits until the
/// importer has drained enough of them, which is what keeps a fast peer from
/// outrunning storage.
pub struct Queue {
    inner: Mutex<QueueInner>,
    engine: Arc<dyn Engine>,
    store: Arc<dyn ChainStore>,
    ids: Arc<RequestIds>,
    config: SyncConfig,
    /// New work or returned work is available to reserve.
    changed: Notify,
    /// Header batches or complete results are available.
    ready: Notify,
    /// Result slots were released.
    space: Notify,
}

impl Queue {
    pub fn new(
        config: SyncConfig,
        engine: Arc<dyn Engine>,
        store: Arc<dyn ChainStore>,
        ids: Arc<RequestIds>,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            engine,
            store,
            ids,
            config,
            changed: Notify::new(),
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Start a new session fetching blocks `origin..=target`.
    pub fn prepare(&self, origin: u64, target: u64, mode: SyncMode, pivot: Option<u64>) {
        let batch = self.config.header_batch.max(1);
        let mut inner = self.inner.lock();
        *inner = QueueInner {
            mode: Some(mode),
            pivot,
            target,
            header_next: origin,
            result_offset: origin,
            ..Default::default()
        };
        let mut from = origin;
        while from <= target {
            let count = batch.min(target - from + 1);
            inner.header_pending.insert(from, count);
            from += count;
        }
        debug!(origin, target, ?mode, ?pivot, tasks = inner.header_pending.len(), "Queue prepared");
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Pin batch boundaries to headers of the chain being synced: the common
    /// ancestor, the sync peer's skeleton and the target. A header batch is
    /// only accepted if it starts on the anchor before it and ends on the
    /// anchor at its last number.
    pub fn anchor_headers(&self, headers: &[Header]) {
        let mut inner = self.inner.lock();
        inner
            .anchors
            .extend(headers.iter().map(|header| (header.number, header.hash())));
        debug!(anchors = inner.anchors.len(), "Header batches anchored");
    }

    /// Drop all work and return the reservations that were outstanding.
    pub fn reset(&self) -> Vec<Reservation> {
        let mut inner = self.inner.lock();
        let reservations = inner.reservations.drain().map(|(_, r)| r).collect();
        *inner = QueueInner::default();
        drop(inner);
        self.changed.notify_waiters();
        self.ready.notify_waiters();
        self.space.notify_waiters();
        reservations
    }

    /// Reserve the next task of `kind` that `peer` can serve.
    pub fn reserve(&self, peer: &PeerInfo, kind: RequestKind) -> Option<ReservedRequest> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.mode?;

        let (items, request) = match kind {
            RequestKind::Headers => {
                let window = self.header_window(&inner);
                let (from, count) = inner
                    .header_pending
                    .iter()
                    .map(|(from, count)| (*from, *count))
                    .take_while(|(from, _)| *from < window)
                    .find(|(from, count)| peer.has_block(from + count - 1))?;
                inner.header_pending.remove(&from);
                (
                    TaskItems::Headers { from, count },
                    SyncRequest::headers(from, count),
                )
            }
            RequestKind::Bodies | RequestKind::Receipts => {
                let slot = data_slot(kind)?;
                let max = match kind {
                    RequestKind::Bodies => self.config.body_batch,
                    _ => self.config.receipt_batch,
                };
                let (numbers, hashes): (Vec<u64>, Vec<Hash>) = inner.block_pending[slot]
                    .iter()
                    .copied()
                    .filter(|number| peer.has_block(*number))
                    .filter_map(|number| Some((number, inner.result(number)?.header.hash())))
                    .take(max)
                    .unzip();
                if numbers.is_empty() {
                    return None;
                }
                for number in &numbers {
                    inner.block_pending[slot].remove(number);
                }
                let request = match kind {
                    RequestKind::Bodies => SyncRequest::GetBlockBodies(hashes),
                    _ => SyncRequest::GetReceipts(hashes),
                };
                (TaskItems::Blocks(numbers), request)
            }
            RequestKind::NodeData => {
                let state = inner.state.as_mut()?;
                let hashes = state.missing(self.config.state_batch);
                if hashes.is_empty() {
                    return None;
                }
                (
                    TaskItems::Nodes(hashes.clone()),
                    SyncRequest::GetNodeData(hashes),
                )
            }
            RequestKind::Odr => return None,
        };

        let id = self.ids.next();
        let items_len = items.len();
        inner.reservations.insert(
            id,
            Reservation {
                id,
                peer: peer.id,
                kind,
                items,
                issued: now,
                deadline: now + self.config.request_timeout(),
            },
        );
        Some(ReservedRequest {
            id,
            kind,
            items: items_len,
            request,
        })
    }

    fn header_window(&self, inner: &QueueInner) -> u64 {
        inner.header_next + self.config.header_batch * self.config.header_run_ahead.max(1) as u64
    }

    /// Whether any task of `kind` could be reserved right now.
    pub fn has_work(&self, kind: RequestKind) -> bool {
        self.reservable(kind, None)
    }

    /// Whether `peer` could take a task of `kind` right now.
    pub fn can_serve(&self, peer: &PeerInfo, kind: RequestKind) -> bool {
        self.reservable(kind, Some(peer))
    }

    fn reservable(&self, kind: RequestKind, peer: Option<&PeerInfo>) -> bool {
        let covers = |number: u64| peer.is_none_or(|peer| peer.has_block(number));
        let inner = self.inner.lock();
        if inner.mode.is_none() {
            return false;
        }
        match kind {
            RequestKind::Headers => {
                let window = self.header_window(&inner);
                inner
                    .header_pending
                    .iter()
                    .take_while(|(from, _)| **from < window)
                    .any(|(from, count)| covers(*from + *count - 1))
            }
            RequestKind::Bodies | RequestKind::Receipts => data_slot(kind)
                .is_some_and(|slot| inner.block_pending[slot].iter().any(|number| covers(*number))),
            RequestKind::NodeData => inner.state.as_ref().is_some_and(|state| state.pending() > 0),
            RequestKind::Odr => false,
        }
    }

    /// Hand a response to the reservation it answers.
    ///
    /// A reservation that already expired or was revoked yields
    /// `StaleDelivery` and nothing is recorded. Every other failure returns
    /// the reservation's work to the backlog before reporting.
    pub fn deliver(
        &self,
        id: RequestId,
        peer: &PeerId,
        response: SyncResponse,
    ) -> Result<Delivery, QueueError> {
        let mut inner = self.inner.lock();
        match inner.reservations.get(&id) {
            Some(reservation) if reservation.peer == *peer => {}
            _ => return Err(QueueError::StaleDelivery(id)),
        }
        let Some(reservation) = inner.reservations.remove(&id) else {
            return Err(QueueError::StaleDelivery(id));
        };
        let kind = reservation.kind;
        let elapsed = reservation.issued.elapsed();

        if response.is_empty() {
            inner.requeue(kind, reservation.items);
            drop(inner);
            self.changed.notify_waiters();
            return Err(QueueError::EmptyDelivery(id));
        }

        let outcome = match (&reservation.items, response) {
            (TaskItems::Headers { from, count }, SyncResponse::BlockHeaders(headers)) => {
                Self::check_headers(&inner.anchors, *from, *count, &headers).map(|()| {
                    inner.header_done.insert(*from, (*peer, headers));
                    (*count as usize, Vec::new())
                })
            }
            (TaskItems::Blocks(numbers), SyncResponse::BlockBodies(bodies)) => {
                self.fill_bodies(&mut inner, numbers, bodies)
            }
            (TaskItems::Blocks(numbers), SyncResponse::Receipts(receipts)) => {
                Self::fill_receipts(&mut inner, numbers, receipts)
            }
            (TaskItems::Nodes(hashes), SyncResponse::NodeData(nodes)) => {
                Self::fill_nodes(&mut inner, hashes, nodes)
            }
            (_, response) => Err(QueueError::InvalidData(format!(
                "{} response to a {kind} request",
                response.kind()
            ))),
        };

        let result = match outcome {
            Ok((accepted, unfilled)) => {
                if !unfilled.is_empty() {
                    inner.requeue(kind, Self::remaining(&reservation.items, unfilled));
                }
                Ok(Delivery {
                    kind,
                    accepted,
                    elapsed,
                })
            }
            Err(err) => {
                if matches!(err, QueueError::InvalidData(_)) {
                    warn!(peer = %peer, %kind, id, %err, "Rejected delivery");
                }
                inner.requeue(kind, reservation.items);
                Err(err)
            }
        };
        drop(inner);
        self.changed.notify_waiters();
        if result.is_ok() {
            self.ready.notify_waiters();
        }
        result
    }

    fn remaining(items: &TaskItems, unfilled: Vec<usize>) -> TaskItems {
        match items {
            TaskItems::Blocks(numbers) => {
                TaskItems::Blocks(unfilled.into_iter().filter_map(|i| numbers.get(i).copied()).collect())
            }
            TaskItems::Nodes(hashes) => {
                TaskItems::Nodes(unfilled.into_iter().filter_map(|i| hashes.get(i).copied()).collect())
            }
            TaskItems::Headers { .. } => items.clone(),
        }
    }

    fn check_headers(
        anchors: &BTreeMap<u64, Hash>,
        from: u64,
        count: u64,
        headers: &[Header],
    ) -> Result<(), QueueError> {
        if headers.len() as u64 != count {
            return Err(QueueError::InvalidData(format!(
                "expected {count} headers from #{from}, got {}",
                headers.len()
            )));
        }
        let (Some(first), Some(last)) = (headers.first(), headers.last()) else {
            return Ok(());
        };
        if let Some(parent) = from.checked_sub(1).and_then(|number| anchors.get(&number)) {
            if first.parent_hash != *parent {
                return Err(QueueError::InvalidData(format!(
                    "header #{from} does not extend the anchored chain"
                )));
            }
        }
        if let Some(anchor) = anchors.get(&last.number) {
            if last.hash() != *anchor {
                return Err(QueueError::InvalidData(format!(
                    "header #{} does not match the anchored chain",
                    last.number
                )));
            }
        }
        for (offset, header) in headers.iter().enumerate() {
            let expected = from + offset as u64;
            if header.number != expected {
                return Err(QueueError::InvalidData(format!(
                    "header #{} delivered in place of #{expected}",
                    header.number
                )));
            }
            if offset > 0 && header.parent_hash != headers[offset - 1].hash() {
                return Err(QueueError::InvalidData(format!(
                    "header #{expected} does not link to its predecessor"
                )));
            }
        }
        Ok(())
    }

    /// Returns the accepted count and the indices of requested items that
    /// were not delivered.
    fn fill_bodies(
        &self,
        inner: &mut QueueInner,
        numbers: &[u64],
        bodies: Vec<Body>,
    ) -> Result<(usize, Vec<usize>), QueueError> {
        if bodies.len() > numbers.len() {
            return Err(QueueError::InvalidData(format!(
                "{} bodies for {} requested blocks",
                bodies.len(),
                numbers.len()
            )));
        }
        for (number, body) in numbers.iter().zip(&bodies) {
            let header = inner
                .result(*number)
                .map(|result| result.header.clone())
                .ok_or_else(|| QueueError::InvalidData(format!("no slot for block #{number}")))?;
            if !body.matches(&header) {
                return Err(QueueError::InvalidData(format!(
                    "body does not match header #{number}"
                )));
            }
            self.engine
                .verify_uncles(&Block::new(header, body.clone()))
                .map_err(|err| QueueError::InvalidData(format!("block #{number}: {err}")))?;
        }
        let accepted = bodies.len();
        for (number, body) in numbers.iter().zip(bodies) {
            if let Some(result) = inner.result_mut(*number) {
                result.body = Some(body);
            }
        }
        Ok((accepted, (accepted..numbers.len()).collect()))
    }

    fn fill_receipts(
        inner: &mut QueueInner,
        numbers: &[u64],
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<(usize, Vec<usize>), QueueError> {
        if receipts.len() > numbers.len() {
            return Err(QueueError::InvalidData(format!(
                "{} receipt lists for {} requested blocks",
                receipts.len(),
                numbers.len()
            )));
        }
        for (number, block_receipts) in numbers.iter().zip(&receipts) {
            let expected = inner
                .result(*number)
                .map(|result| result.header.receipt_root)
                .ok_or_else(|| QueueError::InvalidData(format!("no slot for block #{number}")))?;
            if receipts_root(block_receipts) != expected {
                return Err(QueueError::InvalidData(format!(
                    "receipts do not match header #{number}"
                )));
            }
        }
        let accepted = receipts.len();
        for (number, block_receipts) in numbers.iter().zip(receipts) {
            if let Some(result) = inner.result_mut(*number) {
                result.receipts = Some(block_receipts);
            }
        }
        Ok((accepted, (accepted..numbers.len()).collect()))
    }

    fn fill_nodes(
        inner: &mut QueueInner,
        hashes: &[Hash],
        nodes: Vec<containers::Bytes>,
    ) -> Result<(usize, Vec<usize>), QueueError> {
        let requested: HashSet<Hash> = hashes.iter().copied().collect();
        let mut delivered = HashSet::new();
        for node in &nodes {
            let hash = keccak256(node);
            if !requested.contains(&hash) {
                return Err(QueueError::InvalidData(format!(
                    "node {hash} was not requested"
                )));
            }
            delivered.insert(hash);
        }

        let Some(state) = inner.state.as_mut() else {
            return Err(QueueError::InvalidData("no state download running".into()));
        };
        for node in nodes {
            match state.process(node) {
                Ok(_) | Err(StateSyncError::Unrequested(_)) => {}
                Err(StateSyncError::Undecodable(hash)) => {
                    return Err(QueueError::InvalidData(format!("node {hash} is malformed")));
                }
                Err(StateSyncError::Storage(err)) => return Err(QueueError::Storage(err)),
            }
        }
        let unfilled = hashes
            .iter()
            .enumerate()
            .filter(|(_, hash)| !delivered.contains(*hash))
            .map(|(index, _)| index)
            .collect();
        Ok((delivered.len(), unfilled))
    }

    /// Take back every reservation whose deadline has passed.
    pub fn expire(&self, now: Instant) -> Vec<Reservation> {
        let mut inner = self.inner.lock();
        let expired: Vec<RequestId> = inner
            .reservations
            .values()
            .filter(|reservation| reservation.deadline <= now)
            .map(|reservation| reservation.id)
            .collect();
        let mut lapsed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(reservation) = inner.reservations.remove(&id) {
                inner.requeue(reservation.kind, reservation.items.clone());
                lapsed.push(reservation);
            }
        }
        drop(inner);
        if !lapsed.is_empty() {
            self.changed.notify_waiters();
        }
        lapsed
    }

    /// Take back one reservation whose request failed before its deadline.
    pub fn expire_request(&self, id: RequestId) -> Option<Reservation> {
        let mut inner = self.inner.lock();
        let reservation = inner.reservations.remove(&id)?;
        inner.requeue(reservation.kind, reservation.items.clone());
        drop(inner);
        self.changed.notify_waiters();
        Some(reservation)
    }

    /// Take back everything reserved to `peer` without counting it against
    /// the peer.
    pub fn revoke(&self, peer: &PeerId) -> Vec<Reservation> {
        let mut inner = self.inner.lock();
        let ids: Vec<RequestId> = inner
            .reservations
            .values()
            .filter(|reservation| reservation.peer == *peer)
            .map(|reservation| reservation.id)
            .collect();
        let mut revoked = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(reservation) = inner.reservations.remove(&id) {
                inner.requeue(reservation.kind, reservation.items.clone());
                revoked.push(reservation);
            }
        }
        drop(inner);
        if !revoked.is_empty() {
            debug!(peer = %peer, count = revoked.len(), "Revoked reservations");
            self.changed.notify_waiters();
        }
        revoked
    }

    /// Release the next header batch in sequence, if it has been delivered.
    pub fn next_header_batch(&self) -> Option<HeaderBatch> {
        let mut inner = self.inner.lock();
        let from = inner.header_next;
        let (supplier, headers) = inner.header_done.remove(&from)?;
        Some(HeaderBatch {
            from,
            headers,
            supplier,
        })
    }

    /// Return a batch that failed verification to the backlog.
    pub fn reject_headers(&self, batch: HeaderBatch) {
        self.inner
            .lock()
            .header_pending
            .insert(batch.from, batch.headers.len() as u64);
        self.changed.notify_waiters();
    }

    /// Accept a verified header batch. In modes that download block data
    /// this creates result slots, waiting for the importer to free space
    /// first.
    pub async fn accept_headers(
        &self,
        batch: &HeaderBatch,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let count = batch.headers.len();
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            if self.try_accept_headers(batch, count) {
                self.changed.notify_waiters();
                self.ready.notify_waiters();
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = &mut space => {}
            }
        }
    }

    fn try_accept_headers(&self, batch: &HeaderBatch, count: usize) -> bool {
        let mut inner = self.inner.lock();
        let Some(mode) = inner.mode else {
            return true;
        };
        if mode == SyncMode::LightLegacy {
            inner.header_next = batch.from + count as u64;
            return true;
        }
        if !inner.results.is_empty() && inner.results.len() + count > self.config.max_queued_blocks {
            return false;
        }

        for header in &batch.headers {
            let number = header.number;
            let needs_body = !header.has_empty_body();
            let needs_receipts = mode == SyncMode::Fast
                && inner.pivot.is_some_and(|pivot| number <= pivot)
                && !header.has_empty_receipts();
            if needs_body {
                inner.block_pending[0].insert(number);
            }
            if needs_receipts {
                inner.block_pending[1].insert(number);
            }
            if inner.pivot == Some(number) {
                debug!(number, root = %header.state_root, "Starting state download at pivot");
                inner.state = Some(StateSync::new(header.state_root, self.store.clone()));
            }
            inner
                .results
                .push_back(FetchResult::new(header.clone(), needs_body, needs_receipts));
        }
        inner.header_next = batch.from + count as u64;
        true
    }

    /// Take up to `max` complete results from the front of the queue.
    ///
    /// The fast sync pivot is held back until its state is downloaded.
    pub fn results(&self, max: usize) -> Vec<FetchResult> {
        let mut inner = self.inner.lock();
        let mut taken = Vec::new();
        while taken.len() < max {
            let Some(front) = inner.results.front() else {
                break;
            };
            if !front.is_complete() {
                break;
            }
            if inner.pivot == Some(front.number()) && !inner.state_done() {
                break;
            }
            if let Some(result) = inner.results.pop_front() {
                taken.push(result);
            }
        }
        inner.result_offset += taken.len() as u64;
        drop(inner);
        if !taken.is_empty() {
            self.space.notify_waiters();
        }
        taken
    }

    pub fn headers_complete(&self) -> bool {
        self.inner.lock().headers_complete()
    }

    pub fn state_done(&self) -> bool {
        self.inner.lock().state_done()
    }

    /// Whether all work of `kind` for this session is done.
    pub fn is_finished(&self, kind: RequestKind) -> bool {
        let inner = self.inner.lock();
        match kind {
            RequestKind::Headers => inner.headers_complete(),
            RequestKind::Bodies | RequestKind::Receipts => {
                let Some(slot) = data_slot(kind) else {
                    return true;
                };
                inner.headers_complete()
                    && inner.block_pending[slot].is_empty()
                    && !inner.has_reservations(kind)
            }
            RequestKind::NodeData => inner.state_done(),
            RequestKind::Odr => true,
        }
    }

    /// Every header is accepted and every result handed to the importer.
    pub fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.headers_complete() && inner.results.is_empty()
    }

    pub fn pending(&self, kind: RequestKind) -> usize {
        let inner = self.inner.lock();
        match kind {
            RequestKind::Headers => inner.header_pending.len(),
            RequestKind::Bodies => inner.block_pending[0].len(),
            RequestKind::Receipts => inner.block_pending[1].len(),
            RequestKind::NodeData => inner.state.as_ref().map_or(0, StateSync::pending),
            RequestKind::Odr => 0,
        }
    }

    pub fn in_flight(&self, kind: RequestKind) -> usize {
        self.inner
            .lock()
            .reservations
            .values()
            .filter(|reservation| reservation.kind == kind)
            .count()
    }

    pub fn reservation(&self, id: RequestId) -> Option<Reservation> {
        self.inner.lock().reservations.get(&id).cloned()
    }

    /// State nodes pulled and known so far.
    pub fn state_progress(&self) -> (u64, u64) {
        self.inner
            .lock()
            .state
            .as_ref()
            .map_or((0, 0), |state| (state.pulled(), state.known()))
    }

    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    pub fn ready(&self) -> Notified<'_> {
        self.ready.notified()
    }
}
