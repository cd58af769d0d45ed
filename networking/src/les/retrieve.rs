use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use libp2p_identity::PeerId;
use metrics::{Metrics, SharedMetrics};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::LesConfig;
use super::error::RetrieveError;
use super::request::OdrRequest;
use super::server_pool::ServerPool;
use crate::distributor::{DistributeError, RequestDistributor};
use crate::peer_set::{PeerInfo, PeerSet};
use crate::transport::LesNetwork;
use crate::types::{LesResponse, RequestIds, RequestKind};

const METRICS_KIND: &str = "odr";

enum Failure {
    Network(anyhow::Error),
    Timeout,
}

struct Answer {
    peer: PeerId,
    elapsed: std::time::Duration,
    result: Result<LesResponse, Failure>,
}

/// Peers holding a request of the current retrieval. Whatever is still held
/// when the retrieval ends, for any reason, is handed back to the
/// distributor.
struct Outstanding<'a> {
    distributor: &'a RequestDistributor,
    peers: HashSet<PeerId>,
}

impl<'a> Outstanding<'a> {
    fn new(distributor: &'a RequestDistributor) -> Self {
        Self {
            distributor,
            peers: HashSet::new(),
        }
    }

    fn hold(&mut self, peer: PeerId) {
        self.peers.insert(peer);
    }

    fn release(&mut self, peer: &PeerId) {
        if self.peers.remove(peer) {
            self.distributor.release(peer, RequestKind::Odr);
        }
    }
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        for peer in self.peers.drain() {
            self.distributor.release(&peer, RequestKind::Odr);
        }
    }
}

/// Sends on-demand requests to light servers until one answers with data
/// that passes the request's own validation.
///
/// A peer that answers with invalid data is dropped and never asked again
/// by the same retrieval. If the first peer is slow, further peers are asked
/// in parallel and the first valid answer wins.
pub struct RetrieveManager<N: LesNetwork> {
    config: LesConfig,
    network: Arc<N>,
    distributor: RequestDistributor,
    ids: RequestIds,
    pool: Option<Arc<ServerPool>>,
    metrics: Option<SharedMetrics>,
}

impl<N: LesNetwork> RetrieveManager<N> {
    pub fn new(config: LesConfig, network: Arc<N>, peers: Arc<PeerSet>) -> Self {
        Self {
            config,
            network,
            distributor: RequestDistributor::new(peers),
            ids: RequestIds::new(),
            pool: None,
            metrics: None,
        }
    }

    pub fn with_server_pool(mut self, pool: Arc<ServerPool>) -> Self {
        self.pool = Some(pool);
        self
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

    fn pool<F: FnOnce(&ServerPool)>(&self, f: F) {
        if let Some(pool) = &self.pool {
            f(pool);
        }
    }

    pub fn config(&self) -> &LesConfig {
        &self.config
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        self.distributor.peers()
    }

    pub async fn retrieve<R: OdrRequest>(
        &self,
        request: &R,
        cancel: &CancellationToken,
    ) -> Result<R::Output, RetrieveError> {
        let kind = request.kind();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetrieveError::Cancelled),
            result = tokio::time::timeout(self.config.retrieve_timeout(), self.run(request, cancel)) => {
                result.unwrap_or(Err(RetrieveError::Timeout))
            }
        };
        match &result {
            Ok(_) => self.record(|m| m.inc_odr(kind, "success")),
            Err(err) => {
                debug!(kind, %err, "Retrieval failed");
                self.record(|m| m.inc_odr(kind, "failure"));
            }
        }
        result
    }

    async fn run<R: OdrRequest>(
        &self,
        request: &R,
        cancel: &CancellationToken,
    ) -> Result<R::Output, RetrieveError> {
        let mut outstanding = Outstanding::new(&self.distributor);
        let mut asked: HashSet<PeerId> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();
        let eligible = |asked: &HashSet<PeerId>, peer: &PeerInfo| {
            !asked.contains(&peer.id) && request.can_serve(peer)
        };

        loop {
            if in_flight.is_empty() {
                if asked.len() >= self.config.max_attempts {
                    return Err(RetrieveError::RetrieveFailed {
                        attempts: asked.len(),
                    });
                }
                let peer = match self
                    .distributor
                    .distribute(
                        RequestKind::Odr,
                        |peer| eligible(&asked, peer),
                        self.config.distribute_timeout(),
                        cancel,
                    )
                    .await
                {
                    Ok(peer) => peer,
                    Err(DistributeError::Cancelled) => return Err(RetrieveError::Cancelled),
                    Err(DistributeError::NoPeer(_)) if asked.is_empty() => {
                        return Err(RetrieveError::NoPeer);
                    }
                    Err(DistributeError::NoPeer(_)) => {
                        return Err(RetrieveError::RetrieveFailed {
                            attempts: asked.len(),
                        });
                    }
                };
                outstanding.hold(peer.id);
                asked.insert(peer.id);
                in_flight.push(self.send(peer.id, request));
            }

            let can_widen =
                in_flight.len() < self.config.max_parallel && asked.len() < self.config.max_attempts;
            tokio::select! {
                Some(answer) = in_flight.next() => {
                    outstanding.release(&answer.peer);
                    if let Some(output) = self.handle_answer(request, answer) {
                        return Ok(output);
                    }
                }
                _ = sleep(self.config.soft_timeout()), if can_widen => {
                    if let Some(peer) = self
                        .distributor
                        .try_distribute(RequestKind::Odr, |peer| eligible(&asked, peer))
                    {
                        debug!(kind = request.kind(), peer = %peer.id, "Slow answer, asking another server");
                        outstanding.hold(peer.id);
                        asked.insert(peer.id);
                        in_flight.push(self.send(peer.id, request));
                    }
                }
            }
        }
    }

    fn send<R: OdrRequest>(&self, peer: PeerId, request: &R) -> BoxFuture<'static, Answer> {
        let network = self.network.clone();
        let timeout = self.config.hard_timeout();
        let id = self.ids.next();
        let wire = request.to_wire();
        debug!(peer = %peer, id, request = %wire, "Sending on-demand request");
        async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, network.request(peer, id, wire)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(err)) => Err(Failure::Network(err)),
                Err(_) => Err(Failure::Timeout),
            };
            Answer {
                peer,
                elapsed: started.elapsed(),
                result,
            }
        }
        .boxed()
    }

    fn handle_answer<R: OdrRequest>(&self, request: &R, answer: Answer) -> Option<R::Output> {
        let Answer {
            peer,
            elapsed,
            result,
        } = answer;
        let kind = request.kind();
        match result {
            Ok(response) => match request.validate(response) {
                Ok(output) => {
                    debug!(peer = %peer, kind, elapsed_ms = elapsed.as_millis() as u64, "Valid answer");
                    self.peers().update_rtt(&peer, elapsed);
                    self.pool(|pool| pool.record_success(&peer, elapsed));
                    self.record(|m| m.observe_request_time(METRICS_KIND, elapsed.as_secs_f64()));
                    Some(output)
                }
                Err(err) => {
                    warn!(peer = %peer, kind, %err, "Invalid answer, dropping server");
                    self.peers().mark_dropped(&peer);
                    self.network.disconnect(peer);
                    self.pool(|pool| pool.record_failure(&peer));
                    None
                }
            },
            Err(Failure::Network(err)) => {
                debug!(peer = %peer, kind, %err, "Request failed");
                self.pool(|pool| pool.record_failure(&peer));
                None
            }
            Err(Failure::Timeout) => {
                warn!(peer = %peer, kind, "Request timed out");
                self.pool(|pool| pool.record_failure(&peer));
                self.record(|m| m.inc_timeouts(METRICS_KIND));
                let timeouts = self.peers().record_timeout(&peer);
                if timeouts >= self.config.max_timeouts && self.peers().mark_dropped(&peer) {
                    warn!(peer = %peer, timeouts, "Too many timeouts, dropping server");
                    self.network.disconnect(peer);
                }
                None
            }
        }
    }
}
