pub mod server;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Item kinds tracked by the downloader counters.
pub const KIND_HEADERS: &str = "headers";
pub const KIND_BODIES: &str = "bodies";
pub const KIND_RECEIPTS: &str = "receipts";
pub const KIND_STATES: &str = "states";

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    peers: IntGauge,
    // Downloader
    current_block: IntGauge,
    highest_block: IntGauge,
    items_in: IntCounterVec,
    items_dropped: IntCounterVec,
    timeouts: IntCounterVec,
    request_time: HistogramVec,
    sync_sessions: IntCounterVec,
    // On-demand retrieval
    odr_requests: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let peers = IntGauge::with_opts(Opts::new(
            "sync_peers_connected",
            "Number of peers registered for synchronization",
        ))?;
        registry.register(Box::new(peers.clone()))?;

        let current_block = IntGauge::with_opts(Opts::new(
            "sync_current_block",
            "Number of the latest imported block",
        ))?;
        registry.register(Box::new(current_block.clone()))?;

        let highest_block = IntGauge::with_opts(Opts::new(
            "sync_highest_block",
            "Highest block number announced by the sync target",
        ))?;
        registry.register(Box::new(highest_block.clone()))?;

        let items_in = IntCounterVec::new(
            Opts::new("sync_items_in_total", "Total number of items accepted from peers"),
            &["kind"],
        )?;
        registry.register(Box::new(items_in.clone()))?;

        let items_dropped = IntCounterVec::new(
            Opts::new(
                "sync_items_dropped_total",
                "Total number of deliveries rejected as stale or invalid",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(items_dropped.clone()))?;

        let timeouts = IntCounterVec::new(
            Opts::new("sync_timeouts_total", "Total number of expired reservations"),
            &["kind"],
        )?;
        registry.register(Box::new(timeouts.clone()))?;

        let request_time = HistogramVec::new(
            HistogramOpts::new("sync_request_time_seconds", "Round trip time of sync requests")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["kind"],
        )?;
        registry.register(Box::new(request_time.clone()))?;

        let sync_sessions = IntCounterVec::new(
            Opts::new("sync_sessions_total", "Total number of sync sessions by outcome"),
            &["result"],
        )?;
        registry.register(Box::new(sync_sessions.clone()))?;

        let odr_requests = IntCounterVec::new(
            Opts::new("odr_requests_total", "Total number of on-demand retrievals by outcome"),
            &["kind", "result"],
        )?;
        registry.register(Box::new(odr_requests.clone()))?;

        Ok(Self {
            registry,
            peers,
            current_block,
            highest_block,
            items_in,
            items_dropped,
            timeouts,
            request_time,
            sync_sessions,
            odr_requests,
        })
    }

    pub fn gather(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(%err, "failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn set_peers(&self, v: i64) {
        self.peers.set(v);
    }

    // Downloader
    pub fn set_current_block(&self, v: u64) {
        self.current_block.set(v as i64);
    }

    pub fn set_highest_block(&self, v: u64) {
        self.highest_block.set(v as i64);
    }

    pub fn inc_items_in(&self, kind: &str, count: u64) {
        self.items_in.with_label_values(&[kind]).inc_by(count);
    }

    pub fn inc_items_dropped(&self, kind: &str, count: u64) {
        self.items_dropped.with_label_values(&[kind]).inc_by(count);
    }

    pub fn inc_timeouts(&self, kind: &str) {
        self.timeouts.with_label_values(&[kind]).inc();
    }

    pub fn observe_request_time(&self, kind: &str, duration: f64) {
        self.request_time.with_label_values(&[kind]).observe(duration);
    }

    pub fn inc_sync_session(&self, result: &str) {
        self.sync_sessions.with_label_values(&[result]).inc();
    }

    // On-demand retrieval
    pub fn inc_odr(&self, kind: &str, result: &str) {
        self.odr_requests.with_label_values(&[kind, result]).inc();
    }
}

pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_gather() {
        let metrics = Metrics::new().unwrap();
        metrics.inc_items_in(KIND_HEADERS, 192);
        metrics.inc_timeouts(KIND_BODIES);
        metrics.set_highest_block(150);
        metrics.inc_odr("receipts", "ok");

        let text = metrics.gather();
        assert!(text.contains("sync_items_in_total{kind=\"headers\"} 192"));
        assert!(text.contains("sync_timeouts_total{kind=\"bodies\"} 1"));
        assert!(text.contains("sync_highest_block 150"));
        assert!(text.contains("odr_requests_total{kind=\"receipts\",result=\"ok\"} 1"));
    }
}
