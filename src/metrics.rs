//! Prometheus instruments
//!
//! One registry per process, scraped in text format at `/metrics`. The
//! request duration buckets concentrate on the hot path (1-50 ms).

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// Process-wide metrics registry and instruments
pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub version_conflicts_total: IntCounter,
    pub rate_limited_total: IntCounterVec,
    pub ws_observers: IntGauge,
    pub ws_messages_total: IntCounterVec,
    pub audit_queue_depth: IntGaugeVec,
    pub audit_jobs_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("turnsync_requests_total", "Requests by operation and status"),
            &["operation", "status"],
        )
        .expect("requests_total opts");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "turnsync_request_duration_seconds",
                "Request latency by operation",
            )
            .buckets(vec![
                0.001, 0.002, 0.003, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ]),
            &["operation"],
        )
        .expect("request_duration opts");

        let version_conflicts_total = IntCounter::new(
            "turnsync_version_conflicts_total",
            "Optimistic version conflicts observed by the engine",
        )
        .expect("version_conflicts opts");

        let rate_limited_total = IntCounterVec::new(
            Opts::new("turnsync_rate_limited_total", "Rejected requests by limiter scope"),
            &["scope"],
        )
        .expect("rate_limited opts");

        let ws_observers = IntGauge::new(
            "turnsync_ws_observers",
            "Currently connected push observers on this instance",
        )
        .expect("ws_observers opts");

        let ws_messages_total = IntCounterVec::new(
            Opts::new("turnsync_ws_messages_total", "Push messages sent by type"),
            &["type"],
        )
        .expect("ws_messages opts");

        let audit_queue_depth = IntGaugeVec::new(
            Opts::new("turnsync_audit_queue_depth", "Audit queue depth by state"),
            &["state"],
        )
        .expect("audit_queue_depth opts");

        let audit_jobs_total = IntCounterVec::new(
            Opts::new("turnsync_audit_jobs_total", "Audit jobs by terminal outcome"),
            &["outcome"],
        )
        .expect("audit_jobs opts");

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_duration_seconds.clone()),
            Box::new(version_conflicts_total.clone()),
            Box::new(rate_limited_total.clone()),
            Box::new(ws_observers.clone()),
            Box::new(ws_messages_total.clone()),
            Box::new(audit_queue_depth.clone()),
            Box::new(audit_jobs_total.clone()),
        ] {
            registry.register(collector).expect("register collector");
        }

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            version_conflicts_total,
            rate_limited_total,
            ws_observers,
            ws_messages_total,
            audit_queue_depth,
            audit_jobs_total,
        }
    }

    /// Render the scrape body in Prometheus text format
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!(error = %e, "metrics encode failed");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
