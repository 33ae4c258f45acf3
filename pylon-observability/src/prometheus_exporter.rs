use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Prometheus-compatible view of the gateway's request metrics.
///
/// The JSON snapshot from [`crate::metrics::MetricsAggregator`] is the
/// primary surface; this registry exists for scrape compatibility with
/// existing dashboards.
pub struct PrometheusExporter {
    registry: Registry,

    /// Total HTTP requests by route, method, status
    pub http_requests_total: IntCounterVec,

    /// Request latency histogram by route
    pub http_request_duration: HistogramVec,

    /// Active connections gauge
    pub active_connections: IntGauge,

    /// Upstream response time histogram
    pub upstream_latency: HistogramVec,

    /// Circuit breaker transitions by upstream and new state
    pub circuit_transitions: IntCounterVec,

    /// Response cache hits/misses
    pub cache_events: IntCounterVec,
}

impl PrometheusExporter {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("pylon_http_requests_total", "Total HTTP requests"),
            &["route", "method", "status"],
        )?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new("pylon_http_request_duration_seconds", "Request latency")
                .buckets(vec![
                    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ]),
            &["route"],
        )?;

        let active_connections =
            IntGauge::new("pylon_active_connections", "Number of active connections")?;

        let upstream_latency = HistogramVec::new(
            HistogramOpts::new("pylon_upstream_latency_seconds", "Upstream response time")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["upstream"],
        )?;

        let circuit_transitions = IntCounterVec::new(
            Opts::new(
                "pylon_circuit_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["upstream", "state"],
        )?;

        let cache_events = IntCounterVec::new(
            Opts::new("pylon_cache_events_total", "Response cache lookups"),
            &["outcome"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(circuit_transitions.clone()))?;
        registry.register(Box::new(cache_events.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration,
            active_connections,
            upstream_latency,
            circuit_transitions,
            cache_events,
        })
    }

    /// Record a completed HTTP request.
    pub fn record_request(&self, route: &str, method: &str, status: u16, duration_secs: f64) {
        let mut status_buf = itoa::Buffer::new();
        self.http_requests_total
            .with_label_values(&[route, method, status_buf.format(status)])
            .inc();
        self.http_request_duration
            .with_label_values(&[route])
            .observe(duration_secs);
    }

    /// Prometheus text exposition.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new().expect("Failed to create prometheus exporter")
    }
}
