//! Prometheus metrics for the throttling listener
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::OnceLock;
use std::time::Duration;

use crate::limiter::LimitError;
use crate::listener::Limits;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Throttle metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Connection metrics
    /// Total connections accepted
    pub connections_total: IntCounter,
    /// Current open connections
    pub connections_active: IntGauge,
    /// Total connections closed
    pub connections_closed: IntCounter,

    // Traffic metrics
    /// Bytes moved through limited connections, by direction
    pub bytes_total: IntCounterVec,

    // Throttling metrics
    /// Time spent waiting for tokens, by limiter scope
    pub throttle_wait_seconds: HistogramVec,
    /// Token acquisitions that failed, by reason
    pub acquire_failures_total: IntCounterVec,
    /// Number of runtime limit changes
    pub limit_updates_total: IntCounter,
    /// Current limits in bytes/second, by scope
    pub limit_bytes_per_second: IntGaugeVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        // Connection metrics
        let connections_total = IntCounter::new(
            "throttle_connections_total",
            "Total number of connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "throttle_connections_active",
            "Current number of open limited connections",
        )
        .unwrap();

        let connections_closed = IntCounter::new(
            "throttle_connections_closed_total",
            "Total number of limited connections closed",
        )
        .unwrap();

        // Traffic metrics
        let bytes_total = IntCounterVec::new(
            Opts::new("throttle_bytes_total", "Total bytes through limited connections"),
            &["direction"], // read, write
        )
        .unwrap();

        // Throttling metrics
        let throttle_wait_seconds = HistogramVec::new(
            HistogramOpts::new(
                "throttle_wait_seconds",
                "Time spent waiting for tokens in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["scope"], // global, connection
        )
        .unwrap();

        let acquire_failures_total = IntCounterVec::new(
            Opts::new(
                "throttle_acquire_failures_total",
                "Total number of token acquisitions that failed",
            ),
            &["reason"], // cancelled, deadline, over_capacity, invalid_config
        )
        .unwrap();

        let limit_updates_total = IntCounter::new(
            "throttle_limit_updates_total",
            "Total number of runtime limit changes",
        )
        .unwrap();

        let limit_bytes_per_second = IntGaugeVec::new(
            Opts::new(
                "throttle_limit_bytes_per_second",
                "Configured limit in bytes per second",
            ),
            &["scope"], // global, connection
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_closed.clone()))
            .unwrap();
        registry.register(Box::new(bytes_total.clone())).unwrap();
        registry
            .register(Box::new(throttle_wait_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(acquire_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(limit_updates_total.clone()))
            .unwrap();
        registry
            .register(Box::new(limit_bytes_per_second.clone()))
            .unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            bytes_total,
            throttle_wait_seconds,
            acquire_failures_total,
            limit_updates_total,
            limit_bytes_per_second,
        }
    }

    /// Record a new connection
    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    /// Record bytes moved in one direction
    pub fn record_bytes(&self, direction: &str, n: usize) {
        self.bytes_total
            .with_label_values(&[direction])
            .inc_by(n as u64);
    }

    /// Record time spent waiting on one limiter
    pub fn record_throttle_wait(&self, scope: &str, wait: Duration) {
        self.throttle_wait_seconds
            .with_label_values(&[scope])
            .observe(wait.as_secs_f64());
    }

    /// Record a failed token acquisition
    pub fn record_acquire_failure(&self, error: &LimitError) {
        let reason = match error {
            LimitError::Cancelled => "cancelled",
            LimitError::DeadlineExceeded => "deadline",
            LimitError::OverCapacity { .. } => "over_capacity",
            LimitError::InvalidConfig { .. } => "invalid_config",
        };
        self.acquire_failures_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Publish the current limits
    pub fn set_limits(&self, limits: Limits) {
        self.limit_bytes_per_second
            .with_label_values(&["connection"])
            .set(limits.per_connection as i64);
        self.limit_bytes_per_second
            .with_label_values(&["global"])
            .set(limits.global as i64);
    }

    /// Record a runtime limit change
    pub fn record_limit_update(&self, limits: Limits) {
        self.limit_updates_total.inc();
        self.set_limits(limits);
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let (status, content_type, body) = match req.uri().path() {
            "/metrics" => (
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                metrics().gather(),
            ),
            "/health" => (StatusCode::OK, "text/plain", "OK".to_string()),
            _ => (StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
        };
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static(content_type),
        );
        Ok(response)
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
