//! Prometheus metrics for the proxy, exposed over an HTTP endpoint.

pub mod audit;
mod percentile;

pub use percentile::{ExecTimeRecord, PercentileSnapshot, SqlResponseRegistry, SQL_EXEC_TIME_SIZE};

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Proxy metrics collection. Label sets follow the
/// `(cluster, namespace, …)` convention throughout.
pub struct Metrics {
    pub registry: Registry,

    // Session / connection metrics
    pub session_counts: IntGaugeVec,
    pub flow_counts: IntCounterVec,

    // Session-side SQL metrics
    pub sql_timings: HistogramVec,
    pub sql_error_counts: IntCounterVec,
    pub sql_fingerprint_slow_counts: IntCounterVec,
    pub sql_fingerprint_error_counts: IntCounterVec,
    pub sql_forbidden_counts: IntCounterVec,

    // Backend-side SQL metrics
    pub backend_sql_timings: HistogramVec,
    pub backend_sql_error_counts: IntCounterVec,
    pub backend_sql_fingerprint_slow_counts: IntCounterVec,
    pub backend_sql_fingerprint_error_counts: IntCounterVec,

    // Backend pool gauges, per (namespace, slice, addr, role)
    pub pool_idle_counts: IntGaugeVec,
    pub pool_in_use_counts: IntGaugeVec,
    pub pool_wait_counts: IntGaugeVec,
    pub pool_active_counts: IntGaugeVec,
    pub pool_capacity_counts: IntGaugeVec,
    pub instance_down_counts: IntGaugeVec,

    // Backend latency percentiles, per (namespace, addr)
    pub backend_response_p99_max: IntGaugeVec,
    pub backend_response_p99_avg: IntGaugeVec,
    pub backend_response_p95_max: IntGaugeVec,
    pub backend_response_p95_avg: IntGaugeVec,

    pub uptime_counts: IntGaugeVec,
}

const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let session_counts = IntGaugeVec::new(
            Opts::new("minerva_session_counts", "Current client sessions"),
            &["cluster", "namespace"],
        )
        .unwrap();

        let flow_counts = IntCounterVec::new(
            Opts::new("minerva_flow_bytes_total", "Bytes transferred by direction"),
            &["cluster", "namespace", "direction"],
        )
        .unwrap();

        let sql_timings = HistogramVec::new(
            HistogramOpts::new("minerva_sql_duration_seconds", "Session SQL latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["cluster", "namespace", "operation"],
        )
        .unwrap();

        let sql_error_counts = IntCounterVec::new(
            Opts::new("minerva_sql_errors_total", "Session SQL errors"),
            &["cluster", "namespace", "operation"],
        )
        .unwrap();

        let sql_fingerprint_slow_counts = IntCounterVec::new(
            Opts::new(
                "minerva_sql_fingerprint_slow_total",
                "Slow SQL occurrences by fingerprint",
            ),
            &["cluster", "namespace", "fingerprint"],
        )
        .unwrap();

        let sql_fingerprint_error_counts = IntCounterVec::new(
            Opts::new(
                "minerva_sql_fingerprint_errors_total",
                "SQL errors by fingerprint",
            ),
            &["cluster", "namespace", "fingerprint"],
        )
        .unwrap();

        let sql_forbidden_counts = IntCounterVec::new(
            Opts::new(
                "minerva_sql_forbidden_total",
                "Statements rejected by the blacklist",
            ),
            &["cluster", "namespace", "fingerprint"],
        )
        .unwrap();

        let backend_sql_timings = HistogramVec::new(
            HistogramOpts::new(
                "minerva_backend_sql_duration_seconds",
                "Backend SQL latency",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["cluster", "namespace", "operation"],
        )
        .unwrap();

        let backend_sql_error_counts = IntCounterVec::new(
            Opts::new("minerva_backend_sql_errors_total", "Backend SQL errors"),
            &["cluster", "namespace", "operation"],
        )
        .unwrap();

        let backend_sql_fingerprint_slow_counts = IntCounterVec::new(
            Opts::new(
                "minerva_backend_sql_fingerprint_slow_total",
                "Backend slow SQL occurrences by fingerprint",
            ),
            &["cluster", "namespace", "fingerprint"],
        )
        .unwrap();

        let backend_sql_fingerprint_error_counts = IntCounterVec::new(
            Opts::new(
                "minerva_backend_sql_fingerprint_errors_total",
                "Backend SQL errors by fingerprint",
            ),
            &["cluster", "namespace", "fingerprint"],
        )
        .unwrap();

        let pool_labels: &[&str] = &["cluster", "namespace", "slice", "addr", "role"];

        let pool_idle_counts = IntGaugeVec::new(
            Opts::new("minerva_pool_idle", "Idle backend connections"),
            pool_labels,
        )
        .unwrap();
        let pool_in_use_counts = IntGaugeVec::new(
            Opts::new("minerva_pool_in_use", "Checked-out backend connections"),
            pool_labels,
        )
        .unwrap();
        let pool_wait_counts = IntGaugeVec::new(
            Opts::new("minerva_pool_wait", "Waiters on backend pools"),
            pool_labels,
        )
        .unwrap();
        let pool_active_counts = IntGaugeVec::new(
            Opts::new("minerva_pool_active", "Live backend connections"),
            pool_labels,
        )
        .unwrap();
        let pool_capacity_counts = IntGaugeVec::new(
            Opts::new("minerva_pool_capacity", "Backend pool capacity"),
            pool_labels,
        )
        .unwrap();
        let instance_down_counts = IntGaugeVec::new(
            Opts::new("minerva_instance_down", "Backend instances marked down"),
            pool_labels,
        )
        .unwrap();

        let percentile_labels: &[&str] = &["cluster", "namespace", "addr"];
        let backend_response_p99_max = IntGaugeVec::new(
            Opts::new("minerva_backend_response_p99_max_us", "Backend P99 max latency"),
            percentile_labels,
        )
        .unwrap();
        let backend_response_p99_avg = IntGaugeVec::new(
            Opts::new("minerva_backend_response_p99_avg_us", "Backend P99 avg latency"),
            percentile_labels,
        )
        .unwrap();
        let backend_response_p95_max = IntGaugeVec::new(
            Opts::new("minerva_backend_response_p95_max_us", "Backend P95 max latency"),
            percentile_labels,
        )
        .unwrap();
        let backend_response_p95_avg = IntGaugeVec::new(
            Opts::new("minerva_backend_response_p95_avg_us", "Backend P95 avg latency"),
            percentile_labels,
        )
        .unwrap();

        let uptime_counts = IntGaugeVec::new(
            Opts::new("minerva_uptime_seconds", "Seconds since startup"),
            &["cluster"],
        )
        .unwrap();

        for collector in [
            Box::new(session_counts.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(flow_counts.clone()),
            Box::new(sql_timings.clone()),
            Box::new(sql_error_counts.clone()),
            Box::new(sql_fingerprint_slow_counts.clone()),
            Box::new(sql_fingerprint_error_counts.clone()),
            Box::new(sql_forbidden_counts.clone()),
            Box::new(backend_sql_timings.clone()),
            Box::new(backend_sql_error_counts.clone()),
            Box::new(backend_sql_fingerprint_slow_counts.clone()),
            Box::new(backend_sql_fingerprint_error_counts.clone()),
            Box::new(pool_idle_counts.clone()),
            Box::new(pool_in_use_counts.clone()),
            Box::new(pool_wait_counts.clone()),
            Box::new(pool_active_counts.clone()),
            Box::new(pool_capacity_counts.clone()),
            Box::new(instance_down_counts.clone()),
            Box::new(backend_response_p99_max.clone()),
            Box::new(backend_response_p99_avg.clone()),
            Box::new(backend_response_p95_max.clone()),
            Box::new(backend_response_p95_avg.clone()),
            Box::new(uptime_counts.clone()),
        ] {
            registry.register(collector).unwrap();
        }

        Self {
            registry,
            session_counts,
            flow_counts,
            sql_timings,
            sql_error_counts,
            sql_fingerprint_slow_counts,
            sql_fingerprint_error_counts,
            sql_forbidden_counts,
            backend_sql_timings,
            backend_sql_error_counts,
            backend_sql_fingerprint_slow_counts,
            backend_sql_fingerprint_error_counts,
            pool_idle_counts,
            pool_in_use_counts,
            pool_wait_counts,
            pool_active_counts,
            pool_capacity_counts,
            instance_down_counts,
            backend_response_p99_max,
            backend_response_p99_avg,
            backend_response_p95_max,
            backend_response_p95_avg,
            uptime_counts,
        }
    }

    pub fn incr_session_count(&self, cluster: &str, namespace: &str) {
        self.session_counts
            .with_label_values(&[cluster, namespace])
            .inc();
    }

    pub fn decr_session_count(&self, cluster: &str, namespace: &str) {
        self.session_counts
            .with_label_values(&[cluster, namespace])
            .dec();
    }

    pub fn add_read_flow(&self, cluster: &str, namespace: &str, bytes: u64) {
        self.flow_counts
            .with_label_values(&[cluster, namespace, "read"])
            .inc_by(bytes);
    }

    pub fn add_write_flow(&self, cluster: &str, namespace: &str, bytes: u64) {
        self.flow_counts
            .with_label_values(&[cluster, namespace, "write"])
            .inc_by(bytes);
    }

    pub fn record_sql_timing(
        &self,
        cluster: &str,
        namespace: &str,
        operation: &str,
        seconds: f64,
    ) {
        self.sql_timings
            .with_label_values(&[cluster, namespace, operation])
            .observe(seconds);
    }

    pub fn record_sql_error(&self, cluster: &str, namespace: &str, operation: &str, md5: &str) {
        self.sql_error_counts
            .with_label_values(&[cluster, namespace, operation])
            .inc();
        self.sql_fingerprint_error_counts
            .with_label_values(&[cluster, namespace, md5])
            .inc();
    }

    pub fn record_slow_sql_fingerprint(&self, cluster: &str, namespace: &str, md5: &str) {
        self.sql_fingerprint_slow_counts
            .with_label_values(&[cluster, namespace, md5])
            .inc();
    }

    pub fn record_sql_forbidden(&self, cluster: &str, namespace: &str, md5: &str) {
        self.sql_forbidden_counts
            .with_label_values(&[cluster, namespace, md5])
            .inc();
    }

    pub fn record_backend_sql_timing(
        &self,
        cluster: &str,
        namespace: &str,
        operation: &str,
        seconds: f64,
    ) {
        self.backend_sql_timings
            .with_label_values(&[cluster, namespace, operation])
            .observe(seconds);
    }

    pub fn record_backend_sql_error(
        &self,
        cluster: &str,
        namespace: &str,
        operation: &str,
        md5: &str,
    ) {
        self.backend_sql_error_counts
            .with_label_values(&[cluster, namespace, operation])
            .inc();
        self.backend_sql_fingerprint_error_counts
            .with_label_values(&[cluster, namespace, md5])
            .inc();
    }

    pub fn record_backend_slow_sql_fingerprint(&self, cluster: &str, namespace: &str, md5: &str) {
        self.backend_sql_fingerprint_slow_counts
            .with_label_values(&[cluster, namespace, md5])
            .inc();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_pool_gauges(
        &self,
        cluster: &str,
        namespace: &str,
        slice: &str,
        addr: &str,
        role: &str,
        stats: crate::backend::PoolStats,
        up: bool,
    ) {
        let labels = &[cluster, namespace, slice, addr, role];
        self.pool_idle_counts.with_label_values(labels).set(stats.idle);
        self.pool_in_use_counts
            .with_label_values(labels)
            .set(stats.in_use);
        self.pool_wait_counts.with_label_values(labels).set(stats.wait);
        self.pool_active_counts
            .with_label_values(labels)
            .set(stats.active);
        self.pool_capacity_counts
            .with_label_values(labels)
            .set(stats.capacity);
        self.instance_down_counts
            .with_label_values(labels)
            .set(if up { 0 } else { 1 });
    }

    pub fn set_backend_percentiles(
        &self,
        cluster: &str,
        namespace: &str,
        addr: &str,
        p99_max: i64,
        p99_avg: i64,
        p95_max: i64,
        p95_avg: i64,
    ) {
        let labels = &[cluster, namespace, addr];
        self.backend_response_p99_max
            .with_label_values(labels)
            .set(p99_max);
        self.backend_response_p99_avg
            .with_label_values(labels)
            .set(p99_avg);
        self.backend_response_p95_max
            .with_label_values(labels)
            .set(p95_max);
        self.backend_response_p95_avg
            .with_label_values(labels)
            .set(p95_avg);
    }

    pub fn set_uptime(&self, cluster: &str, seconds: i64) {
        self.uptime_counts.with_label_values(&[cluster]).set(seconds);
    }

    /// Metrics in Prometheus text format
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
        match req.uri().path() {
            "/metrics" => {
                let body = metrics().gather();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            "/health" => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK")))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found")))
                .unwrap()),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "metrics server connection error");
            }
        });
    }
}
