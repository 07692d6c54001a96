//! Prometheus metrics for the WebDAV ingest server.
//!
//! All metric types use atomics internally (no locks on the hot path).
//! The `Metrics` struct is `Clone`-cheap (Arc-based registry + Arc-based collectors).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder, TEXT_FORMAT,
};
use std::sync::Arc;
use std::time::Instant;

use crate::api::handlers::AppState;
use crate::dav::PutOutcome;
use crate::error::{DavResult, ErrorKind};
use crate::events::{EventListener, FileEvent};

/// All Prometheus metrics for the server.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // -- Process & Build --
    pub process_start_time_seconds: Gauge,
    pub build_info: GaugeVec,
    pub process_peak_rss_bytes: Gauge,

    // -- HTTP Requests --
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub http_request_size_bytes: HistogramVec,

    // -- Uploads --
    pub uploads_total: IntCounterVec,
    pub upload_bytes_total: IntCounter,
    pub chunks_stored_total: IntCounter,
    pub lock_conflicts_total: IntCounter,
    pub quota_rejections_total: IntCounter,
    pub locks_active: Gauge,

    // -- Events --
    pub file_events_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // -- Process & Build --
        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry
            .register(Box::new(process_start_time_seconds.clone()))
            .unwrap();

        let build_info = GaugeVec::new(
            Opts::new("webdav_ingest_build_info", "Build information"),
            &["version"],
        )
        .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();

        let process_peak_rss_bytes = Gauge::new(
            "process_peak_rss_bytes",
            "Peak resident set size in bytes (updated on scrape)",
        )
        .unwrap();
        registry
            .register(Box::new(process_peak_rss_bytes.clone()))
            .unwrap();

        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        // -- HTTP Requests --
        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "webdav_ingest_http_requests_total",
                "Total HTTP requests by method, status, and operation",
            ),
            &["method", "status", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_requests_total.clone()))
            .unwrap();

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "webdav_ingest_http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .unwrap();

        // [1KB, 10KB, 100KB, 1MB, 10MB, 100MB]
        let body_size_buckets = prometheus::exponential_buckets(1024.0, 10.0, 6).unwrap();
        let http_request_size_bytes = HistogramVec::new(
            HistogramOpts::new(
                "webdav_ingest_http_request_size_bytes",
                "HTTP request body size in bytes",
            )
            .buckets(body_size_buckets),
            &["method"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_size_bytes.clone()))
            .unwrap();

        // -- Uploads --
        let uploads_total = IntCounterVec::new(
            Opts::new("webdav_ingest_uploads_total", "PUT requests by outcome"),
            &["outcome"],
        )
        .unwrap();
        registry.register(Box::new(uploads_total.clone())).unwrap();

        let upload_bytes_total = IntCounter::new(
            "webdav_ingest_upload_bytes_total",
            "Bytes accepted from clients",
        )
        .unwrap();
        registry
            .register(Box::new(upload_bytes_total.clone()))
            .unwrap();

        let chunks_stored_total = IntCounter::new(
            "webdav_ingest_chunks_stored_total",
            "Chunks of chunked transfers received",
        )
        .unwrap();
        registry
            .register(Box::new(chunks_stored_total.clone()))
            .unwrap();

        let lock_conflicts_total = IntCounter::new(
            "webdav_ingest_lock_conflicts_total",
            "Requests rejected because the path was locked",
        )
        .unwrap();
        registry
            .register(Box::new(lock_conflicts_total.clone()))
            .unwrap();

        let quota_rejections_total = IntCounter::new(
            "webdav_ingest_quota_rejections_total",
            "Writes rejected for insufficient space",
        )
        .unwrap();
        registry
            .register(Box::new(quota_rejections_total.clone()))
            .unwrap();

        let locks_active = Gauge::new(
            "webdav_ingest_locks_active",
            "Paths currently locked (updated on scrape)",
        )
        .unwrap();
        registry.register(Box::new(locks_active.clone())).unwrap();

        // -- Events --
        let file_events_total = IntCounterVec::new(
            Opts::new("webdav_ingest_file_events_total", "File events by kind"),
            &["kind"],
        )
        .unwrap();
        registry
            .register(Box::new(file_events_total.clone()))
            .unwrap();

        Metrics {
            registry,
            process_start_time_seconds,
            build_info,
            process_peak_rss_bytes,
            http_requests_total,
            http_request_duration_seconds,
            http_request_size_bytes,
            uploads_total,
            upload_bytes_total,
            chunks_stored_total,
            lock_conflicts_total,
            quota_rejections_total,
            locks_active,
            file_events_total,
        }
    }

    /// Record the outcome of one PUT.
    pub fn record_put(&self, result: &DavResult<PutOutcome>, chunked: bool) {
        match result {
            Ok(outcome) => {
                let label = match (&outcome.etag, outcome.created) {
                    (None, _) => "partial",
                    (Some(_), true) => "created",
                    (Some(_), false) => "updated",
                };
                self.uploads_total.with_label_values(&[label]).inc();
                self.upload_bytes_total.inc_by(outcome.bytes_written);
                if chunked {
                    self.chunks_stored_total.inc();
                }
            }
            Err(e) => {
                self.uploads_total.with_label_values(&["failed"]).inc();
                self.record_error(e.kind());
            }
        }
    }

    /// Count errors that have a dedicated counter.
    pub fn record_error(&self, kind: ErrorKind) {
        match kind {
            ErrorKind::Locked => self.lock_conflicts_total.inc(),
            ErrorKind::QuotaExceeded => self.quota_rejections_total.inc(),
            _ => {}
        }
    }
}

/// Counts file events on the service's event bus.
pub struct MetricsListener(pub Metrics);

impl EventListener for MetricsListener {
    fn on_event(&self, event: &FileEvent) {
        self.0
            .file_events_total
            .with_label_values(&[event.kind.label()])
            .inc();
    }
}

/// Classify a request into a bounded operation label.
pub fn classify_dav_operation(method: &str, path: &str) -> &'static str {
    match path {
        "/health" => return "health",
        "/metrics" => return "metrics",
        _ => {}
    }
    if !path.starts_with("/remote.php/dav/files/") {
        return "unknown";
    }

    match method {
        "PUT" if path.contains("-chunking-") => "put_chunk",
        "PUT" => "put",
        "GET" => "get",
        "HEAD" => "head",
        "DELETE" => "delete",
        "MKCOL" => "mkcol",
        "MOVE" => "move",
        "COPY" => "copy",
        _ => "unknown",
    }
}

/// Axum middleware that records HTTP request metrics.
pub async fn http_metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => return next.run(request).await,
    };

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let operation = classify_dav_operation(&method, &path);

    if let Some(cl) = request
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
    {
        metrics
            .http_request_size_bytes
            .with_label_values(&[&method])
            .observe(cl);
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();
    metrics
        .http_requests_total
        .with_label_values(&[&method, &status, operation])
        .inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(&[&method, operation])
        .observe(duration);

    response
}

/// Handler for GET /metrics; returns Prometheus text format.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => {
            return (StatusCode::NOT_FOUND, "Metrics not enabled").into_response();
        }
    };

    metrics
        .process_peak_rss_bytes
        .set(crate::api::handlers::get_peak_rss_bytes() as f64);
    metrics
        .locks_active
        .set(state.service.locks().active_count() as f64);

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (StatusCode::OK, [("content-type", TEXT_FORMAT)], buffer).into_response()
}
