// ============================================================================
// Prometheus Metrics Middleware
// ============================================================================
//
// 📊 OBSERVABILITY: scrape endpoint at GET /metrics.
//
// Collected:
// - prism_http_request_duration_seconds (histogram: method, path, status)
// - prism_http_requests_total           (counter:   method, path, status)
// - prism_auth_failures_total           (counter:   code)
// - prism_upstream_attempts_total       (counter:   driver, result)
// - prism_accounting_records_dropped_total
//
// ============================================================================

use axum::{extract::Request, middleware::Next, response::Response};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec, Encoder,
    HistogramVec, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    pub static ref HTTP_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "prism_http_request_duration_seconds",
        "HTTP request latency in seconds",
        &["method", "path", "status"],
        vec![0.005, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 300.0]
    )
    .unwrap();

    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "prism_http_requests_total",
        "Total HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref AUTH_FAILURES: CounterVec = register_counter_vec!(
        "prism_auth_failures_total",
        "Token authorization failures by error code",
        &["code"]
    )
    .unwrap();

    pub static ref UPSTREAM_ATTEMPTS: CounterVec = register_counter_vec!(
        "prism_upstream_attempts_total",
        "Upstream open attempts by driver and result",
        &["driver", "result"]
    )
    .unwrap();

    /// Records lost because the accounting channel was full or retries were
    /// exhausted.
    pub static ref ACCOUNTING_RECORDS_DROPPED: Counter = register_counter!(
        "prism_accounting_records_dropped_total",
        "Usage records dropped by the accounting engine"
    )
    .unwrap();
}

pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[&method, &path, &status])
        .observe(start.elapsed().as_secs_f64());

    response
}

pub async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", err);
        return Response::builder()
            .status(500)
            .body(axum::body::Body::from("metrics encoding failed"))
            .unwrap_or_default();
    }

    Response::builder()
        .status(200)
        .header("content-type", encoder.format_type())
        .body(axum::body::Body::from(buffer))
        .unwrap_or_default()
}
