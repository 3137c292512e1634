//! Prometheus metrics exposition
//!
//! - `session_proxy_requests_total` (counter): labels `status`, `method`
//! - `session_proxy_request_duration_seconds` (histogram): label `status`
//! - `session_proxy_backend_errors_total` (counter): label `error_type`
//! - `session_renewals_total` (counter): label `outcome`, emitted by the pipeline
//! - `session_login_redirects_total` (counter)

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

const DURATION_METRIC: &str = "session_proxy_request_duration_seconds";

/// Buckets from 5ms up to the backend timeout range, with headroom for renewal backoff.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Recorder that is not installed globally, for tests.
pub fn build_recorder() -> Result<PrometheusRecorder, BuildError> {
    Ok(builder()?.build_recorder())
}

/// Record a completed proxied request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("session_proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration_secs);
}

/// Record a backend call that produced no response.
pub fn record_backend_error(error_type: &str) {
    metrics::counter!("session_proxy_backend_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

pub fn record_login_redirect() {
    metrics::counter!("session_login_redirects_total").increment(1);
}
