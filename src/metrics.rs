/// Metrics for the Vigil auth core
///
/// Prometheus counters for login outcomes, lockouts, token refreshes,
/// refresh-token reuse and password changes, plus HTTP request timing.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ========== HTTP Metrics ==========

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vigil_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "vigil_http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // ========== Authentication Metrics ==========

    /// Login attempts by outcome
    pub static ref LOGIN_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vigil_login_attempts_total",
        "Total number of login attempts",
        &["outcome"]
    )
    .unwrap();

    /// Accounts locked by the brute-force policy
    pub static ref LOCKOUTS_TOTAL: IntCounter = register_int_counter!(
        "vigil_lockouts_total",
        "Total number of account lockouts"
    )
    .unwrap();

    /// Refresh requests by result
    pub static ref TOKEN_REFRESHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vigil_token_refreshes_total",
        "Total number of refresh token rotations",
        &["result"]
    )
    .unwrap();

    /// Rotated refresh tokens presented again
    pub static ref REFRESH_REUSE_TOTAL: IntCounter = register_int_counter!(
        "vigil_refresh_token_reuse_total",
        "Total number of refresh token reuse detections"
    )
    .unwrap();

    /// Password writes by kind
    pub static ref PASSWORD_CHANGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vigil_password_changes_total",
        "Total number of password changes",
        &["kind"]
    )
    .unwrap();

    /// Operations abandoned after REQUEST_TIMEOUT
    pub static ref OPERATION_TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "vigil_operation_timeouts_total",
        "Total number of operations that hit the request timeout",
        &["operation"]
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration);
}

/// Record a login attempt outcome
pub fn record_login(outcome: &str) {
    LOGIN_ATTEMPTS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a lockout
pub fn record_lockout() {
    LOCKOUTS_TOTAL.inc();
}

/// Record a refresh attempt
pub fn record_refresh(success: bool) {
    TOKEN_REFRESHES_TOTAL
        .with_label_values(&[if success { "success" } else { "failure" }])
        .inc();
}

/// Record a refresh token replay
pub fn record_refresh_reuse() {
    REFRESH_REUSE_TOTAL.inc();
}

/// Record a password write (`change`, `admin_reset`, `self_reset`)
pub fn record_password_change(kind: &str) {
    PASSWORD_CHANGES_TOTAL.with_label_values(&[kind]).inc();
}

/// Record an operation timeout
pub fn record_timeout(operation: &str) {
    OPERATION_TIMEOUTS_TOTAL.with_label_values(&[operation]).inc();
}
