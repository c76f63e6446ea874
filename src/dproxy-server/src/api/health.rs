//! Health check and metrics endpoints.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use dproxy_daemon::DaemonStatus;

use crate::state::AppState;

use super::types::HealthResponse;

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// 200 while the daemon answers, 503 otherwise.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let daemon = state.daemon.status().await;
    let healthy = daemon.is_running();

    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        uptime: state.uptime().as_secs_f64(),
        request_count: state.request_count(),
        error_count: state.error_count(),
        daemon,
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

pub async fn daemon_status(State(state): State<Arc<AppState>>) -> Json<DaemonStatus> {
    Json(state.daemon.status().await)
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let daemon_running = u8::from(state.daemon.is_running().await);
    let active_links = state.links.stats().await.active_links;

    let mut out = String::new();
    write_metric(
        &mut out,
        "daemon_proxy_uptime_seconds",
        "Seconds since the gateway started",
        "gauge",
        format!("{:.3}", state.uptime().as_secs_f64()),
    );
    write_metric(
        &mut out,
        "daemon_proxy_requests_total",
        "Requests handled",
        "counter",
        state.request_count(),
    );
    write_metric(
        &mut out,
        "daemon_proxy_errors_total",
        "Requests that ended in a server error",
        "counter",
        state.error_count(),
    );
    write_metric(
        &mut out,
        "daemon_proxy_daemon_running",
        "1 when the daemon is running",
        "gauge",
        daemon_running,
    );
    write_metric(
        &mut out,
        "daemon_proxy_preview_links_active",
        "Unexpired preview links",
        "gauge",
        active_links,
    );

    ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], out)
}

fn write_metric(
    out: &mut String,
    name: &str,
    help: &str,
    kind: &str,
    value: impl std::fmt::Display,
) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
