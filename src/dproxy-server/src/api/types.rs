//! Request and response bodies.

use std::collections::BTreeMap;

use dproxy_daemon::DaemonStatus;
use serde::{Deserialize, Serialize};

/// `POST /api/preview/create` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateLinkRequest {
    /// Sandbox port. Required and non-zero.
    #[serde(default)]
    pub port: Option<u16>,
    /// Lifetime in seconds; the registry default when absent.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// `DELETE /api/preview/{token}` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeResponse {
    pub message: String,
}

/// `GET /health` body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// "healthy" or "unhealthy".
    pub status: String,
    /// Seconds since start.
    pub uptime: f64,
    pub request_count: u64,
    pub error_count: u64,
    pub daemon: DaemonStatus,
}

/// `GET /` body.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
    pub endpoints: BTreeMap<&'static str, &'static str>,
    pub daemon_url: String,
}
