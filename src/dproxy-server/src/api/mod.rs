//! HTTP routes and handlers.

mod health;
mod preview;
mod proxy;
mod root;
pub mod types;

use std::sync::Arc;

use axum::{
    Router,
    routing::{any, delete, get, post},
};

use crate::state::AppState;

pub use types::{CreateLinkRequest, HealthResponse, RevokeResponse, ServiceInfo};

/// Create the gateway routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(root::service_info))
        // Generic forwarding
        .route("/proxy/{port}", any(proxy::proxy_to_port))
        .route("/proxy/{port}/{*path}", any(proxy::proxy_to_port_path))
        // Preview links
        .route("/preview/{token}", any(preview::serve_preview))
        .route("/preview/{token}/{*path}", any(preview::serve_preview_path))
        .route("/api/preview/create", post(preview::create_link))
        .route("/api/preview/stats", get(preview::link_stats))
        .route("/api/preview/{token}", delete(preview::revoke_link))
        // Operational
        .route("/health", get(health::health_check))
        .route("/daemon/status", get(health::daemon_status))
        .route("/metrics", get(health::metrics))
}
