//! Service descriptor.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{Json, extract::State};

use crate::state::AppState;

use super::types::ServiceInfo;

pub async fn service_info(State(state): State<Arc<AppState>>) -> Json<ServiceInfo> {
    let endpoints = BTreeMap::from([
        ("proxy", "/proxy/{port}/{path}"),
        ("preview", "/preview/{token}/{path}"),
        ("preview_create", "/api/preview/create"),
        ("preview_stats", "/api/preview/stats"),
        ("preview_revoke", "/api/preview/{token}"),
        ("health", "/health"),
        ("daemon_status", "/daemon/status"),
        ("metrics", "/metrics"),
    ]);

    Json(ServiceInfo {
        service: "Daemon Proxy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        endpoints,
        daemon_url: state.daemon.base_url().await,
    })
}
