//! Preview link routes.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Request, State, rejection::JsonRejection},
    response::Response,
};
use dproxy_preview::{LinkLookup, LinkStats, PreviewLink};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

use super::proxy::forward;
use super::types::{CreateLinkRequest, RevokeResponse};

/// `/preview/{token}`
pub async fn serve_preview(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    request: Request,
) -> AppResult<Response> {
    serve(&state, &token, request).await
}

/// `/preview/{token}/{*path}`
pub async fn serve_preview_path(
    State(state): State<Arc<AppState>>,
    Path((token, _path)): Path<(String, String)>,
    request: Request,
) -> AppResult<Response> {
    serve(&state, &token, request).await
}

/// Forward to the link's port. The port always comes from the link.
async fn serve(state: &AppState, token: &str, request: Request) -> AppResult<Response> {
    match state.links.lookup(token).await {
        LinkLookup::Active(link) => forward(state, link.port, request).await,
        LinkLookup::Expired(_) => {
            state.links.revoke(token).await;
            Err(AppError::Gone("Preview link expired".to_string()))
        }
        LinkLookup::Missing => Err(AppError::NotFound("Preview link not found".to_string())),
    }
}

/// `POST /api/preview/create`
pub async fn create_link(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateLinkRequest>, JsonRejection>,
) -> AppResult<Json<PreviewLink>> {
    let Json(body) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let port = match body.port {
        Some(port) if port > 0 => port,
        _ => return Err(AppError::BadRequest("Port is required".to_string())),
    };

    let link = match body.expires_in {
        Some(secs) => {
            state
                .links
                .create_link_with_ttl(port, None, Some(Duration::from_secs(secs)))
                .await
        }
        None => state.links.create_link(port, None).await,
    };
    info!(port, url = %link.url, "Issued preview link");
    Ok(Json(link))
}

/// `GET /api/preview/stats`
pub async fn link_stats(State(state): State<Arc<AppState>>) -> Json<LinkStats> {
    Json(state.links.stats().await)
}

/// `DELETE /api/preview/{token}`
pub async fn revoke_link(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> AppResult<Json<RevokeResponse>> {
    if state.links.revoke(&token).await {
        Ok(Json(RevokeResponse {
            message: "Preview link revoked".to_string(),
        }))
    } else {
        Err(AppError::NotFound("Preview link not found".to_string()))
    }
}
