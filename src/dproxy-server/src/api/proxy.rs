//! Forwarding to sandbox ports through the daemon.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderName, Method, header},
    response::Response,
};
use dproxy_daemon::{ProxyRequest, ProxyResponse};
use tracing::error;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Response headers that describe the daemon connection rather than the
/// payload. The body is re-framed by the gateway, so `Content-Length` is
/// dropped too except on `HEAD`, where it is the only size the client gets.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
            | "content-length"
    )
}

/// `/proxy/{port}`
pub async fn proxy_to_port(
    State(state): State<Arc<AppState>>,
    Path(port): Path<String>,
    request: Request,
) -> AppResult<Response> {
    let port = parse_port(&port)?;
    forward(&state, port, request).await
}

/// `/proxy/{port}/{*path}`
pub async fn proxy_to_port_path(
    State(state): State<Arc<AppState>>,
    Path((port, _path)): Path<(String, String)>,
    request: Request,
) -> AppResult<Response> {
    let port = parse_port(&port)?;
    forward(&state, port, request).await
}

fn parse_port(raw: &str) -> AppResult<u16> {
    match raw.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(AppError::BadRequest(format!("Invalid port: {raw}"))),
    }
}

/// Path below `/{prefix}/{key}/`, still percent-encoded.
pub(crate) fn path_tail(path: &str) -> String {
    path.trim_start_matches('/')
        .splitn(3, '/')
        .nth(2)
        .unwrap_or_default()
        .to_string()
}

/// Forward `request` to `port` and relay the daemon's answer.
pub(crate) async fn forward(state: &AppState, port: u16, request: Request) -> AppResult<Response> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, state.config.server.max_body_size)
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to read request body: {e}")))?;

    let path = path_tail(parts.uri.path());
    let method = parts.method.clone();
    let proxy_request = ProxyRequest {
        port,
        path,
        method: parts.method,
        headers: parts.headers,
        body: (!body.is_empty()).then_some(body),
        query: parts.uri.query().map(String::from),
    };

    match state.daemon.proxy_request(proxy_request).await {
        Ok(upstream) => Ok(relay(upstream, &method)),
        Err(e) => {
            error!(port, "Proxy error: {e}");
            Err(e.into())
        }
    }
}

/// Build the client response from the daemon's answer to `method`.
pub(crate) fn relay(upstream: ProxyResponse, method: &Method) -> Response {
    let keep_length = method == Method::HEAD;
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;

    let headers = response.headers_mut();
    for (name, value) in upstream.headers.iter() {
        if !is_hop_by_hop(name) || (keep_length && name == header::CONTENT_LENGTH) {
            headers.append(name.clone(), value.clone());
        }
    }
    response
}
