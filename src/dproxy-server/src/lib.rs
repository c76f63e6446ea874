//! dproxy gateway - HTTP front for the in-sandbox daemon.
//!
//! This crate provides:
//! - Authenticated forwarding to sandbox ports (`/proxy/{port}/...`)
//! - Preview links that stand in for a port (`/preview/{token}/...`)
//! - Link management, health, daemon status and metrics endpoints
//! - A small client for the management API

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod middleware;
pub mod state;

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use dproxy_daemon::DaemonManager;
use dproxy_preview::LinkRegistry;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use client::{ClientError, GatewayClient};
pub use config::ServerConfig;
pub use error::{AppError, AppResult};
pub use state::AppState;

/// Run the gateway until the process is killed.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    run_with_shutdown(config, std::future::pending()).await
}

/// Run the gateway with graceful shutdown support.
pub async fn run_with_shutdown<F>(config: ServerConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if !config.security.enabled {
        warn!("Proxy routes are not protected; set security.enabled to require an API key");
    }

    Gateway::start(config).await?.serve(shutdown).await
}

/// A started gateway: daemon running, link sweep active, listener bound.
pub struct Gateway {
    state: Arc<AppState>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Start the daemon, the link registry and bind the listener.
    pub async fn start(config: ServerConfig) -> anyhow::Result<Self> {
        let daemon = DaemonManager::new(config.daemon_config())?;
        Self::start_with(config, daemon).await
    }

    /// Like [`Gateway::start`] with a caller-built daemon manager.
    pub async fn start_with(config: ServerConfig, daemon: DaemonManager) -> anyhow::Result<Self> {
        config.validate()?;

        let daemon = Arc::new(daemon);
        daemon.start().await.context("failed to start daemon")?;

        let links = Arc::new(
            LinkRegistry::new(config.server.public_url.clone().unwrap_or_default())
                .with_default_ttl(config.preview.default_ttl_duration())
                .with_sweep_interval(config.preview.sweep_interval_duration()),
        );
        links.start().await;

        let listener = match TcpListener::bind(config.listen_addr()).await {
            Ok(listener) => listener,
            Err(e) => {
                links.stop().await;
                daemon.stop().await;
                return Err(e).with_context(|| format!("failed to bind {}", config.listen_addr()));
            }
        };
        let local_addr = listener.local_addr()?;
        links.set_base_url(public_base_url(&config, local_addr)).await;

        info!(addr = %local_addr, daemon = %daemon.base_url().await, "Gateway started");
        let state = Arc::new(AppState::new(config, daemon, links));
        Ok(Self {
            state,
            listener,
            local_addr,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Serve until `shutdown` resolves, then stop the link sweep and the daemon.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self {
            state, listener, ..
        } = self;

        let app = create_router(Arc::clone(&state));
        let grace = state.config.shutdown_timeout_duration();
        let signalled = Arc::new(Notify::new());
        let notify = Arc::clone(&signalled);

        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                notify.notify_one();
            })
            .into_future();

        let result = tokio::select! {
            result = server => result.map_err(anyhow::Error::from),
            _ = async {
                signalled.notified().await;
                tokio::time::sleep(grace).await;
            } => {
                warn!("In-flight requests did not finish within {}s", grace.as_secs());
                Ok(())
            }
        };

        info!("Gateway shutting down");
        state.links.stop().await;
        state.daemon.stop().await;
        info!("Gateway stopped");
        result
    }
}

/// Base URL published in preview links.
pub fn public_base_url(config: &ServerConfig, local_addr: SocketAddr) -> String {
    if let Some(url) = config.server.public_url.as_deref().filter(|u| !u.is_empty()) {
        return url.trim_end_matches('/').to_string();
    }
    let host = match config.server.host.as_str() {
        "0.0.0.0" | "::" | "[::]" => "localhost",
        other => other,
    };
    format!("http://{}:{}", host, local_addr.port())
}

/// Build the router. Layers run outermost first: CORS, tracing, body
/// limit, auth, logging, error.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = middleware::cors_layer(&state.config.server.cors_origins);
    let max_body_size = state.config.server.max_body_size;

    api::routes()
        .layer(axum::middleware::from_fn(middleware::error_middleware))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::logging_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::auth_middleware,
        ))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
