//! Application state shared across request handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dproxy_daemon::DaemonManager;
use dproxy_preview::LinkRegistry;

use crate::config::ServerConfig;

/// Application state shared across request handlers.
pub struct AppState {
    /// Server configuration.
    pub config: ServerConfig,
    /// The daemon all forwarding goes through.
    pub daemon: Arc<DaemonManager>,
    /// Issued preview links.
    pub links: Arc<LinkRegistry>,
    request_count: AtomicU64,
    error_count: AtomicU64,
    start_time: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("start_time", &self.start_time)
            .finish()
    }
}

impl AppState {
    pub fn new(config: ServerConfig, daemon: Arc<DaemonManager>, links: Arc<LinkRegistry>) -> Self {
        Self {
            config,
            daemon,
            links,
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }
}
