//! Token to preview link mapping with lazy and periodic expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::link::{LinkLookup, LinkStats, PreviewLink, generate_token};

/// Default link lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Default period of the background sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Shortest sweep period accepted; shorter ones are raised to this.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

type LinkMap = Arc<RwLock<HashMap<String, PreviewLink>>>;

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns every issued preview link.
pub struct LinkRegistry {
    links: LinkMap,
    base_url: RwLock<String>,
    default_ttl: Duration,
    sweep_interval: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl std::fmt::Debug for LinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkRegistry")
            .field("default_ttl", &self.default_ttl)
            .field("sweep_interval", &self.sweep_interval)
            .finish_non_exhaustive()
    }
}

impl LinkRegistry {
    /// Create a registry publishing links under `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            links: Arc::new(RwLock::new(HashMap::new())),
            base_url: RwLock::new(base_url.into()),
            default_ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the sweep period. Periods below [`MIN_SWEEP_INTERVAL`] are clamped.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        if interval < MIN_SWEEP_INTERVAL {
            warn!(?interval, "Sweep interval too short, using {:?}", MIN_SWEEP_INTERVAL);
        }
        self.sweep_interval = interval.max(MIN_SWEEP_INTERVAL);
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub async fn base_url(&self) -> String {
        self.base_url.read().await.clone()
    }

    /// Replace the public base URL used for links created without one.
    pub async fn set_base_url(&self, base_url: impl Into<String>) {
        *self.base_url.write().await = base_url.into();
    }

    /// Issue a link for `port` expiring after the default TTL.
    pub async fn create_link(&self, port: u16, base_url: Option<&str>) -> PreviewLink {
        self.create_link_with_ttl(port, base_url, Some(self.default_ttl))
            .await
    }

    /// Issue a link for `port`. A `ttl` of `None` never expires.
    pub async fn create_link_with_ttl(
        &self,
        port: u16,
        base_url: Option<&str>,
        ttl: Option<Duration>,
    ) -> PreviewLink {
        let base = match base_url {
            Some(base) => base.to_string(),
            None => self.base_url().await,
        };
        let expires_at = ttl.and_then(|ttl| {
            TimeDelta::from_std(ttl)
                .ok()
                .and_then(|delta| Utc::now().checked_add_signed(delta))
        });

        let mut links = self.links.write().await;
        let mut token = generate_token();
        while links.contains_key(&token) {
            warn!("Preview token collision, regenerating");
            token = generate_token();
        }

        let link = PreviewLink {
            url: format!("{}/preview/{}", base.trim_end_matches('/'), token),
            token: token.clone(),
            port,
            expires_at,
        };
        links.insert(token, link.clone());
        drop(links);

        info!(port, expires_at = ?link.expires_at, "Created preview link");
        link
    }

    /// Look up `token`, distinguishing expired from unknown.
    pub async fn lookup(&self, token: &str) -> LinkLookup {
        match self.links.read().await.get(token) {
            Some(link) if link.is_expired() => LinkLookup::Expired(link.clone()),
            Some(link) => LinkLookup::Active(link.clone()),
            None => LinkLookup::Missing,
        }
    }

    /// The link for `token` if it exists and has not expired.
    pub async fn resolve(&self, token: &str) -> Option<PreviewLink> {
        match self.lookup(token).await {
            LinkLookup::Active(link) => Some(link),
            _ => None,
        }
    }

    /// Remove `token`. Returns whether it was present.
    pub async fn revoke(&self, token: &str) -> bool {
        let removed = self.links.write().await.remove(token).is_some();
        if removed {
            info!("Revoked preview link");
        }
        removed
    }

    pub async fn stats(&self) -> LinkStats {
        let now = Utc::now();
        let links = self.links.read().await;
        let expired = links.values().filter(|l| l.is_expired_at(now)).count();
        LinkStats {
            total_links: links.len(),
            active_links: links.len() - expired,
            expired_links: expired,
        }
    }

    /// Drop every expired link now. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        sweep(&self.links).await
    }

    /// Start the background sweep. Calling it again while running is a no-op.
    pub async fn start(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let links = Arc::clone(&self.links);
        let period = self.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = sweep(&links).await;
                        if removed > 0 {
                            info!("Swept {} expired preview links", removed);
                        }
                    }
                }
            }
            debug!("Preview link sweep stopped");
        });

        *sweeper = Some(Sweeper { cancel, handle });
        info!(interval_secs = period.as_secs(), "Preview link sweep started");
    }

    /// Stop the background sweep and wait for it to exit.
    pub async fn stop(&self) {
        let Some(sweeper) = self.sweeper.lock().await.take() else {
            return;
        };
        sweeper.cancel.cancel();
        if let Err(e) = sweeper.handle.await {
            warn!("Preview link sweep task failed: {e}");
        }
    }

    pub async fn is_sweeping(&self) -> bool {
        self.sweeper.lock().await.is_some()
    }
}

async fn sweep(links: &LinkMap) -> usize {
    let now = Utc::now();
    let mut links = links.write().await;
    let before = links.len();
    links.retain(|_, link| !link.is_expired_at(now));
    before - links.len()
}
