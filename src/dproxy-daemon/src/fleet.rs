//! One daemon per sandbox, keyed by sandbox id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::config::DaemonConfig;
use crate::error::Result;
use crate::manager::DaemonManager;
use crate::runtime::ContainerRuntime;
use crate::sandbox::SandboxHandle;

/// Registry of running daemons.
///
/// Managers are only registered after they started successfully, so every
/// entry is a running daemon until it is detached.
pub struct DaemonFleet {
    template: DaemonConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    managers: RwLock<HashMap<String, Arc<DaemonManager>>>,
    /// One lock per sandbox id being attached.
    attaching: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DaemonFleet {
    /// Create an empty fleet. Per-sandbox configs are derived from `template`.
    pub fn new(template: DaemonConfig) -> Self {
        Self {
            template,
            runtime: None,
            managers: RwLock::new(HashMap::new()),
            attaching: Mutex::new(HashMap::new()),
        }
    }

    /// Use `runtime` for every local container instead of connecting to Docker.
    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Start a daemon for `sandbox`, or return the one already attached.
    ///
    /// Attaches for different ids run concurrently; attaches for the same id
    /// are serialized so only one daemon is started for it.
    pub async fn attach(&self, sandbox: &SandboxHandle) -> Result<Arc<DaemonManager>> {
        let id = sandbox.id();
        let slot = Arc::clone(self.attaching.lock().await.entry(id.to_string()).or_default());

        let result = {
            let _guard = slot.lock().await;
            self.attach_locked(sandbox).await
        };

        let mut attaching = self.attaching.lock().await;
        // The map and `slot` are the only holders once no one else waits.
        if Arc::strong_count(&slot) == 2 {
            attaching.remove(id);
        }
        result
    }

    async fn attach_locked(&self, sandbox: &SandboxHandle) -> Result<Arc<DaemonManager>> {
        if let Some(existing) = self.managers.read().await.get(sandbox.id()) {
            return Ok(Arc::clone(existing));
        }

        let config = sandbox.daemon_config(&self.template);
        let manager = match &self.runtime {
            Some(runtime) => DaemonManager::with_runtime(config, Arc::clone(runtime))?,
            None => DaemonManager::new(config)?,
        };
        manager.start().await?;

        let manager = Arc::new(manager);
        self.managers
            .write()
            .await
            .insert(sandbox.id().to_string(), Arc::clone(&manager));
        info!(sandbox = sandbox.id(), kind = %sandbox.kind(), "Attached daemon");
        Ok(manager)
    }

    /// Stop and forget the daemon for `id`. Returns false if unknown.
    pub async fn detach(&self, id: &str) -> bool {
        let removed = self.managers.write().await.remove(id);
        match removed {
            Some(manager) => {
                manager.stop().await;
                info!(sandbox = id, "Detached daemon");
                true
            }
            None => false,
        }
    }

    pub async fn manager(&self, id: &str) -> Option<Arc<DaemonManager>> {
        self.managers.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.managers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.managers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.managers.read().await.is_empty()
    }

    /// Stop every daemon and empty the fleet.
    pub async fn teardown(&self) {
        let drained: Vec<(String, Arc<DaemonManager>)> =
            self.managers.write().await.drain().collect();
        for (id, manager) in drained {
            manager.stop().await;
            info!(sandbox = %id, "Stopped daemon during teardown");
        }
    }
}

impl std::fmt::Debug for DaemonFleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonFleet")
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}
