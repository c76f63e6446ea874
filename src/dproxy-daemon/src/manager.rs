//! Daemon lifecycle: start, readiness, forwarding, status and stop.
//!
//! A [`DaemonManager`] owns exactly one daemon. Depending on
//! [`DaemonMode`] it spawns a local process, attaches to a remote daemon,
//! injects the daemon into a running container, or just points at a URL.
//! Start and stop are serialized; forwarding only takes a read lock on the
//! current state so requests never wait behind a slow start.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::archive::{CONTAINER_BIN_DIR, DAEMON_BINARY_NAME, executable_archive};
use crate::binary::{BinaryPreparer, is_executable};
use crate::config::{DaemonConfig, DaemonMode, HOST_BINARY_PATH_ENV, InjectionMethod, InjectionMode};
use crate::error::{BinaryError, DaemonError, InjectionFailed, Result};
use crate::proxy::{ProxyRequest, ProxyResponse};
use crate::runtime::{ContainerInfo, ContainerRuntime, DockerRuntime};

/// Pause between readiness checks.
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for a single readiness check.
const READY_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for the status check.
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const USER_AGENT: &str = concat!("dproxy/", env!("CARGO_PKG_VERSION"));

/// Lifecycle state of the managed daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running { base_url: String },
}

/// Coarse daemon health as reported by [`DaemonManager::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonHealth {
    Running,
    Stopped,
    Error,
}

/// Result of a status check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonStatus {
    pub status: DaemonHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonStatus {
    pub fn is_running(&self) -> bool {
        self.status == DaemonHealth::Running
    }
}

enum DaemonTarget {
    /// Nothing was started.
    External,
    /// Spawned on this host.
    Process(Child),
    /// Inside a container, injected or pre-existing.
    Container,
}

/// Outcome of a successful injection.
struct Injected {
    base_url: String,
}

/// Resources held while the daemon is up.
struct DaemonHandle {
    base_url: String,
    target: DaemonTarget,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    preparer: Option<BinaryPreparer>,
}

impl DaemonHandle {
    fn new() -> Self {
        Self {
            base_url: String::new(),
            target: DaemonTarget::External,
            runtime: None,
            preparer: None,
        }
    }
}

/// Manages one daemon instance.
pub struct DaemonManager {
    config: DaemonConfig,
    client: Client,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    state: RwLock<DaemonState>,
    handle: Mutex<Option<DaemonHandle>>,
    isolation_check: fn() -> bool,
}

impl std::fmt::Debug for DaemonManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonManager")
            .field("mode", &self.config.mode)
            .field("url", &self.config.configured_base_url())
            .finish()
    }
}

/// Whether this process runs inside a container.
pub fn running_in_isolated_environment() -> bool {
    Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists()
}

impl DaemonManager {
    /// Create a manager. Docker mode connects to the local engine on start.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .tcp_nodelay(true)
            .pool_idle_timeout(Duration::from_secs(60))
            .timeout(config.proxy_timeout_duration())
            .no_proxy()
            .build()
            .map_err(DaemonError::HttpClient)?;

        Ok(Self {
            config,
            client,
            runtime: None,
            state: RwLock::new(DaemonState::Stopped),
            handle: Mutex::new(None),
            isolation_check: running_in_isolated_environment,
        })
    }

    /// Create a manager that talks to containers through `runtime`.
    pub fn with_runtime(config: DaemonConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let mut manager = Self::new(config)?;
        manager.runtime = Some(runtime);
        Ok(manager)
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub async fn state(&self) -> DaemonState {
        self.state.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.read().await, DaemonState::Running { .. })
    }

    /// Base URL of the running daemon, or the configured one.
    pub async fn base_url(&self) -> String {
        match &*self.state.read().await {
            DaemonState::Running { base_url } => base_url.clone(),
            _ => self.config.configured_base_url(),
        }
    }

    /// Start the daemon and wait until it answers `GET /version`.
    ///
    /// Calling this while the daemon is running is a no-op. On failure every
    /// resource acquired so far is released and the state is `Stopped`.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.handle.lock().await;
        if slot.is_some() {
            debug!("Daemon already running");
            return Ok(());
        }

        *self.state.write().await = DaemonState::Starting;
        info!(mode = ?self.config.mode, "Starting daemon");

        let mut handle = DaemonHandle::new();
        match self.launch(&mut handle).await {
            Ok(()) => {
                info!(url = %handle.base_url, "Daemon is ready");
                *self.state.write().await = DaemonState::Running {
                    base_url: handle.base_url.clone(),
                };
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start daemon: {e}");
                release(handle).await;
                *self.state.write().await = DaemonState::Stopped;
                Err(e)
            }
        }
    }

    async fn launch(&self, handle: &mut DaemonHandle) -> Result<()> {
        match self.config.mode {
            DaemonMode::Mock => {
                handle.base_url = self.config.configured_base_url();
                info!(url = %handle.base_url, "Using mock daemon");
            }
            DaemonMode::Host => self.start_host(handle)?,
            DaemonMode::Docker => self.start_docker(handle).await?,
        }
        self.wait_until_ready(handle).await
    }

    fn start_host(&self, handle: &mut DaemonHandle) -> Result<()> {
        handle.base_url = self.config.configured_base_url();
        if self.config.url.is_some() || (self.isolation_check)() {
            info!(url = %handle.base_url, "Connecting to remote daemon");
            return Ok(());
        }

        let path = &self.config.path;
        if !path.exists() {
            return Err(BinaryError::NotFound(path.clone()).into());
        }
        if !is_executable(path) {
            return Err(BinaryError::NotExecutable(path.clone()).into());
        }

        let work_dir = std::env::current_dir().map_err(|source| DaemonError::Spawn {
            path: path.clone(),
            source,
        })?;

        let mut child = Command::new(path)
            .arg("--work-dir")
            .arg(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DaemonError::Spawn {
                path: path.clone(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        info!(pid = ?child.id(), path = %path.display(), "Spawned daemon process");
        handle.target = DaemonTarget::Process(child);
        Ok(())
    }

    async fn start_docker(&self, handle: &mut DaemonHandle) -> Result<()> {
        let runtime = match &self.runtime {
            Some(runtime) => Arc::clone(runtime),
            None => Arc::new(DockerRuntime::connect()?) as Arc<dyn ContainerRuntime>,
        };
        handle.runtime = Some(Arc::clone(&runtime));
        handle.target = DaemonTarget::Container;

        let container = self.config.container_name.as_str();
        let info = runtime.inspect(container).await?;
        if !info.running {
            return Err(DaemonError::ContainerNotRunning {
                container: container.to_string(),
                status: info.status,
            });
        }
        info!(container, id = %info.id, "Found running container");

        handle.base_url = match self.config.injection_mode {
            InjectionMode::Volume => {
                match self.inject(runtime.as_ref(), &info, handle).await {
                    Ok(injected) => injected.base_url,
                    Err(e) => {
                        warn!("{e}; falling back to direct mode");
                        self.direct_url(&info)?
                    }
                }
            }
            InjectionMode::Direct => self.direct_url(&info)?,
        };
        Ok(())
    }

    fn direct_url(&self, info: &ContainerInfo) -> Result<String> {
        if let Some(url) = &self.config.url {
            return Ok(url.trim_end_matches('/').to_string());
        }
        match &info.ip_address {
            Some(ip) => Ok(format!("http://{}:{}", ip, self.config.port)),
            None => Err(DaemonError::NoIpAddress(self.config.container_name.clone())),
        }
    }

    /// Write the daemon into the container and start it there.
    async fn inject(
        &self,
        runtime: &dyn ContainerRuntime,
        info: &ContainerInfo,
        handle: &mut DaemonHandle,
    ) -> std::result::Result<Injected, InjectionFailed> {
        let container = self.config.container_name.as_str();

        let source = match self.config.injection_method {
            InjectionMethod::Copy => {
                let preparer = handle.preparer.get_or_insert_with(|| match &self.config.staging_dir {
                    Some(dir) => BinaryPreparer::new(dir),
                    None => BinaryPreparer::default(),
                });
                preparer
                    .prepare_binary(&self.config.binary_source_path)
                    .map_err(|e| InjectionFailed::new("prepare", e))?
            }
            InjectionMethod::Mount => {
                let source = self.config.mount_source().ok_or_else(|| {
                    InjectionFailed::new("prepare", format!("{HOST_BINARY_PATH_ENV} is not set"))
                })?;
                if !source.is_file() {
                    return Err(InjectionFailed::new(
                        "prepare",
                        BinaryError::NotFound(source),
                    ));
                }
                source
            }
        };

        let archive = executable_archive(&source, DAEMON_BINARY_NAME)
            .map_err(|e| InjectionFailed::new("archive", e))?;
        runtime
            .upload_archive(container, CONTAINER_BIN_DIR, archive)
            .await
            .map_err(|e| InjectionFailed::new("upload", e))?;
        info!(container, source = %source.display(), "Copied daemon into container");

        let target = format!("{CONTAINER_BIN_DIR}/{DAEMON_BINARY_NAME}");
        let chmod = runtime
            .exec(container, vec!["chmod".into(), "+x".into(), target.clone()])
            .await
            .map_err(|e| InjectionFailed::new("chmod", e))?;
        if !chmod.success() {
            return Err(InjectionFailed::new("chmod", chmod.output_lossy()));
        }

        self.launch_in_container(runtime, container, &target).await?;

        let base_url = match &self.config.url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = info.ip_address.as_deref().unwrap_or(container);
                format!("http://{}:{}", host, self.config.port)
            }
        };
        Ok(Injected { base_url })
    }

    async fn launch_in_container(
        &self,
        runtime: &dyn ContainerRuntime,
        container: &str,
        target: &str,
    ) -> std::result::Result<(), InjectionFailed> {
        let pattern = format!("{DAEMON_BINARY_NAME} daemon");
        let running = runtime
            .exec(container, vec!["pgrep".into(), "-f".into(), pattern])
            .await
            .map_err(|e| InjectionFailed::new("launch", e))?;
        if running.success() {
            info!(container, pids = %running.output_lossy(), "Daemon already running in container");
            return Ok(());
        }

        let command = format!("{target} daemon --port {}", self.config.port);
        runtime
            .exec_detached(container, vec!["sh".into(), "-c".into(), command])
            .await
            .map_err(|e| InjectionFailed::new("launch", e))?;
        info!(container, port = self.config.port, "Launched daemon in container");
        Ok(())
    }

    /// Poll `GET /version` until it answers 200 or the startup timeout passes.
    async fn wait_until_ready(&self, handle: &mut DaemonHandle) -> Result<()> {
        let timeout = self.config.startup_timeout_duration();
        let url = format!("{}/version", handle.base_url);
        let started = Instant::now();

        loop {
            if let DaemonTarget::Process(child) = &mut handle.target
                && let Ok(Some(status)) = child.try_wait()
            {
                return Err(DaemonError::ProcessExited(status.to_string()));
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(DaemonError::StartupTimeout { elapsed });
            }
            let remaining = timeout - elapsed;

            match self
                .client
                .get(&url)
                .timeout(remaining.min(READY_REQUEST_TIMEOUT))
                .send()
                .await
            {
                Ok(response) if response.status() == StatusCode::OK => return Ok(()),
                Ok(response) => debug!(status = %response.status(), "Daemon not ready yet"),
                Err(e) => debug!("Waiting for daemon: {e}"),
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(DaemonError::StartupTimeout {
                    elapsed: started.elapsed(),
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL.min(remaining)).await;
        }
    }

    /// Forward a request to `{base}/proxy/{port}/{path}`.
    ///
    /// Connection failures are retried up to the configured count. Any
    /// response the daemon produces, including error statuses, is returned
    /// as is.
    pub async fn proxy_request(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let base_url = match &*self.state.read().await {
            DaemonState::Running { base_url } => base_url.clone(),
            _ => return Err(DaemonError::NotRunning),
        };

        let url = request.target_url(&base_url);
        let headers = request.forwarded_headers();
        let max_retries = self.config.proxy_max_retries;
        let mut attempt = 0;

        loop {
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(headers.clone())
                .timeout(self.config.proxy_timeout_duration());
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    let body = response.bytes().await.map_err(DaemonError::Upstream)?;
                    debug!(%url, status = status.as_u16(), "Proxied request");
                    return Ok(ProxyResponse {
                        status,
                        headers,
                        body,
                    });
                }
                Err(e) if e.is_connect() && attempt < max_retries => {
                    attempt += 1;
                    warn!(attempt, max_retries, "Daemon connection failed, retrying: {e}");
                    tokio::time::sleep(self.config.retry_delay_duration()).await;
                }
                Err(e) => {
                    error!(%url, "Proxy request failed: {e}");
                    return Err(DaemonError::Upstream(e));
                }
            }
        }
    }

    /// Check the daemon. Never fails; problems are reported in the result.
    pub async fn status(&self) -> DaemonStatus {
        let base_url = match &*self.state.read().await {
            DaemonState::Running { base_url } => base_url.clone(),
            _ => {
                return DaemonStatus {
                    status: DaemonHealth::Stopped,
                    version: None,
                    url: self.config.configured_base_url(),
                    error: None,
                };
            }
        };

        let result = self
            .client
            .get(format!("{base_url}/version"))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) if response.status() == StatusCode::OK => {
                let version = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("version").and_then(|v| v.as_str()).map(String::from))
                    .unwrap_or_else(|| "unknown".to_string());
                DaemonStatus {
                    status: DaemonHealth::Running,
                    version: Some(version),
                    url: base_url,
                    error: None,
                }
            }
            Ok(response) => DaemonStatus {
                status: DaemonHealth::Error,
                version: None,
                url: base_url,
                error: Some(format!("HTTP {}", response.status().as_u16())),
            },
            Err(e) => DaemonStatus {
                status: DaemonHealth::Error,
                version: None,
                url: base_url,
                error: Some(e.to_string()),
            },
        }
    }

    /// Stop the daemon and release everything it holds. Idempotent.
    pub async fn stop(&self) {
        let mut slot = self.handle.lock().await;
        *self.state.write().await = DaemonState::Stopped;
        if let Some(handle) = slot.take() {
            release(handle).await;
            info!("Daemon stopped");
        }
    }
}

async fn release(handle: DaemonHandle) {
    if let DaemonTarget::Process(child) = handle.target {
        terminate(child).await;
    }
    if let Some(runtime) = handle.runtime
        && let Err(e) = runtime.close().await
    {
        warn!("Error closing container runtime: {e}");
    }
    if let Some(mut preparer) = handle.preparer {
        preparer.cleanup();
    }
}

/// SIGTERM, wait, then SIGKILL.
async fn terminate(mut child: Child) {
    request_shutdown(&mut child);

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => info!(%status, "Daemon process exited"),
        Ok(Err(e)) => error!("Error waiting for daemon process: {e}"),
        Err(_) => {
            warn!("Daemon process ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                error!("Failed to kill daemon process: {e}");
            }
        }
    }
}

#[cfg(unix)]
fn request_shutdown(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_shutdown(child: &mut Child) {
    let _ = child.start_kill();
}

fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "dproxy::daemon", stream, "{line}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn not_isolated() -> bool {
        false
    }

    #[tokio::test]
    async fn test_host_mode_missing_binary() {
        let config = DaemonConfig {
            path: "/definitely/not/a/daemon".into(),
            ..Default::default()
        };
        let mut manager = DaemonManager::new(config).unwrap();
        manager.isolation_check = not_isolated;

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, DaemonError::Binary(BinaryError::NotFound(_))));
        assert_eq!(manager.state().await, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_host_mode_with_url_is_remote() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": "0.9"})))
            .mount(&server)
            .await;

        let config = DaemonConfig {
            url: Some(server.uri()),
            path: "/definitely/not/a/daemon".into(),
            ..Default::default()
        };
        let mut manager = DaemonManager::new(config).unwrap();
        manager.isolation_check = not_isolated;

        manager.start().await.unwrap();
        assert_eq!(manager.base_url().await, server.uri());
        assert_eq!(manager.status().await.version.as_deref(), Some("0.9"));
        manager.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_process_never_ready_times_out_and_is_stopped() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("fake-daemon");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let config = DaemonConfig {
            host: "127.0.0.1".into(),
            port,
            path: script,
            startup_timeout: 1,
            ..Default::default()
        };
        let mut manager = DaemonManager::new(config).unwrap();
        manager.isolation_check = not_isolated;

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, DaemonError::StartupTimeout { .. }));
        assert!(!manager.is_running().await);
        assert!(manager.handle.lock().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_process_exiting_early_is_reported() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("crashing-daemon");
        std::fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let config = DaemonConfig {
            host: "127.0.0.1".into(),
            port,
            path: script,
            startup_timeout: 10,
            ..Default::default()
        };
        let mut manager = DaemonManager::new(config).unwrap();
        manager.isolation_check = not_isolated;

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, DaemonError::ProcessExited(_)));
        assert_eq!(manager.state().await, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_connect_failures_are_retried_then_reported() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = DaemonConfig {
            proxy_max_retries: 2,
            proxy_retry_delay: 0,
            ..DaemonConfig::mock(format!("http://127.0.0.1:{port}"))
        };
        let manager = DaemonManager::new(config).unwrap();
        *manager.state.write().await = DaemonState::Running {
            base_url: format!("http://127.0.0.1:{port}"),
        };

        let err = manager
            .proxy_request(ProxyRequest::get(8080, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Upstream(ref e) if e.is_connect()));
    }

    #[tokio::test]
    async fn test_status_when_stopped() {
        let manager = DaemonManager::new(DaemonConfig::mock("http://127.0.0.1:1")).unwrap();
        let status = manager.status().await;
        assert_eq!(status.status, DaemonHealth::Stopped);
        assert_eq!(status.url, "http://127.0.0.1:1");

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "stopped");
        assert!(json.get("error").is_none());
    }
}
