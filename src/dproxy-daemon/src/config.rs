//! Daemon configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where the daemon runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonMode {
    /// Local subprocess, or a remote daemon at the configured host/url.
    #[default]
    Host,
    /// Inside an already running container.
    Docker,
    /// Nothing is started; the daemon URL is provided by the caller.
    Mock,
}

/// Whether to place the daemon inside the container or expect it there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionMode {
    /// Inject the executable, falling back to direct connect on failure.
    #[default]
    Volume,
    /// Connect to a daemon already present in the container.
    Direct,
}

/// How the executable reaches the container in volume mode.
///
/// `Mount` cannot add a bind mount to a running container, so it writes the
/// host-provided binary with the same archive upload as `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionMethod {
    #[default]
    Copy,
    Mount,
}

impl FromStr for DaemonMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "docker" => Ok(Self::Docker),
            "mock" => Ok(Self::Mock),
            other => Err(format!("unknown daemon mode '{other}' (expected host, docker or mock)")),
        }
    }
}

impl FromStr for InjectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "volume" => Ok(Self::Volume),
            "direct" => Ok(Self::Direct),
            other => Err(format!("unknown injection mode '{other}'")),
        }
    }
}

impl FromStr for InjectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "copy" => Ok(Self::Copy),
            "mount" => Ok(Self::Mount),
            other => Err(format!("unknown injection method '{other}'")),
        }
    }
}

/// Environment variable consulted for the mount method's source binary.
pub const HOST_BINARY_PATH_ENV: &str = "HOST_DAEMON_BINARY_PATH";

/// Daemon lifecycle configuration. Immutable once handed to a manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Run mode.
    #[serde(default)]
    pub mode: DaemonMode,

    /// Host the daemon listens on (host and mock modes).
    #[serde(default = "default_host")]
    pub host: String,

    /// Port the daemon listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Explicit daemon base URL. Wins over host/port; in host mode it
    /// means the daemon is remote and nothing is spawned.
    #[serde(default)]
    pub url: Option<String>,

    /// Local daemon executable (host mode).
    #[serde(default = "default_daemon_path")]
    pub path: PathBuf,

    /// Container name or id (docker mode).
    #[serde(default = "default_container_name", alias = "container_ref")]
    pub container_name: String,

    /// Daemon build copied into containers.
    #[serde(default = "default_daemon_path")]
    pub binary_source_path: PathBuf,

    /// Host binary used by the mount method.
    #[serde(default)]
    pub host_binary_path: Option<PathBuf>,

    /// Staging directory override for the binary preparer.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    #[serde(default)]
    pub injection_mode: InjectionMode,

    #[serde(default)]
    pub injection_method: InjectionMethod,

    /// Readiness deadline in seconds.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,

    /// Per forwarded request deadline in seconds.
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout: u64,

    /// Connection-failure retries per forwarded request.
    #[serde(default = "default_max_retries")]
    pub proxy_max_retries: u32,

    /// Delay between retries in seconds.
    #[serde(default = "default_retry_delay")]
    pub proxy_retry_delay: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    2280
}

fn default_daemon_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/daytona")
}

fn default_container_name() -> String {
    "my-sandbox".to_string()
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_proxy_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            mode: DaemonMode::default(),
            host: default_host(),
            port: default_port(),
            url: None,
            path: default_daemon_path(),
            container_name: default_container_name(),
            binary_source_path: default_daemon_path(),
            host_binary_path: None,
            staging_dir: None,
            injection_mode: InjectionMode::default(),
            injection_method: InjectionMethod::default(),
            startup_timeout: default_startup_timeout(),
            proxy_timeout: default_proxy_timeout(),
            proxy_max_retries: default_max_retries(),
            proxy_retry_delay: default_retry_delay(),
        }
    }
}

impl DaemonConfig {
    /// Config for a mock daemon reachable at `url`.
    pub fn mock(url: impl Into<String>) -> Self {
        Self {
            mode: DaemonMode::Mock,
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Config for a daemon inside `container`.
    pub fn docker(container: impl Into<String>) -> Self {
        Self {
            mode: DaemonMode::Docker,
            container_name: container.into(),
            ..Default::default()
        }
    }

    /// Base URL derived from host and port, or the explicit `url`.
    pub fn configured_base_url(&self) -> String {
        match &self.url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    /// Source binary for the mount method.
    pub fn mount_source(&self) -> Option<PathBuf> {
        self.host_binary_path
            .clone()
            .or_else(|| std::env::var_os(HOST_BINARY_PATH_ENV).map(PathBuf::from))
    }

    pub fn startup_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.startup_timeout)
    }

    pub fn proxy_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout)
    }

    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_secs(self.proxy_retry_delay)
    }

    /// Collect configuration problems for the selected mode.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.port == 0 {
            problems.push("daemon.port must be a positive integer".to_string());
        }
        if self.proxy_timeout == 0 {
            problems.push("proxy.timeout must be a positive integer".to_string());
        }
        match self.mode {
            DaemonMode::Host if self.url.is_none() && self.path.as_os_str().is_empty() => {
                problems.push("daemon.path is required for host mode".to_string());
            }
            DaemonMode::Docker if self.container_name.trim().is_empty() => {
                problems.push("daemon.container_name is required for docker mode".to_string());
            }
            _ => {}
        }
        problems
    }
}
