//! Gateway configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use dproxy_daemon::DaemonConfig;
use serde::{Deserialize, Serialize};

/// Gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ListenConfig,

    /// Daemon lifecycle settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Bearer auth for the proxy routes.
    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Forwarding settings, applied to the daemon manager.
    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub preview: PreviewConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port. 0 picks a free port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Public base URL for preview links. Derived from the bound address
    /// when unset.
    #[serde(default)]
    pub public_url: Option<String>,

    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// CORS origins (empty = allow all).
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
            max_body_size: default_max_body_size(),
            cors_origins: vec![],
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Bearer auth configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Also write logs to this file.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

/// Forwarding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Per request timeout in seconds.
    #[serde(default = "default_proxy_timeout")]
    pub timeout: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retries in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
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

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: default_proxy_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

/// Preview link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Link lifetime in seconds.
    #[serde(default = "default_ttl")]
    pub default_ttl: u64,

    /// Expired link sweep period in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

fn default_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl PreviewConfig {
    pub fn default_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.default_ttl)
    }

    pub fn sweep_interval_duration(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

impl ServerConfig {
    /// Load from a JSON (`.json`) or YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("invalid JSON in {}", path.display()))?
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("invalid YAML in {}", path.display()))?
        };
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from the process environment.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Override fields from `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("DAEMON_PROXY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("DAEMON_PROXY_PORT") {
            self.server.port = parse_env("DAEMON_PROXY_PORT", &port)?;
        }

        if let Some(mode) = lookup("DAEMON_MODE") {
            self.daemon.mode = mode.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(host) = lookup("DAEMON_HOST") {
            self.daemon.host = host;
        }
        if let Some(port) = lookup("DAEMON_PORT") {
            self.daemon.port = parse_env("DAEMON_PORT", &port)?;
        }
        if let Some(path) = lookup("DAEMON_PATH") {
            self.daemon.path = PathBuf::from(path);
        }
        if let Some(url) = lookup("DAEMON_URL") {
            self.daemon.url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(container) = lookup("DAEMON_CONTAINER_NAME") {
            self.daemon.container_name = container;
        }
        if let Some(source) = lookup("DAEMON_BINARY_SOURCE_PATH") {
            self.daemon.binary_source_path = PathBuf::from(source);
        }
        if let Some(mode) = lookup("DAEMON_INJECTION_MODE") {
            self.daemon.injection_mode = mode.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(method) = lookup("DAEMON_INJECTION_METHOD") {
            self.daemon.injection_method = method.parse().map_err(anyhow::Error::msg)?;
        }

        if let Some(enabled) = lookup("SECURITY_ENABLED") {
            self.security.enabled = parse_bool(&enabled);
        }
        if let Some(key) = lookup("SECURITY_API_KEY") {
            self.security.api_key = Some(key).filter(|k| !k.is_empty());
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(file) = lookup("LOG_FILE") {
            self.logging.file = Some(PathBuf::from(file)).filter(|f| !f.as_os_str().is_empty());
        }

        if let Some(timeout) = lookup("PROXY_TIMEOUT") {
            self.proxy.timeout = parse_env("PROXY_TIMEOUT", &timeout)?;
        }

        Ok(())
    }

    /// Check the whole configuration, reporting every problem at once.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut problems = self.daemon_config().problems();
        if self.security.enabled && self.security.api_key.as_deref().is_none_or(str::is_empty) {
            problems.push("security.api_key is required when security is enabled".to_string());
        }
        if self.server.host.trim().is_empty() {
            problems.push("server.host must not be empty".to_string());
        }
        if self.preview.sweep_interval == 0 {
            problems.push("preview.sweep_interval must be a positive integer".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            bail!("invalid configuration:\n  - {}", problems.join("\n  - "))
        }
    }

    /// Address to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Daemon configuration with the proxy section applied.
    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            proxy_timeout: self.proxy.timeout,
            proxy_max_retries: self.proxy.max_retries,
            proxy_retry_delay: self.proxy.retry_delay,
            ..self.daemon.clone()
        }
    }

    pub fn shutdown_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout)
    }
}

fn parse_env<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{key}={value:?} is invalid: {e}"))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
