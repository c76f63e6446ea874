//! Error types for daemon staging, injection and forwarding.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while staging the daemon executable.
#[derive(Debug, Error)]
pub enum BinaryError {
    /// Host CPU is not one the daemon is built for.
    #[error("Unsupported architecture: {arch} (supported: x86_64, aarch64)")]
    UnsupportedArchitecture { arch: String },

    /// Source executable does not exist.
    #[error("Binary file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Source path exists but is not a regular file.
    #[error("Path is not a file: {}", .0.display())]
    NotAFile(PathBuf),

    /// Source executable cannot be opened for reading.
    #[error("Cannot read binary file {}: {source}", path.display())]
    NotReadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Staged copy is not executable after the permission change.
    #[error("Staged binary is not executable: {}", .0.display())]
    NotExecutable(PathBuf),

    /// Copying or chmod-ing the staged file failed.
    #[error("Failed to stage binary at {}: {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the daemon lifecycle manager.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Binary staging failed.
    #[error(transparent)]
    Binary(#[from] BinaryError),

    /// The referenced container does not exist.
    #[error("Container {0} not found")]
    ContainerNotFound(String),

    /// The referenced container exists but is not running.
    #[error("Container {container} is not running (status: {status})")]
    ContainerNotRunning { container: String, status: String },

    /// The container has no routable network address.
    #[error("Container {0} has no IP address")]
    NoIpAddress(String),

    /// Any other failure reported by the container runtime.
    #[error("Container runtime error: {0}")]
    ContainerRuntime(String),

    /// Spawning the host daemon process failed.
    #[error("Failed to start daemon process {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The spawned host daemon exited before it became ready.
    #[error("Daemon process exited early: {0}")]
    ProcessExited(String),

    /// The readiness check never succeeded.
    #[error("Daemon failed to start within {:.1}s", elapsed.as_secs_f64())]
    StartupTimeout { elapsed: Duration },

    /// A request was made while the daemon is not running.
    #[error("Daemon is not running")]
    NotRunning,

    /// The forwarded request failed at the transport level.
    #[error("Upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),

    /// The configuration cannot be used for the selected mode.
    #[error("Invalid daemon configuration: {0}")]
    InvalidConfig(String),

    /// Building the HTTP client failed.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

impl DaemonError {
    /// Whether this error belongs to a single forwarded request rather than
    /// to the daemon lifecycle.
    pub fn is_request_scoped(&self) -> bool {
        matches!(self, Self::NotRunning | Self::Upstream(_))
    }
}

/// The injection step failed; the caller decides whether to fall back.
#[derive(Debug, Error)]
#[error("Injection failed during {stage}: {reason}")]
pub struct InjectionFailed {
    /// Step that failed (prepare, archive, upload, chmod, launch).
    pub stage: &'static str,
    /// Human readable cause.
    pub reason: String,
}

impl InjectionFailed {
    pub(crate) fn new(stage: &'static str, reason: impl ToString) -> Self {
        Self {
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_timeout_names_elapsed() {
        let err = DaemonError::StartupTimeout {
            elapsed: Duration::from_millis(2500),
        };
        assert_eq!(err.to_string(), "Daemon failed to start within 2.5s");
    }

    #[test]
    fn test_request_scoped() {
        assert!(DaemonError::NotRunning.is_request_scoped());
        assert!(!DaemonError::ContainerNotFound("x".into()).is_request_scoped());
    }

    #[test]
    fn test_injection_failed_display() {
        let err = InjectionFailed::new("upload", "disk full");
        assert_eq!(err.to_string(), "Injection failed during upload: disk full");
    }
}
