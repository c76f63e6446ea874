//! Sandbox handles.
//!
//! A sandbox is either a container on the local runtime or a remote
//! session that already exposes a daemon URL. The variant is chosen once,
//! when the handle is built, and everything downstream works from the
//! [`DaemonConfig`] it derives.

use std::fmt;

use crate::config::{DaemonConfig, DaemonMode, InjectionMode};

/// A container on the local container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalContainerSandbox {
    pub container_ref: String,
}

/// A remote session whose daemon is reachable over the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSessionSandbox {
    pub session_id: String,
    pub daemon_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    LocalContainer,
    RemoteSession,
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalContainer => f.write_str("local-container"),
            Self::RemoteSession => f.write_str("remote-session"),
        }
    }
}

/// The sandbox a daemon is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxHandle {
    LocalContainer(LocalContainerSandbox),
    RemoteSession(RemoteSessionSandbox),
}

impl SandboxHandle {
    pub fn local_container(container_ref: impl Into<String>) -> Self {
        Self::LocalContainer(LocalContainerSandbox {
            container_ref: container_ref.into(),
        })
    }

    pub fn remote_session(session_id: impl Into<String>, daemon_url: impl Into<String>) -> Self {
        Self::RemoteSession(RemoteSessionSandbox {
            session_id: session_id.into(),
            daemon_url: daemon_url.into(),
        })
    }

    /// Stable identifier used as the fleet key.
    pub fn id(&self) -> &str {
        match self {
            Self::LocalContainer(sandbox) => &sandbox.container_ref,
            Self::RemoteSession(sandbox) => &sandbox.session_id,
        }
    }

    pub fn kind(&self) -> SandboxKind {
        match self {
            Self::LocalContainer(_) => SandboxKind::LocalContainer,
            Self::RemoteSession(_) => SandboxKind::RemoteSession,
        }
    }

    /// Daemon configuration for this sandbox, derived from `template`.
    ///
    /// Local containers get docker mode with volume injection. Remote
    /// sessions get host mode pinned to the session's daemon URL, so
    /// nothing is spawned locally.
    pub fn daemon_config(&self, template: &DaemonConfig) -> DaemonConfig {
        match self {
            Self::LocalContainer(sandbox) => DaemonConfig {
                mode: DaemonMode::Docker,
                container_name: sandbox.container_ref.clone(),
                injection_mode: InjectionMode::Volume,
                url: None,
                ..template.clone()
            },
            Self::RemoteSession(sandbox) => DaemonConfig {
                mode: DaemonMode::Host,
                url: Some(sandbox.daemon_url.clone()),
                ..template.clone()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InjectionMethod;

    #[test]
    fn test_local_container_config() {
        let template = DaemonConfig {
            port: 3333,
            injection_method: InjectionMethod::Mount,
            url: Some("http://ignored:1".into()),
            ..Default::default()
        };
        let sandbox = SandboxHandle::local_container("box-7");
        let config = sandbox.daemon_config(&template);

        assert_eq!(sandbox.id(), "box-7");
        assert_eq!(sandbox.kind(), SandboxKind::LocalContainer);
        assert_eq!(config.mode, DaemonMode::Docker);
        assert_eq!(config.container_name, "box-7");
        assert_eq!(config.injection_mode, InjectionMode::Volume);
        assert_eq!(config.injection_method, InjectionMethod::Mount);
        assert_eq!(config.port, 3333);
        assert!(config.url.is_none());
    }

    #[test]
    fn test_remote_session_config() {
        let sandbox = SandboxHandle::remote_session("sess-1", "https://sess-1.example.net");
        let config = sandbox.daemon_config(&DaemonConfig::default());

        assert_eq!(sandbox.id(), "sess-1");
        assert_eq!(sandbox.kind().to_string(), "remote-session");
        assert_eq!(config.mode, DaemonMode::Host);
        assert_eq!(config.configured_base_url(), "https://sess-1.example.net");
    }
}
