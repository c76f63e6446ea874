//! Container runtime collaborator.
//!
//! The lifecycle manager only needs a handful of operations from the
//! container runtime. They are collected in [`ContainerRuntime`] so the
//! Docker implementation can be swapped out in tests.

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::ExecConfig;
use bollard::query_parameters::{InspectContainerOptions, UploadToContainerOptionsBuilder};
use bytes::Bytes;
use futures::StreamExt;
use tracing::debug;

use crate::error::{DaemonError, Result};

/// Snapshot of a container's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Container id as reported by the runtime.
    pub id: String,
    /// Lowercase state name (running, exited, ...).
    pub status: String,
    /// Whether the container is running.
    pub running: bool,
    /// First routable network address.
    pub ip_address: Option<String>,
    /// Configured working directory.
    pub working_dir: Option<String>,
}

/// Output of a foreground exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).trim().to_string()
    }
}

/// Operations the daemon manager needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Look up a container by name or id.
    ///
    /// Returns [`DaemonError::ContainerNotFound`] when it does not exist.
    async fn inspect(&self, container: &str) -> Result<ContainerInfo>;

    /// Extract a tar archive into `dest_dir` inside the container.
    async fn upload_archive(&self, container: &str, dest_dir: &str, archive: Vec<u8>)
    -> Result<()>;

    /// Run a command and wait for it to finish.
    async fn exec(&self, container: &str, cmd: Vec<String>) -> Result<ExecOutput>;

    /// Start a command without waiting for it.
    async fn exec_detached(&self, container: &str, cmd: Vec<String>) -> Result<()>;

    /// Release the runtime connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// [`ContainerRuntime`] backed by the local Docker engine.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DaemonError::ContainerRuntime(format!("failed to connect: {e}")))?;
        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn runtime_error(container: &str, err: BollardError) -> DaemonError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => DaemonError::ContainerNotFound(container.to_string()),
        other => DaemonError::ContainerRuntime(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, container: &str) -> Result<ContainerInfo> {
        let response = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| runtime_error(container, e))?;

        let state = response.state.unwrap_or_default();
        let status = state
            .status
            .map(|s| format!("{s:?}").to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());

        let ip_address = response
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .and_then(|nets| nets.get("bridge").or_else(|| nets.values().next()))
            .and_then(|net| net.ip_address.as_deref())
            .filter(|ip| !ip.is_empty())
            .map(String::from);

        let working_dir = response
            .config
            .and_then(|c| c.working_dir)
            .filter(|dir| !dir.is_empty());

        Ok(ContainerInfo {
            id: response.id.unwrap_or_else(|| container.to_string()),
            running: state.running.unwrap_or(false),
            status,
            ip_address,
            working_dir,
        })
    }

    async fn upload_archive(
        &self,
        container: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        let options = UploadToContainerOptionsBuilder::new().path(dest_dir).build();
        self.docker
            .upload_to_container(
                container,
                Some(options),
                bollard::body_full(Bytes::from(archive)),
            )
            .await
            .map_err(|e| runtime_error(container, e))
    }

    async fn exec(&self, container: &str, cmd: Vec<String>) -> Result<ExecOutput> {
        let config = ExecConfig {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container, config)
            .await
            .map_err(|e| runtime_error(container, e))?;

        let mut output = Vec::new();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| runtime_error(container, e))?
        {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| runtime_error(container, e))?;
                output.extend_from_slice(&chunk.into_bytes());
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| runtime_error(container, e))?;

        let exit_code = inspect.exit_code.unwrap_or(-1);
        debug!(container, exit_code, "Exec finished");
        Ok(ExecOutput { exit_code, output })
    }

    async fn exec_detached(&self, container: &str, cmd: Vec<String>) -> Result<()> {
        let config = ExecConfig {
            cmd: Some(cmd),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container, config)
            .await
            .map_err(|e| runtime_error(container, e))?;

        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| runtime_error(container, e))?;
        Ok(())
    }
}
