//! dproxy daemon - lifecycle of the in-sandbox forwarding daemon.
//!
//! This crate provides:
//! - Staging of the daemon executable for the host architecture
//! - Injection into running containers, with fallback to a pre-existing daemon
//! - Host process, remote and mock daemons behind one manager
//! - Request forwarding to `/proxy/{port}` on the daemon
//! - A fleet of managers keyed by sandbox id

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod archive;
pub mod binary;
pub mod config;
pub mod error;
pub mod fleet;
pub mod manager;
pub mod proxy;
pub mod runtime;
pub mod sandbox;

pub use binary::BinaryPreparer;
pub use config::{DaemonConfig, DaemonMode, InjectionMethod, InjectionMode};
pub use error::{BinaryError, DaemonError, InjectionFailed, Result};
pub use fleet::DaemonFleet;
pub use manager::{DaemonHealth, DaemonManager, DaemonState, DaemonStatus};
pub use proxy::{ProxyRequest, ProxyResponse};
pub use runtime::{ContainerInfo, ContainerRuntime, DockerRuntime, ExecOutput};
pub use sandbox::{LocalContainerSandbox, RemoteSessionSandbox, SandboxHandle, SandboxKind};
