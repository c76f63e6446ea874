//! Integration tests for the daemon lifecycle: start → forward → status → stop.
//!
//! Covers:
//! - Mock mode against a wiremock daemon
//! - Container injection through a fake runtime, including fallback
//! - Fatal container conditions
//! - The per-sandbox fleet

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use reqwest::StatusCode;
use wiremock::matchers::{body_string, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dproxy_daemon::{
    ContainerInfo, ContainerRuntime, DaemonConfig, DaemonError, DaemonFleet, DaemonHealth,
    DaemonManager, DaemonState, ExecOutput, InjectionMode, ProxyRequest, SandboxHandle,
};

// =============================================================================
// Fake container runtime
// =============================================================================

#[derive(Default)]
struct Calls {
    uploads: Vec<(String, String, Vec<u8>)>,
    execs: Vec<Vec<String>>,
    detached: Vec<Vec<String>>,
    closed: usize,
}

struct FakeRuntime {
    info: Option<ContainerInfo>,
    fail_upload: bool,
    daemon_already_running: bool,
    calls: StdMutex<Calls>,
}

impl FakeRuntime {
    fn running(ip: Option<&str>) -> Self {
        Self {
            info: Some(ContainerInfo {
                id: "c0ffee".to_string(),
                status: "running".to_string(),
                running: true,
                ip_address: ip.map(String::from),
                working_dir: None,
            }),
            fail_upload: false,
            daemon_already_running: false,
            calls: StdMutex::new(Calls::default()),
        }
    }

    fn exited() -> Self {
        let mut runtime = Self::running(Some("127.0.0.1"));
        if let Some(info) = runtime.info.as_mut() {
            info.running = false;
            info.status = "exited".to_string();
        }
        runtime
    }

    fn missing() -> Self {
        Self {
            info: None,
            ..Self::running(None)
        }
    }

    fn failing_upload(mut self) -> Self {
        self.fail_upload = true;
        self
    }

    fn upload_count(&self) -> usize {
        self.calls.lock().unwrap().uploads.len()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect(&self, container: &str) -> dproxy_daemon::Result<ContainerInfo> {
        self.info
            .clone()
            .ok_or_else(|| DaemonError::ContainerNotFound(container.to_string()))
    }

    async fn upload_archive(
        &self,
        container: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> dproxy_daemon::Result<()> {
        if self.fail_upload {
            return Err(DaemonError::ContainerRuntime("read-only filesystem".into()));
        }
        self.calls.lock().unwrap().uploads.push((
            container.to_string(),
            dest_dir.to_string(),
            archive,
        ));
        Ok(())
    }

    async fn exec(&self, _container: &str, cmd: Vec<String>) -> dproxy_daemon::Result<ExecOutput> {
        let exit_code = if cmd.first().map(String::as_str) == Some("pgrep") {
            if self.daemon_already_running { 0 } else { 1 }
        } else {
            0
        };
        self.calls.lock().unwrap().execs.push(cmd);
        Ok(ExecOutput {
            exit_code,
            output: Vec::new(),
        })
    }

    async fn exec_detached(&self, _container: &str, cmd: Vec<String>) -> dproxy_daemon::Result<()> {
        self.calls.lock().unwrap().detached.push(cmd);
        Ok(())
    }

    async fn close(&self) -> dproxy_daemon::Result<()> {
        self.calls.lock().unwrap().closed += 1;
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn daemon_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": "1.2.3"})))
        .mount(&server)
        .await;
    server
}

fn port_of(server: &MockServer) -> u16 {
    server.address().port()
}

fn fake_source() -> (tempfile::TempDir, DaemonConfig) {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("daemon-build");
    std::fs::write(&source, b"\x7fELF fake daemon").unwrap();

    let config = DaemonConfig {
        binary_source_path: source,
        staging_dir: Some(tmp.path().join("staging")),
        startup_timeout: 5,
        ..DaemonConfig::docker("sandbox-1")
    };
    (tmp, config)
}

// =============================================================================
// Mock mode
// =============================================================================

#[tokio::test]
async fn test_mock_mode_start_and_forward() {
    let server = daemon_server().await;
    Mock::given(method("POST"))
        .and(path("/proxy/8080/api/items"))
        .and(query_param("page", "2"))
        .and(body_string("{\"name\":\"x\"}"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("x-upstream", "yes")
                .set_body_string("created"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let manager = DaemonManager::new(DaemonConfig::mock(server.uri())).unwrap();
    manager.start().await.unwrap();
    assert!(manager.is_running().await);

    let response = manager
        .proxy_request(ProxyRequest {
            port: 8080,
            path: "api/items".to_string(),
            method: Method::POST,
            headers: Default::default(),
            body: Some(Bytes::from_static(b"{\"name\":\"x\"}")),
            query: Some("page=2".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.headers.get("x-upstream").unwrap(), "yes");
    assert_eq!(response.body, Bytes::from_static(b"created"));

    let status = manager.status().await;
    assert_eq!(status.status, DaemonHealth::Running);
    assert_eq!(status.version.as_deref(), Some("1.2.3"));
    assert_eq!(status.url, server.uri());

    manager.stop().await;
    assert_eq!(manager.state().await, DaemonState::Stopped);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let server = daemon_server().await;
    let manager = DaemonManager::new(DaemonConfig::mock(server.uri())).unwrap();
    manager.start().await.unwrap();
    manager.start().await.unwrap();
    assert!(manager.is_running().await);
}

#[tokio::test]
async fn test_upstream_error_status_is_returned_not_retried() {
    let server = daemon_server().await;
    Mock::given(method("GET"))
        .and(path("/proxy/3000"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&server)
        .await;

    let manager = DaemonManager::new(DaemonConfig::mock(server.uri())).unwrap();
    manager.start().await.unwrap();

    let response = manager.proxy_request(ProxyRequest::get(3000, "")).await.unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.body, Bytes::from_static(b"boom"));
}

#[tokio::test]
async fn test_proxy_when_not_running() {
    let manager = DaemonManager::new(DaemonConfig::mock("http://127.0.0.1:9")).unwrap();
    let err = manager.proxy_request(ProxyRequest::get(8080, "")).await.unwrap_err();
    assert!(matches!(err, DaemonError::NotRunning));
}

#[tokio::test]
async fn test_startup_timeout_leaves_manager_stopped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = DaemonConfig {
        startup_timeout: 1,
        ..DaemonConfig::mock(server.uri())
    };
    let manager = DaemonManager::new(config).unwrap();

    let err = manager.start().await.unwrap_err();
    match err {
        DaemonError::StartupTimeout { elapsed } => assert!(elapsed >= Duration::from_secs(1)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(manager.state().await, DaemonState::Stopped);
    assert_eq!(manager.status().await.status, DaemonHealth::Stopped);
}

#[tokio::test]
async fn test_status_reports_http_error() {
    let server = daemon_server().await;
    let manager = DaemonManager::new(DaemonConfig::mock(server.uri())).unwrap();
    manager.start().await.unwrap();

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let status = manager.status().await;
    assert_eq!(status.status, DaemonHealth::Error);
    assert_eq!(status.error.as_deref(), Some("HTTP 500"));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let server = daemon_server().await;
    let manager = DaemonManager::new(DaemonConfig::mock(server.uri())).unwrap();
    manager.stop().await;
    manager.start().await.unwrap();
    manager.stop().await;
    manager.stop().await;
    assert!(!manager.is_running().await);
}

// =============================================================================
// Docker mode
// =============================================================================

#[tokio::test]
async fn test_volume_injection_copies_and_launches() {
    let server = daemon_server().await;
    let (tmp, mut config) = fake_source();
    config.port = port_of(&server);

    let runtime = Arc::new(FakeRuntime::running(Some("127.0.0.1")));
    let manager = DaemonManager::with_runtime(config, runtime.clone()).unwrap();
    manager.start().await.unwrap();

    assert_eq!(manager.base_url().await, server.uri());
    {
        let calls = runtime.calls.lock().unwrap();
        assert_eq!(calls.uploads.len(), 1);
        let (container, dest, archive) = &calls.uploads[0];
        assert_eq!(container, "sandbox-1");
        assert_eq!(dest, "/usr/local/bin");

        let mut archive = tar::Archive::new(archive.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["daytona".to_string()]);

        assert!(calls.execs.iter().any(|cmd| cmd == &vec![
            "chmod".to_string(),
            "+x".to_string(),
            "/usr/local/bin/daytona".to_string()
        ]));
        assert_eq!(calls.detached.len(), 1);
        assert!(calls.detached[0][2].ends_with(&format!("daemon --port {}", port_of(&server))));
    }

    let staging = tmp.path().join("staging");
    assert!(staging.exists());
    manager.stop().await;
    assert!(!staging.exists());
    assert_eq!(runtime.calls.lock().unwrap().closed, 1);
}

#[tokio::test]
async fn test_volume_injection_skips_launch_when_daemon_present() {
    let server = daemon_server().await;
    let (_tmp, mut config) = fake_source();
    config.port = port_of(&server);

    let mut fake = FakeRuntime::running(Some("127.0.0.1"));
    fake.daemon_already_running = true;
    let runtime = Arc::new(fake);
    let manager = DaemonManager::with_runtime(config, runtime.clone()).unwrap();
    manager.start().await.unwrap();

    assert!(runtime.calls.lock().unwrap().detached.is_empty());
}

#[tokio::test]
async fn test_failed_upload_falls_back_to_direct() {
    let server = daemon_server().await;
    let (_tmp, mut config) = fake_source();
    config.port = port_of(&server);

    let runtime = Arc::new(FakeRuntime::running(Some("127.0.0.1")).failing_upload());
    let manager = DaemonManager::with_runtime(config, runtime.clone()).unwrap();
    manager.start().await.unwrap();

    assert!(manager.is_running().await);
    assert_eq!(manager.base_url().await, server.uri());
    assert!(runtime.calls.lock().unwrap().detached.is_empty());
}

#[tokio::test]
async fn test_failed_upload_without_address_is_fatal() {
    let (_tmp, config) = fake_source();
    let runtime = Arc::new(FakeRuntime::running(None).failing_upload());
    let manager = DaemonManager::with_runtime(config, runtime.clone()).unwrap();

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, DaemonError::NoIpAddress(ref c) if c == "sandbox-1"));
    assert_eq!(manager.state().await, DaemonState::Stopped);
    assert_eq!(runtime.calls.lock().unwrap().closed, 1);
}

#[tokio::test]
async fn test_direct_mode_never_injects() {
    let server = daemon_server().await;
    let (_tmp, mut config) = fake_source();
    config.port = port_of(&server);
    config.injection_mode = InjectionMode::Direct;

    let runtime = Arc::new(FakeRuntime::running(Some("127.0.0.1")));
    let manager = DaemonManager::with_runtime(config, runtime.clone()).unwrap();
    manager.start().await.unwrap();

    assert_eq!(runtime.upload_count(), 0);
    assert!(runtime.calls.lock().unwrap().execs.is_empty());
}

#[tokio::test]
async fn test_stopped_container_is_fatal() {
    let (_tmp, config) = fake_source();
    let runtime = Arc::new(FakeRuntime::exited());
    let manager = DaemonManager::with_runtime(config, runtime.clone()).unwrap();

    let err = manager.start().await.unwrap_err();
    assert!(matches!(
        err,
        DaemonError::ContainerNotRunning { ref status, .. } if status == "exited"
    ));
    assert_eq!(runtime.upload_count(), 0);
}

#[tokio::test]
async fn test_missing_container_is_fatal() {
    let (_tmp, config) = fake_source();
    let manager = DaemonManager::with_runtime(config, Arc::new(FakeRuntime::missing())).unwrap();

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, DaemonError::ContainerNotFound(ref c) if c == "sandbox-1"));
    assert!(!manager.is_running().await);
}

// =============================================================================
// Fleet
// =============================================================================

#[tokio::test]
async fn test_fleet_attach_detach_teardown() {
    let server = daemon_server().await;
    let (_tmp, mut template) = fake_source();
    template.port = port_of(&server);

    let runtime = Arc::new(FakeRuntime::running(Some("127.0.0.1")));
    let fleet = DaemonFleet::new(template).with_runtime(runtime.clone());

    let local = SandboxHandle::local_container("box-a");
    let remote = SandboxHandle::remote_session("sess-b", server.uri());

    let first = fleet.attach(&local).await.unwrap();
    let again = fleet.attach(&local).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(runtime.upload_count(), 1);

    let remote_manager = fleet.attach(&remote).await.unwrap();
    assert_eq!(remote_manager.base_url().await, server.uri());
    assert_eq!(fleet.ids().await, vec!["box-a".to_string(), "sess-b".to_string()]);

    assert!(fleet.detach("box-a").await);
    assert!(!fleet.detach("box-a").await);
    assert!(!first.is_running().await);
    assert!(fleet.manager("box-a").await.is_none());

    fleet.teardown().await;
    assert!(fleet.is_empty().await);
    assert!(!remote_manager.is_running().await);
}

#[tokio::test]
async fn test_fleet_does_not_register_failed_start() {
    let (_tmp, template) = fake_source();
    let fleet = DaemonFleet::new(template).with_runtime(Arc::new(FakeRuntime::missing()));

    let result = fleet.attach(&SandboxHandle::local_container("gone")).await;
    assert!(result.is_err());
    assert_eq!(fleet.len().await, 0);
}

#[tokio::test]
async fn test_slow_attach_does_not_block_other_sandboxes() {
    let ready = daemon_server().await;
    // Answers 404 to /version, so this daemon never becomes ready.
    let stuck = MockServer::start().await;

    let (_tmp, mut template) = fake_source();
    template.startup_timeout = 3;
    let fleet = Arc::new(DaemonFleet::new(template));

    let slow = {
        let fleet = Arc::clone(&fleet);
        let sandbox = SandboxHandle::remote_session("stuck", stuck.uri());
        tokio::spawn(async move { fleet.attach(&sandbox).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let fast = tokio::time::timeout(
        Duration::from_secs(2),
        fleet.attach(&SandboxHandle::remote_session("ready", ready.uri())),
    )
    .await
    .expect("attach waited on another sandbox")
    .unwrap();
    assert!(fast.is_running().await);

    let err = slow.await.unwrap().unwrap_err();
    assert!(matches!(err, DaemonError::StartupTimeout { .. }));
    assert_eq!(fleet.ids().await, vec!["ready".to_string()]);
}
