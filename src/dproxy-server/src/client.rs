//! HTTP client for a running gateway.

use std::time::Duration;

use dproxy_preview::{LinkStats, PreviewLink};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::api::CreateLinkRequest;

/// Port of the in-sandbox VNC web client.
pub const VNC_PORT: u16 = 6080;

/// Port conventionally used for the sandbox's website.
pub const WEBSITE_PORT: u16 = 8080;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// `GET /health` as seen by a client.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub uptime: f64,
    pub request_count: u64,
    pub error_count: u64,
    pub daemon: serde_json::Value,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Client for the gateway's management API.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> ClientResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("dproxy-client/", env!("CARGO_PKG_VERSION")))
            .timeout(DEFAULT_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            client,
        })
    }

    /// Send `Authorization: Bearer {key}` with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    pub async fn create_preview_link(&self, port: u16) -> ClientResult<PreviewLink> {
        self.create(CreateLinkRequest {
            port: Some(port),
            expires_in: None,
        })
        .await
    }

    pub async fn create_preview_link_with_ttl(
        &self,
        port: u16,
        expires_in: Duration,
    ) -> ClientResult<PreviewLink> {
        self.create(CreateLinkRequest {
            port: Some(port),
            expires_in: Some(expires_in.as_secs()),
        })
        .await
    }

    async fn create(&self, body: CreateLinkRequest) -> ClientResult<PreviewLink> {
        let response = self
            .request(reqwest::Method::POST, "/api/preview/create")
            .json(&body)
            .send()
            .await?;
        json_or_status(response).await
    }

    /// Link to the sandbox's VNC web client.
    pub async fn vnc_preview_link(&self) -> ClientResult<PreviewLink> {
        self.create_preview_link(VNC_PORT).await
    }

    /// Link to the sandbox's website.
    pub async fn website_preview_link(&self) -> ClientResult<PreviewLink> {
        self.create_preview_link(WEBSITE_PORT).await
    }

    /// Revoke `token`. Returns false if the gateway did not know it.
    pub async fn revoke_preview_link(&self, token: &str) -> ClientResult<bool> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/api/preview/{token}"))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(status_error(response).await),
        }
    }

    pub async fn preview_stats(&self) -> ClientResult<LinkStats> {
        let response = self
            .request(reqwest::Method::GET, "/api/preview/stats")
            .send()
            .await?;
        json_or_status(response).await
    }

    /// Gateway health. An unhealthy gateway still yields a report.
    pub async fn health(&self) -> ClientResult<HealthReport> {
        let response = self.request(reqwest::Method::GET, "/health").send().await?;
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(response.json().await?);
        }
        json_or_status(response).await
    }
}

async fn json_or_status<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    if response.status().is_success() {
        Ok(response.json().await?)
    } else {
        Err(status_error(response).await)
    }
}

async fn status_error(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ClientError::Status { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn link_json(port: u16) -> serde_json::Value {
        serde_json::json!({
            "token": "tok",
            "port": port,
            "url": "http://gw/preview/tok",
            "expires_at": 1_700_000_000
        })
    }

    #[tokio::test]
    async fn test_create_preview_link() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/preview/create"))
            .and(body_json(serde_json::json!({"port": 6080, "expires_in": null})))
            .and(header("authorization", "Bearer k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(link_json(6080)))
            .expect(1)
            .mount(&server)
            .await;

        let client = GatewayClient::new(server.uri()).unwrap().with_api_key("k");
        let link = client.vnc_preview_link().await.unwrap();
        assert_eq!(link.port, 6080);
        assert_eq!(link.token, "tok");
        assert_eq!(link.expires_at.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_revoke_unknown_is_false() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/preview/nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/preview/yes"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"message": "Preview link revoked"})),
            )
            .mount(&server)
            .await;

        let client = GatewayClient::new(server.uri()).unwrap();
        assert!(!client.revoke_preview_link("nope").await.unwrap());
        assert!(client.revoke_preview_link("yes").await.unwrap());
    }

    #[tokio::test]
    async fn test_error_status_surfaces_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/preview/stats"))
            .respond_with(ResponseTemplate::new(500).set_body_string("broken"))
            .mount(&server)
            .await;

        let client = GatewayClient::new(format!("{}/", server.uri())).unwrap();
        match client.preview_stats().await {
            Err(ClientError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "broken");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unhealthy_gateway_still_reports() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "status": "unhealthy",
                "uptime": 1.5,
                "request_count": 4,
                "error_count": 1,
                "daemon": {"status": "stopped", "url": "http://localhost:2280"}
            })))
            .mount(&server)
            .await;

        let client = GatewayClient::new(server.uri()).unwrap();
        let report = client.health().await.unwrap();
        assert!(!report.is_healthy());
        assert_eq!(report.request_count, 4);
        assert_eq!(report.daemon["status"], "stopped");
    }
}
