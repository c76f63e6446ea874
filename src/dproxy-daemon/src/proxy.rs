//! Request and response types for forwarding through the daemon.

use bytes::Bytes;
use reqwest::Method;
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap};

/// A request to forward to a port inside the sandbox.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Target port inside the sandbox.
    pub port: u16,
    /// Path below the port root, without a leading slash.
    pub path: String,
    pub method: Method,
    /// Caller headers. `Host` and `Content-Length` are never forwarded.
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
}

impl ProxyRequest {
    /// A bodiless GET for `port` and `path`.
    pub fn get(port: u16, path: impl Into<String>) -> Self {
        Self {
            port,
            path: path.into(),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            query: None,
        }
    }

    /// Full daemon URL for this request.
    pub fn target_url(&self, base_url: &str) -> String {
        let mut url = format!("{}/proxy/{}", base_url.trim_end_matches('/'), self.port);
        let path = self.path.trim_start_matches('/');
        if !path.is_empty() {
            url.push('/');
            url.push_str(path);
        }
        if let Some(query) = self.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// Headers to send downstream.
    pub fn forwarded_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        headers
    }
}

/// The daemon's response, unmodified.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_target_url_root() {
        let req = ProxyRequest::get(8080, "");
        assert_eq!(
            req.target_url("http://daemon:2280/"),
            "http://daemon:2280/proxy/8080"
        );
    }

    #[test]
    fn test_target_url_with_path_and_query() {
        let mut req = ProxyRequest::get(3000, "/assets/app.js");
        req.query = Some("v=2&x=y".to_string());
        assert_eq!(
            req.target_url("http://daemon:2280"),
            "http://daemon:2280/proxy/3000/assets/app.js?v=2&x=y"
        );
    }

    #[test]
    fn test_empty_query_is_dropped() {
        let mut req = ProxyRequest::get(3000, "a");
        req.query = Some(String::new());
        assert_eq!(req.target_url("http://d"), "http://d/proxy/3000/a");
    }

    #[test]
    fn test_host_and_content_length_stripped() {
        let mut req = ProxyRequest::get(1, "");
        req.headers
            .insert(header::HOST, HeaderValue::from_static("gateway"));
        req.headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        req.headers
            .insert(header::ACCEPT, HeaderValue::from_static("text/html"));

        let forwarded = req.forwarded_headers();
        assert!(forwarded.get(header::HOST).is_none());
        assert!(forwarded.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(forwarded.get(header::ACCEPT).unwrap(), "text/html");
    }
}
