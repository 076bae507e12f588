//! Boundary traits consumed by the resilience core.
//!
//! The transport performs the actual HTTP exchange with the scraping API.
//! The core assumes nothing about the wire format beyond a status code and
//! an optional JSON body.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

/// HTTP method for an upstream exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One outbound exchange, as handed to a [`Transport`].
#[derive(Debug, Clone, Serialize)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Transport-level timeout; the queue enforces its own deadline on top.
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
            timeout: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a completed upstream exchange.
#[derive(Debug, Clone, Serialize)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub data: serde_json::Value,
    /// Wall-clock duration of the exchange as measured by the transport.
    pub duration: Duration,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs an HTTP exchange with the scraping API.
pub trait Transport: Send + Sync + Clone {
    fn request(
        &self,
        request: TransportRequest,
    ) -> impl Future<Output = Result<TransportResponse, ArchiveError>> + Send;
}

/// A no-op transport returning an empty success, for wiring tests.
#[derive(Debug, Clone)]
pub struct NullTransport;

impl Transport for NullTransport {
    async fn request(&self, _request: TransportRequest) -> Result<TransportResponse, ArchiveError> {
        Ok(TransportResponse {
            status: 200,
            status_text: "OK".to_string(),
            headers: Vec::new(),
            data: serde_json::Value::Null,
            duration: Duration::ZERO,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders() {
        let req = TransportRequest::post(
            "https://api.example.com/v1/fetch",
            serde_json::json!({"url": "https://mastodon.social/@a/1"}),
        )
        .with_header("X-Client", "argus")
        .with_timeout(Duration::from_secs(10));

        assert_eq!(req.method, Method::Post);
        assert_eq!(req.headers.len(), 1);
        assert!(req.body.is_some());
        assert_eq!(req.timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_response_success_range() {
        let mut resp = TransportResponse {
            status: 204,
            status_text: "No Content".into(),
            headers: Vec::new(),
            data: serde_json::Value::Null,
            duration: Duration::ZERO,
        };
        assert!(resp.is_success());
        resp.status = 404;
        assert!(!resp.is_success());
    }

    #[tokio::test]
    async fn test_null_transport() {
        let transport = NullTransport;
        let resp = transport
            .request(TransportRequest::get("https://example.com"))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
    }
}
