//! HTTP transport backed by reqwest.
//!
//! Maps transport-level failures and non-2xx statuses into the core error
//! taxonomy, and measures the wall-clock duration of every exchange.

use std::time::{Duration, Instant};

use argus_core::error::ArchiveError;
use argus_core::traits::{Method, Transport, TransportRequest, TransportResponse};
use reqwest::Client;
use serde::Deserialize;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_USER_AGENT: &str = "Argus/0.1 (Social Archiver)";

/// Error body shapes the scraping API is known to return.
#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Deserialize)]
struct FlatApiError {
    message: String,
}

/// HTTP transport using reqwest.
///
/// Exchanges JSON with the scraping API with a configurable bearer token,
/// User-Agent, and timeout. Per-request timeouts on the
/// [`TransportRequest`] override the client-level default.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout: Duration,
    api_key: Option<String>,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, ArchiveError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ArchiveError> {
        let client = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ArchiveError::network("Failed to build HTTP client").with_detail(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            api_key: None,
        })
    }

    /// Attach a bearer token sent with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Extract the most useful message from an error body.
    fn error_message(status: u16, body: &str) -> String {
        serde_json::from_str::<ApiError>(body)
            .map(|e| e.error.message)
            .or_else(|_| serde_json::from_str::<FlatApiError>(body).map(|e| e.message))
            .unwrap_or_else(|_| format!("HTTP {}: {}", status, body))
    }
}

impl Transport for ReqwestTransport {
    async fn request(&self, request: TransportRequest) -> Result<TransportResponse, ArchiveError> {
        let started = Instant::now();
        let timeout = request.timeout.unwrap_or(self.timeout);

        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        builder = builder.timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {api_key}"));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ArchiveError::timeout(timeout)
            } else if e.is_connect() {
                ArchiveError::network(format!("Connection failed: {e}"))
            } else {
                ArchiveError::network("HTTP request failed").with_detail(e.to_string())
            }
        })?;

        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or_default().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let body = response.text().await.map_err(|e| {
            ArchiveError::network("Failed to read response body").with_detail(e.to_string())
        })?;

        if !status.is_success() {
            let message = Self::error_message(status.as_u16(), &body);
            tracing::debug!(status = status.as_u16(), %message, "Upstream returned error status");
            return Err(ArchiveError::from_status(status.as_u16(), message)
                .with_context_field("url", request.url));
        }

        // Non-JSON success bodies are carried as a JSON string.
        let data = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body))
        };

        Ok(TransportResponse {
            status: status.as_u16(),
            status_text,
            headers,
            data,
            duration: started.elapsed(),
        })
    }
}
