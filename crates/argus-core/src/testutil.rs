//! Test utilities: mock implementation of the transport boundary.
//!
//! Handwritten mocks for dependency injection in unit tests. Scripted
//! responses live behind `Arc<Mutex<_>>` so tests can assert on recorded
//! calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ArchiveError;
use crate::traits::{Transport, TransportRequest, TransportResponse};

/// Build a success response with the given JSON payload.
pub fn ok_response(data: serde_json::Value) -> TransportResponse {
    TransportResponse {
        status: 200,
        status_text: "OK".to_string(),
        headers: Vec::new(),
        data,
        duration: Duration::from_millis(1),
    }
}

/// Build a response with an explicit status and JSON payload.
pub fn response_with(status: u16, data: serde_json::Value) -> TransportResponse {
    TransportResponse {
        status,
        status_text: String::new(),
        headers: Vec::new(),
        data,
        duration: Duration::from_millis(1),
    }
}

/// Mock transport that returns scripted responses.
///
/// Each call pops the first scripted element; when the script is empty the
/// last configured default repeats. Every request is recorded for
/// assertions.
#[derive(Clone)]
pub struct MockTransport {
    /// Queue of scripted responses. Each call pops the first element.
    responses: Arc<Mutex<Vec<Result<TransportResponse, ArchiveError>>>>,
    /// Returned once the script is exhausted.
    fallback: Arc<Result<TransportResponse, ArchiveError>>,
    /// Every request handed to the transport, in order.
    pub requests: Arc<Mutex<Vec<TransportRequest>>>,
    delay: Option<Duration>,
}

impl MockTransport {
    /// Always succeed with the given payload.
    pub fn ok(data: serde_json::Value) -> Self {
        Self::from_fallback(Ok(ok_response(data)))
    }

    /// Always return a response with the given status and a `message` body.
    pub fn with_status(status: u16, message: &str) -> Self {
        Self::from_fallback(Ok(response_with(
            status,
            serde_json::json!({"message": message}),
        )))
    }

    /// Always return a response with the given status and payload.
    pub fn with_response(status: u16, data: serde_json::Value) -> Self {
        Self::from_fallback(Ok(response_with(status, data)))
    }

    /// Always fail at the transport level with the given error.
    pub fn with_error(error: ArchiveError) -> Self {
        Self::from_fallback(Err(error))
    }

    /// Script a sequence of outcomes; the last one repeats once exhausted.
    pub fn with_script(responses: Vec<Result<TransportResponse, ArchiveError>>) -> Self {
        let fallback = responses
            .last()
            .cloned()
            .unwrap_or_else(|| Ok(ok_response(serde_json::Value::Null)));
        Self {
            responses: Arc::new(Mutex::new(responses)),
            fallback: Arc::new(fallback),
            requests: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    /// Sleep before answering, to keep requests observably in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn from_fallback(fallback: Result<TransportResponse, ArchiveError>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            fallback: Arc::new(fallback),
            requests: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    /// Number of requests the transport has actually received.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Transport for MockTransport {
    async fn request(&self, request: TransportRequest) -> Result<TransportResponse, ArchiveError> {
        self.requests.lock().unwrap().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        };
        next.unwrap_or_else(|| (*self.fallback).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn test_scripted_responses_then_fallback() {
        let transport = MockTransport::with_script(vec![
            Err(ArchiveError::network("down")),
            Ok(ok_response(serde_json::json!({"n": 1}))),
        ]);

        let first = transport
            .request(TransportRequest::get("https://example.com"))
            .await;
        assert_eq!(first.unwrap_err().code, ErrorCode::Network);

        for _ in 0..2 {
            let next = transport
                .request(TransportRequest::get("https://example.com"))
                .await
                .unwrap();
            assert_eq!(next.data["n"], 1);
        }

        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_records_requests() {
        let transport = MockTransport::ok(serde_json::Value::Null);
        transport
            .request(TransportRequest::get("https://example.com/a"))
            .await
            .unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://example.com/a");
    }
}
