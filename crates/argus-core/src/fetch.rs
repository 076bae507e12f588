//! The full resilience pipeline around every outbound call.
//!
//! Caller → request queue (admission) → circuit breaker (health gate) →
//! transport → error classifier. Admission failures (overflow, duplicate,
//! breaker-open) surface synchronously and never enter the recovery
//! pipeline; failures from the protected call itself are classified, get
//! one recovery pass, and are returned to the caller enriched.

use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics};
use crate::dedup;
use crate::error::{ArchiveError, ErrorCode};
use crate::recovery::{ErrorHandler, ErrorHandlerConfig, ErrorStats};
use crate::request_queue::{AddOptions, Priority, QueueConfig, QueueMetrics, RequestQueue};
use crate::traits::{Transport, TransportRequest, TransportResponse};

/// One "fetch this post" request as submitted by the archiving application.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub request: TransportRequest,
    pub priority: Priority,
    /// Overrides the queue's default per-request budget.
    pub timeout: Option<Duration>,
    /// Reject if an identical request is already in flight.
    pub dedup: bool,
}

impl FetchRequest {
    pub fn new(request: TransportRequest) -> Self {
        Self {
            request,
            priority: Priority::Normal,
            timeout: None,
            dedup: true,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_dedup(mut self) -> Self {
        self.dedup = false;
        self
    }
}

/// Combined point-in-time health snapshot for polling.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub circuit: CircuitMetrics,
    pub queue: QueueMetrics,
    pub errors: ErrorStats,
}

/// Composes the queue, breaker, classifier, and a transport into the
/// archiver's upstream-call surface.
///
/// Generic over the transport via [`Transport`], enabling dependency
/// injection and testability without real HTTP calls.
#[derive(Clone)]
pub struct FetchService<T: Transport> {
    transport: T,
    queue: RequestQueue<TransportResponse>,
    breaker: CircuitBreaker,
    errors: Arc<ErrorHandler>,
}

impl<T: Transport + 'static> FetchService<T> {
    /// Create a service with default queue/breaker/handler configuration.
    pub fn new(transport: T) -> Self {
        Self::with_config(
            transport,
            QueueConfig::default(),
            CircuitBreakerConfig::default(),
            ErrorHandlerConfig::default(),
        )
    }

    pub fn with_config(
        transport: T,
        queue: QueueConfig,
        breaker: CircuitBreakerConfig,
        errors: ErrorHandlerConfig,
    ) -> Self {
        Self {
            transport,
            queue: RequestQueue::new(queue),
            breaker: CircuitBreaker::new("upstream", breaker),
            errors: Arc::new(ErrorHandler::new(errors)),
        }
    }

    /// Run one fetch through the full pipeline.
    pub async fn fetch(&self, fetch: FetchRequest) -> Result<TransportResponse, ArchiveError> {
        let options = AddOptions {
            priority: fetch.priority,
            timeout: fetch.timeout,
            dedup_key: fetch.dedup.then(|| dedup::request_key(&fetch.request)),
        };

        let transport = self.transport.clone();
        let breaker = self.breaker.clone();
        let errors = Arc::clone(&self.errors);
        let request = fetch.request;
        let url = request.url.clone();

        self.queue
            .add(
                move || async move {
                    let result = breaker
                        .call(|| async {
                            let response = transport.request(request).await?;
                            if response.is_success() {
                                Ok(response)
                            } else {
                                Err(upstream_failure(&response))
                            }
                        })
                        .await;

                    match result {
                        Ok(response) => Ok(response),
                        // The breaker protecting itself is not an upstream
                        // failure; skip the recovery pipeline.
                        Err(e) if e.code == ErrorCode::CircuitOpen => Err(e),
                        Err(e) => Err(errors
                            .handle(
                                e.with_operation("fetch").with_context_field("url", url),
                                None,
                            )
                            .await),
                    }
                },
                options,
            )
            .await
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            circuit: self.breaker.metrics(),
            queue: self.queue.metrics(),
            errors: self.errors.stats(),
        }
    }

    /// Graceful shutdown: wait for pending and active work to settle.
    pub async fn drain(&self) {
        self.queue.drain().await;
    }

    pub fn queue(&self) -> &RequestQueue<TransportResponse> {
        &self.queue
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.errors
    }
}

/// Map a non-2xx upstream response to the taxonomy, pulling the most useful
/// message the body offers.
fn upstream_failure(response: &TransportResponse) -> ArchiveError {
    let message = response
        .data
        .get("message")
        .or_else(|| response.data.get("error"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {} {}", response.status, response.status_text));

    ArchiveError::from_status(response.status, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockTransport;

    fn post_request(url: &str) -> FetchRequest {
        FetchRequest::new(TransportRequest::post(
            "https://api.example.com/v1/fetch",
            serde_json::json!({"url": url}),
        ))
    }

    #[tokio::test]
    async fn test_happy_path() {
        let transport = MockTransport::ok(serde_json::json!({"post": {"id": "1"}}));
        let service = FetchService::new(transport.clone());

        let response = service
            .fetch(post_request("https://mastodon.social/@a/1"))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.call_count(), 1);

        let health = service.health();
        assert_eq!(health.queue.completed, 1);
        assert_eq!(health.circuit.successful_requests, 1);
        assert_eq!(health.errors.total, 0);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_classified_and_logged() {
        let transport = MockTransport::with_status(500, "internal error");
        let service = FetchService::new(transport);

        let err = service
            .fetch(post_request("https://mastodon.social/@a/1"))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::UpstreamServer);
        assert!(err.is_retryable());
        assert_eq!(err.context.fields["url"], "https://api.example.com/v1/fetch");

        let health = service.health();
        assert_eq!(health.errors.total, 1);
        assert_eq!(health.circuit.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_duplicate_fetch_rejected_without_classification() {
        let transport =
            MockTransport::ok(serde_json::json!({})).with_delay(Duration::from_millis(50));
        let service = FetchService::new(transport);

        let first = {
            let service = service.clone();
            tokio::spawn(
                async move { service.fetch(post_request("https://x.example/p/1")).await },
            )
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = service
            .fetch(post_request("https://x.example/p/1"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateRequest);
        // Self-protection rejections never reach the error log.
        assert_eq!(service.health().errors.total, 0);

        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_non_2xx_body_message_is_surfaced() {
        let transport = MockTransport::with_response(
            404,
            serde_json::json!({"message": "post was deleted"}),
        );
        let service = FetchService::new(transport);

        let err = service
            .fetch(post_request("https://x.example/p/404"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.message, "post was deleted");
    }
}
