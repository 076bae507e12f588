//! Circuit breaker pattern for scraping-API resilience.
//!
//! Protects against cascading failures when the upstream scraping API
//! experiences issues.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <---------------------------[success]----------------------------+
//! ```
//!
//! The OPEN → HALF_OPEN transition is lazy: it happens on the next call (or
//! metrics read) after the recovery timeout has elapsed, never via a
//! background timer.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - limited requests allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Number of successful probes in half-open state to close the circuit.
    pub success_threshold: u32,

    /// Time to wait in Open before the next call is allowed through as a probe.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Internal state tracking for the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_time: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_state_change_time: Instant,
    last_state_change_at: DateTime<Utc>,
    last_error_message: Option<String>,
}

impl CircuitBreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_time: None,
            last_failure_at: None,
            last_state_change_time: Instant::now(),
            last_state_change_at: Utc::now(),
            last_error_message: None,
        }
    }

    fn change_state(&mut self, state: CircuitState) {
        self.state = state;
        self.last_state_change_time = Instant::now();
        self.last_state_change_at = Utc::now();
    }
}

/// Point-in-time snapshot of breaker counters for monitoring.
///
/// Taken under a single lock acquisition, so the counters are mutually
/// consistent and cheap to poll.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// successful / total; 0.0 when no requests have been made.
    pub success_rate: f64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Remaining wait before the next probe is allowed. `None` unless Open.
    pub time_until_half_open: Option<Duration>,
}

/// Thread-safe circuit breaker for protecting upstream API calls.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(CircuitBreakerInner::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open = if inner.state == CircuitState::Open {
            Some(self.remaining_open_time(&inner))
        } else {
            None
        };

        let success_rate = if inner.total_requests == 0 {
            0.0
        } else {
            inner.successful_requests as f64 / inner.total_requests as f64
        };

        CircuitMetrics {
            name: self.name.clone(),
            state: inner.state,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            success_rate,
            last_failure: inner.last_failure_at,
            last_state_change: inner.last_state_change_at,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: rejects immediately with a `CircuitOpen` error; the operation
    ///   is never invoked
    /// - HalfOpen: executes operation, transitions based on result
    ///
    /// Every invocation counts toward `total_requests`, including rejected
    /// ones.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, ArchiveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ArchiveError>>,
    {
        // Check if we should allow the request
        {
            let mut inner = self.lock_inner();
            inner.total_requests += 1;
            self.maybe_transition_to_half_open(&mut inner);

            if inner.state == CircuitState::Open {
                let retry_after = self.remaining_open_time(&inner);
                drop(inner);
                tracing::debug!(circuit = %self.name, "Rejecting call while circuit is open");
                return Err(ArchiveError::circuit_open(retry_after)
                    .with_operation(self.name.clone()));
            }
        }

        // Execute the operation
        let result = operation().await;

        // Record the result
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_failure(e),
        }

        result
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        inner.successful_requests += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker closing after {} successful probes",
                        inner.consecutive_successes
                    );
                    inner.change_state(CircuitState::Closed);
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.last_error_message = None;
                }
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes += 1;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &ArchiveError) {
        let mut inner = self.lock_inner();
        inner.failed_requests += 1;
        inner.consecutive_successes = 0;

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                inner.last_failure_time = Some(Instant::now());
                inner.last_failure_at = Some(Utc::now());
                inner.last_error_message = Some(error.to_string());

                if inner.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.consecutive_failures
                    );
                    inner.change_state(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.consecutive_failures += 1;
                inner.last_failure_time = Some(Instant::now());
                inner.last_failure_at = Some(Utc::now());
                inner.last_error_message = Some(error.to_string());
                inner.change_state(CircuitState::Open);
            }
            CircuitState::Open => {
                // A call admitted before the circuit reopened can still settle here.
                inner.last_error_message = Some(error.to_string());
            }
        }
    }

    /// Force the circuit closed and zero all counters. Administrative
    /// override, not used by normal flow.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        inner.change_state(CircuitState::Closed);
        inner.total_requests = 0;
        inner.successful_requests = 0;
        inner.failed_requests = 0;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.last_failure_time = None;
        inner.last_failure_at = None;
        inner.last_error_message = None;
    }

    fn remaining_open_time(&self, inner: &CircuitBreakerInner) -> Duration {
        let elapsed = inner.last_state_change_time.elapsed();
        if elapsed < self.config.timeout {
            self.config.timeout - elapsed
        } else {
            Duration::ZERO
        }
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && inner.last_state_change_time.elapsed() >= self.config.timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.change_state(CircuitState::HalfOpen);
            inner.consecutive_successes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_error() -> ArchiveError {
        ArchiveError::network("test")
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_open());
    }

    #[test]
    fn test_circuit_opens_after_threshold_failures() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..3 {
            cb.record_failure(&network_error());
        }

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_circuit_stays_closed_below_threshold() {
        let config = CircuitBreakerConfig {
            failure_threshold: 5,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..4 {
            cb.record_failure(&network_error());
        }

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let config = CircuitBreakerConfig {
            failure_threshold: 5,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..4 {
            cb.record_failure(&network_error());
        }

        cb.record_success();

        for _ in 0..4 {
            cb.record_failure(&network_error());
        }

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_transitions_to_half_open() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure(&network_error());
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_on_success() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            timeout: Duration::from_millis(1),
        };
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure(&network_error());
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);

        let metrics = cb.metrics();
        assert_eq!(metrics.consecutive_failures, 0);
        assert_eq!(metrics.consecutive_successes, 0);
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            timeout: Duration::from_millis(1),
        };
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure(&network_error());
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure(&network_error());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().consecutive_successes, 0);
    }

    #[test]
    fn test_manual_reset() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(300),
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure(&network_error());
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        let metrics = cb.metrics();
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.failed_requests, 0);
        assert_eq!(metrics.consecutive_failures, 0);
    }

    #[test]
    fn test_success_rate() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.metrics().success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_call_returns_open_error_when_circuit_open() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);
        cb.record_failure(&network_error());

        let result = cb
            .call(|| async { Ok::<_, ArchiveError>("should not execute".to_string()) })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::CircuitOpen);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_rejected_calls_still_count_toward_totals() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);
        cb.record_failure(&network_error());

        let _ = cb.call(|| async { Ok::<_, ArchiveError>(()) }).await;
        let _ = cb.call(|| async { Ok::<_, ArchiveError>(()) }).await;

        let metrics = cb.metrics();
        assert_eq!(metrics.total_requests, 2);
        // Neither rejected call executed, so no new success/failure recorded.
        assert_eq!(metrics.successful_requests, 0);
    }

    #[tokio::test]
    async fn test_call_executes_when_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());

        let result = cb
            .call(|| async { Ok::<_, ArchiveError>("success".to_string()) })
            .await;

        assert_eq!(result.unwrap(), "success");
        let metrics = cb.metrics();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_call_records_failure() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        let _ = cb
            .call(|| async { Err::<String, _>(ArchiveError::network("fail")) })
            .await;

        let metrics = cb.metrics();
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.consecutive_failures, 1);
        assert!(metrics.last_failure.is_some());
    }
}
