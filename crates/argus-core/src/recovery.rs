//! Error classification, bounded diagnostics log, and automated recovery.
//!
//! [`ErrorHandler`] is the single funnel for failures from the protected
//! call: it normalizes them into [`ArchiveError`], appends them to a
//! FIFO-bounded rolling log, attempts a registered recovery strategy at most
//! once per occurrence, and returns the (possibly enriched) error to the
//! caller. Recovery affects bookkeeping and side effects, never the return
//! value.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ArchiveError, ErrorCode, ErrorContext, Severity};

/// Registered recovery callback for one error code.
///
/// Returns `Ok(true)` to signal successful recovery. `Ok(false)` and `Err`
/// both leave the occurrence unrecovered; an `Err` is swallowed by the
/// handler and never propagates.
pub type RecoveryStrategy = Arc<
    dyn Fn(&ArchiveError) -> Pin<Box<dyn Future<Output = Result<bool, ArchiveError>> + Send>>
        + Send
        + Sync,
>;

/// Fire-and-forget notification hook invoked for every handled error.
pub type OnErrorCallback = Arc<dyn Fn(&ArchiveError) + Send + Sync>;

/// Configuration for the error handler.
#[derive(Clone)]
pub struct ErrorHandlerConfig {
    /// Keep handled errors in the in-memory diagnostics log.
    pub enable_logging: bool,
    /// Emit handled errors through `tracing`.
    pub enable_telemetry: bool,
    /// Rolling-log capacity; oldest entries are evicted first.
    pub max_log_entries: usize,
    pub on_error: Option<OnErrorCallback>,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            enable_logging: true,
            enable_telemetry: true,
            max_log_entries: 100,
            on_error: None,
        }
    }
}

impl std::fmt::Debug for ErrorHandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandlerConfig")
            .field("enable_logging", &self.enable_logging)
            .field("enable_telemetry", &self.enable_telemetry)
            .field("max_log_entries", &self.max_log_entries)
            .field("on_error", &self.on_error.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// One handled failure in the rolling log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub error: ArchiveError,
    /// Whether a recovery strategy reported success for this occurrence.
    pub recovered: bool,
}

/// Aggregate counters over the retained log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total: usize,
    pub by_code: HashMap<ErrorCode, usize>,
    pub by_severity: HashMap<Severity, usize>,
    pub recovered: usize,
    /// recovered / total; 0.0 when the log is empty.
    pub recovery_rate: f64,
}

struct HandlerState {
    log: VecDeque<LogEntry>,
    strategies: HashMap<ErrorCode, RecoveryStrategy>,
}

/// Normalizes failures, keeps a bounded diagnostics log, and runs
/// registered recovery strategies.
#[derive(Clone)]
pub struct ErrorHandler {
    config: ErrorHandlerConfig,
    state: Arc<Mutex<HandlerState>>,
}

impl ErrorHandler {
    pub fn new(config: ErrorHandlerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HandlerState {
                log: VecDeque::new(),
                strategies: HashMap::new(),
            })),
        }
    }

    /// Acquires the state lock, recovering from poison if necessary.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned error-handler mutex");
            poisoned.into_inner()
        })
    }

    /// Register a recovery strategy for one error code.
    ///
    /// The strategy runs at most once per handled occurrence, and only when
    /// the error is retryable.
    pub fn register_recovery_strategy<F, Fut>(&self, code: ErrorCode, strategy: F)
    where
        F: Fn(&ArchiveError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, ArchiveError>> + Send + 'static,
    {
        let boxed: RecoveryStrategy = Arc::new(move |error| Box::pin(strategy(error)));
        self.lock_state().strategies.insert(code, boxed);
    }

    /// Normalize, log, and (maybe) attempt recovery for a failure.
    ///
    /// Anything convertible into [`ArchiveError`] is accepted; foreign
    /// errors wrap as `Unknown`/medium severity. The returned error is what
    /// the caller should surface, regardless of recovery outcome.
    pub async fn handle<E>(&self, error: E, context: Option<ErrorContext>) -> ArchiveError
    where
        E: Into<ArchiveError>,
    {
        let mut error = error.into();
        if let Some(context) = context {
            // Shallow merge; keys set upstream win.
            error.merge_context(context);
        }

        let entry_id = Uuid::new_v4();
        let strategy = {
            let mut state = self.lock_state();
            if self.config.enable_logging {
                state.log.push_back(LogEntry {
                    id: entry_id,
                    timestamp: Utc::now(),
                    error: error.clone(),
                    recovered: false,
                });
                while state.log.len() > self.config.max_log_entries {
                    state.log.pop_front();
                }
            }
            if error.is_retryable() {
                state.strategies.get(&error.code).cloned()
            } else {
                None
            }
        };

        if let Some(strategy) = strategy {
            match strategy(&error).await {
                Ok(true) => {
                    tracing::info!(code = %error.code, "Recovery strategy succeeded");
                    let mut state = self.lock_state();
                    if let Some(entry) = state.log.iter_mut().find(|e| e.id == entry_id) {
                        entry.recovered = true;
                    }
                }
                Ok(false) => {
                    tracing::debug!(code = %error.code, "Recovery strategy declined");
                }
                Err(strategy_err) => {
                    // A failing recovery attempt never propagates.
                    tracing::warn!(
                        code = %error.code,
                        strategy_error = %strategy_err,
                        "Recovery strategy failed"
                    );
                }
            }
        }

        if let Some(on_error) = &self.config.on_error {
            on_error(&error);
        }

        if self.config.enable_telemetry {
            match error.severity {
                Severity::Low => {
                    tracing::debug!(code = %error.code, error = %error, "Handled error");
                }
                Severity::Medium => {
                    tracing::warn!(code = %error.code, error = %error, "Handled error");
                }
                Severity::High | Severity::Critical => {
                    tracing::error!(code = %error.code, error = %error, "Handled error");
                }
            }
        }

        error
    }

    /// True only for typed errors whose `retryable` flag is set.
    pub fn should_retry(&self, error: &ArchiveError) -> bool {
        error.is_retryable()
    }

    pub fn error_log(&self) -> Vec<LogEntry> {
        self.lock_state().log.iter().cloned().collect()
    }

    /// Most recent `n` entries, oldest first within the slice.
    pub fn recent_errors(&self, n: usize) -> Vec<LogEntry> {
        let state = self.lock_state();
        let skip = state.log.len().saturating_sub(n);
        state.log.iter().skip(skip).cloned().collect()
    }

    pub fn errors_by_code(&self, code: ErrorCode) -> Vec<LogEntry> {
        self.lock_state()
            .log
            .iter()
            .filter(|entry| entry.error.code == code)
            .cloned()
            .collect()
    }

    pub fn errors_by_severity(&self, severity: Severity) -> Vec<LogEntry> {
        self.lock_state()
            .log
            .iter()
            .filter(|entry| entry.error.severity == severity)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ErrorStats {
        let state = self.lock_state();
        let mut stats = ErrorStats {
            total: state.log.len(),
            ..Default::default()
        };
        for entry in &state.log {
            *stats.by_code.entry(entry.error.code).or_insert(0) += 1;
            *stats.by_severity.entry(entry.error.severity).or_insert(0) += 1;
            if entry.recovered {
                stats.recovered += 1;
            }
        }
        stats.recovery_rate = if stats.total == 0 {
            0.0
        } else {
            stats.recovered as f64 / stats.total as f64
        };
        stats
    }

    pub fn clear_log(&self) {
        self.lock_state().log.clear();
    }

    /// Clear the log and drop all registered recovery strategies.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.log.clear();
        state.strategies.clear();
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(ErrorHandlerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_foreign_errors_wrap_as_unknown() {
        let handler = ErrorHandler::default();
        let err = handler.handle("boom", None).await;

        assert_eq!(err.code, ErrorCode::Unknown);
        assert_eq!(err.severity, Severity::Medium);
        assert!(!handler.should_retry(&err));
    }

    #[tokio::test]
    async fn test_context_merge_keeps_existing_keys() {
        let handler = ErrorHandler::default();
        let original = ArchiveError::network("down").with_context_field("url", "https://a");

        let err = handler
            .handle(
                original,
                Some(
                    ErrorContext::new()
                        .with_field("url", "https://b")
                        .with_field("platform", "mastodon"),
                ),
            )
            .await;

        assert_eq!(err.context.fields["url"], "https://a");
        assert_eq!(err.context.fields["platform"], "mastodon");
    }

    #[tokio::test]
    async fn test_log_is_bounded_fifo() {
        let handler = ErrorHandler::new(ErrorHandlerConfig {
            max_log_entries: 3,
            ..Default::default()
        });

        for i in 0..5 {
            handler
                .handle(ArchiveError::network(format!("failure {i}")), None)
                .await;
        }

        let log = handler.error_log();
        assert_eq!(log.len(), 3);
        // Oldest evicted first: 0 and 1 are gone.
        assert!(log[0].error.message.contains("failure 2"));
        assert!(log[2].error.message.contains("failure 4"));
    }

    #[tokio::test]
    async fn test_recovery_strategy_success_marks_entry() {
        let handler = ErrorHandler::default();
        handler.register_recovery_strategy(ErrorCode::Timeout, |_err| async { Ok(true) });

        handler
            .handle(ArchiveError::timeout(Duration::from_secs(1)), None)
            .await;

        let log = handler.error_log();
        assert!(log[0].recovered);
        assert_eq!(handler.stats().recovered, 1);
    }

    #[tokio::test]
    async fn test_recovery_strategy_failure_is_swallowed() {
        let handler = ErrorHandler::default();
        handler.register_recovery_strategy(ErrorCode::Network, |_err| async {
            Err(ArchiveError::unknown("strategy exploded"))
        });

        // Must not propagate or panic.
        let err = handler.handle(ArchiveError::network("down"), None).await;
        assert_eq!(err.code, ErrorCode::Network);

        let log = handler.error_log();
        assert!(!log[0].recovered);
    }

    #[tokio::test]
    async fn test_recovery_skipped_for_non_retryable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = ErrorHandler::default();
        {
            let calls = Arc::clone(&calls);
            handler.register_recovery_strategy(ErrorCode::Authentication, move |_err| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            });
        }

        handler
            .handle(ArchiveError::authentication("bad key"), None)
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!handler.error_log()[0].recovered);
    }

    #[tokio::test]
    async fn test_on_error_callback_fires() {
        let seen = Arc::new(AtomicUsize::new(0));
        let config = ErrorHandlerConfig {
            on_error: Some({
                let seen = Arc::clone(&seen);
                Arc::new(move |_err| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })
            }),
            ..Default::default()
        };
        let handler = ErrorHandler::new(config);

        handler.handle(ArchiveError::rate_limited(), None).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_surface() {
        let handler = ErrorHandler::default();
        handler.handle(ArchiveError::network("a"), None).await;
        handler.handle(ArchiveError::rate_limited(), None).await;
        handler
            .handle(ArchiveError::authentication("bad"), None)
            .await;

        assert_eq!(handler.errors_by_code(ErrorCode::Network).len(), 1);
        assert_eq!(handler.errors_by_severity(Severity::High).len(), 1);

        let recent = handler.recent_errors(2);
        assert_eq!(recent.len(), 2);
        // Oldest-first within the slice.
        assert_eq!(recent[0].error.code, ErrorCode::RateLimited);
        assert_eq!(recent[1].error.code, ErrorCode::Authentication);

        let stats = handler.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_code[&ErrorCode::RateLimited], 1);
        assert_eq!(stats.recovery_rate, 0.0);
    }

    #[tokio::test]
    async fn test_reset_drops_strategies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = ErrorHandler::default();
        {
            let calls = Arc::clone(&calls);
            handler.register_recovery_strategy(ErrorCode::Network, move |_err| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            });
        }

        handler.reset();
        handler.handle(ArchiveError::network("down"), None).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(handler.error_log().len(), 1);

        handler.clear_log();
        assert!(handler.error_log().is_empty());
    }

    #[tokio::test]
    async fn test_logging_disabled_keeps_log_empty() {
        let handler = ErrorHandler::new(ErrorHandlerConfig {
            enable_logging: false,
            ..Default::default()
        });

        handler.handle(ArchiveError::network("down"), None).await;
        assert!(handler.error_log().is_empty());
        assert_eq!(handler.stats().total, 0);
    }
}
