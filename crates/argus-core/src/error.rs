//! Typed error taxonomy for the archiving pipeline.
//!
//! Every failure that crosses a component boundary is an [`ArchiveError`]:
//! a taxonomy code with fixed retryability and severity, a human message, an
//! optional machine-readable detail, a context bag, and an ordered list of
//! recovery suggestions. Raw upstream exceptions never leak to callers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed (but extensible) failure taxonomy.
///
/// Retryability and severity are fixed per code at construction;
/// `QueueOverflow`, `DuplicateRequest`, and `CircuitOpen` represent the
/// system protecting itself rather than the upstream failing, and are never
/// retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Network,
    Timeout,
    Authentication,
    Authorization,
    RateLimited,
    InvalidRequest,
    UpstreamServer,
    NotFound,
    QueueOverflow,
    DuplicateRequest,
    CircuitOpen,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Network => "network",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Authentication => "authentication",
            ErrorCode::Authorization => "authorization",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::UpstreamServer => "upstream_server",
            ErrorCode::NotFound => "not_found",
            ErrorCode::QueueOverflow => "queue_overflow",
            ErrorCode::DuplicateRequest => "duplicate_request",
            ErrorCode::CircuitOpen => "circuit_open",
            ErrorCode::Unknown => "unknown",
        }
    }

    /// Short title suitable for a notice banner.
    pub fn title(&self) -> &'static str {
        match self {
            ErrorCode::Network => "Network failure",
            ErrorCode::Timeout => "Request timed out",
            ErrorCode::Authentication => "Authentication failed",
            ErrorCode::Authorization => "Not authorized",
            ErrorCode::RateLimited => "Rate limit exceeded",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::UpstreamServer => "Upstream server error",
            ErrorCode::NotFound => "Not found",
            ErrorCode::QueueOverflow => "Queue full",
            ErrorCode::DuplicateRequest => "Duplicate request",
            ErrorCode::CircuitOpen => "Upstream unavailable",
            ErrorCode::Unknown => "Unexpected error",
        }
    }

    /// Whether this class of failure is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Network
                | ErrorCode::Timeout
                | ErrorCode::RateLimited
                | ErrorCode::UpstreamServer
        )
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorCode::Network | ErrorCode::Timeout | ErrorCode::RateLimited => Severity::Medium,
            ErrorCode::Authentication | ErrorCode::Authorization => Severity::High,
            ErrorCode::InvalidRequest | ErrorCode::NotFound | ErrorCode::DuplicateRequest => {
                Severity::Low
            }
            ErrorCode::UpstreamServer | ErrorCode::CircuitOpen => Severity::High,
            ErrorCode::QueueOverflow | ErrorCode::Unknown => Severity::Medium,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "network" => Ok(ErrorCode::Network),
            "timeout" => Ok(ErrorCode::Timeout),
            "authentication" => Ok(ErrorCode::Authentication),
            "authorization" => Ok(ErrorCode::Authorization),
            "rate_limited" => Ok(ErrorCode::RateLimited),
            "invalid_request" => Ok(ErrorCode::InvalidRequest),
            "upstream_server" => Ok(ErrorCode::UpstreamServer),
            "not_found" => Ok(ErrorCode::NotFound),
            "queue_overflow" => Ok(ErrorCode::QueueOverflow),
            "duplicate_request" => Ok(ErrorCode::DuplicateRequest),
            "circuit_open" => Ok(ErrorCode::CircuitOpen),
            "unknown" => Ok(ErrorCode::Unknown),
            _ => Err(format!("Unknown error code: {}", s)),
        }
    }
}

/// How bad a failure is for the archiving session as a whole.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One actionable suggestion attached to an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAction {
    /// Stable machine tag (e.g. "retry", "check_credentials").
    pub action: String,
    /// Human explanation of what to do.
    pub description: String,
    /// Whether a registered recovery strategy can attempt this automatically.
    pub auto_recoverable: bool,
}

impl RecoveryAction {
    pub fn new(action: impl Into<String>, description: impl Into<String>, auto: bool) -> Self {
        Self {
            action: action.into(),
            description: description.into(),
            auto_recoverable: auto,
        }
    }
}

/// Free-form key/value context carried alongside an error.
///
/// Merging is shallow and non-destructive: keys set by an upstream layer win
/// over later additions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Originating operation tag (e.g. "fetch", "queue.add").
    pub operation: Option<String>,
    /// When the error was constructed.
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            operation: None,
            timestamp: Utc::now(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Merge `other` into self. Existing keys (and an existing operation tag)
    /// are kept.
    pub fn merge(&mut self, other: ErrorContext) {
        if self.operation.is_none() {
            self.operation = other.operation;
        }
        for (key, value) in other.fields {
            self.fields.entry(key).or_insert(value);
        }
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The typed error flowing through the whole pipeline.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{}: {message}", .code.title())]
pub struct ArchiveError {
    pub code: ErrorCode,
    /// Short human message, safe to show in a notice.
    pub message: String,
    /// Machine-oriented detail (raw upstream message, status line, ...).
    pub detail: Option<String>,
    pub severity: Severity,
    pub retryable: bool,
    pub context: ErrorContext,
    pub suggestions: Vec<RecoveryAction>,
}

impl ArchiveError {
    /// Build an error with the code's default retryability, severity, and
    /// recovery suggestions.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
            severity: code.default_severity(),
            retryable: code.is_retryable(),
            context: ErrorContext::new(),
            suggestions: default_suggestions(code),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Network, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Request timed out after {} ms", after.as_millis()),
        )
        .with_context_field("timeout_ms", after.as_millis().to_string())
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Authentication, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Authorization, message)
    }

    pub fn rate_limited() -> Self {
        Self::new(ErrorCode::RateLimited, "Rate limit exceeded")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamServer, message)
            .with_context_field("status", status.to_string())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn queue_overflow(pending: usize, max_size: usize) -> Self {
        Self::new(
            ErrorCode::QueueOverflow,
            format!("Queue is full ({pending}/{max_size} pending)"),
        )
        .with_context_field("pending", pending.to_string())
        .with_context_field("max_size", max_size.to_string())
    }

    pub fn duplicate_request(key: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateRequest,
            "An identical request is already in flight",
        )
        .with_context_field("dedup_key", key.to_string())
    }

    pub fn circuit_open(retry_after: Duration) -> Self {
        Self::new(
            ErrorCode::CircuitOpen,
            format!(
                "Upstream is unavailable. Retry after {} seconds",
                retry_after.as_secs()
            ),
        )
        .with_context_field("retry_after_ms", retry_after.as_millis().to_string())
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, message)
    }

    /// Wrap an arbitrary foreign error as `Unknown`/medium severity.
    pub fn wrap<E: fmt::Display>(error: E) -> Self {
        Self::new(ErrorCode::Unknown, "An unexpected error occurred")
            .with_detail(error.to_string())
    }

    /// Map an HTTP status to the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Self::authentication(message),
            403 => Self::authorization(message),
            404 => Self::not_found(message),
            408 => Self::new(ErrorCode::Timeout, message),
            429 => Self::rate_limited().with_detail(message),
            400..=499 => Self::invalid_request(message),
            500..=599 => Self::upstream(status, message),
            _ => Self::network(message).with_context_field("status", status.to_string()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        if self.context.operation.is_none() {
            self.context.operation = Some(operation.into());
        }
        self
    }

    pub fn with_context_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.context.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: RecoveryAction) -> Self {
        self.suggestions.push(suggestion);
        self
    }

    /// Merge additional context; keys already present win.
    pub fn merge_context(&mut self, context: ErrorContext) {
        self.context.merge(context);
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<String> for ArchiveError {
    fn from(message: String) -> Self {
        ArchiveError::wrap(message)
    }
}

impl From<&str> for ArchiveError {
    fn from(message: &str) -> Self {
        ArchiveError::wrap(message)
    }
}

impl From<serde_json::Error> for ArchiveError {
    fn from(error: serde_json::Error) -> Self {
        ArchiveError::invalid_request("Payload serialization failed").with_detail(error.to_string())
    }
}

impl From<std::io::Error> for ArchiveError {
    fn from(error: std::io::Error) -> Self {
        ArchiveError::network("I/O failure during request").with_detail(error.to_string())
    }
}

fn default_suggestions(code: ErrorCode) -> Vec<RecoveryAction> {
    match code {
        ErrorCode::Network => vec![RecoveryAction::new(
            "retry",
            "Check the connection and retry the request",
            true,
        )],
        ErrorCode::Timeout => vec![RecoveryAction::new(
            "retry",
            "Retry, or raise the request timeout for slow posts",
            true,
        )],
        ErrorCode::RateLimited => vec![RecoveryAction::new(
            "wait",
            "Wait for the rate-limit window to pass, then retry",
            true,
        )],
        ErrorCode::UpstreamServer => vec![RecoveryAction::new(
            "retry",
            "The scraping API is having trouble; retry after a short delay",
            true,
        )],
        ErrorCode::Authentication => vec![RecoveryAction::new(
            "check_credentials",
            "Verify the API key in the archiver settings",
            false,
        )],
        ErrorCode::Authorization => vec![RecoveryAction::new(
            "check_plan",
            "Verify the account has access to this platform",
            false,
        )],
        ErrorCode::InvalidRequest => vec![RecoveryAction::new(
            "check_input",
            "Verify the post URL is valid and the platform is supported",
            false,
        )],
        ErrorCode::NotFound => vec![RecoveryAction::new(
            "check_url",
            "The post may have been deleted or made private",
            false,
        )],
        ErrorCode::QueueOverflow => vec![RecoveryAction::new(
            "slow_down",
            "Too many archive requests at once; wait for the queue to drain",
            false,
        )],
        ErrorCode::DuplicateRequest => vec![RecoveryAction::new(
            "wait",
            "Wait for the in-flight request for this post to finish",
            false,
        )],
        ErrorCode::CircuitOpen => vec![RecoveryAction::new(
            "wait",
            "The upstream is failing; wait for the next automatic probe",
            false,
        )],
        ErrorCode::Unknown => vec![],
    }
}
