//! Resilience core for the Argus social-media archiver.
//!
//! Three components composed as a pipeline around every outbound call to
//! the scraping API: a request queue (admission control), a circuit breaker
//! (health gate), and an error classifier with automated recovery.

pub mod circuit_breaker;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod recovery;
pub mod request_queue;
pub mod testutil;
pub mod traits;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState};
pub use error::{ArchiveError, ErrorCode, ErrorContext, RecoveryAction, Severity};
pub use fetch::{FetchRequest, FetchService, HealthSnapshot};
pub use recovery::{ErrorHandler, ErrorHandlerConfig, ErrorStats, LogEntry};
pub use request_queue::{
    AddOptions, Priority, QueueConfig, QueueEvent, QueueMetrics, QueueReporter, RequestQueue,
};
pub use traits::{Method, NullTransport, Transport, TransportRequest, TransportResponse};
