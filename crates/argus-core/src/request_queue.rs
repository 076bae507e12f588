//! Admission control and fairness over concurrent outbound work.
//!
//! The queue bounds how many fetches run at once, rejects work past
//! capacity, refuses duplicate in-flight requests, enforces per-request
//! deadlines, and surfaces throughput metrics for health reporting.
//!
//! Scheduling: lower-priority-value work is preferred whenever a
//! concurrency slot frees up; within one priority band requests start in
//! arrival order. A slot already granted is never preempted.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, oneshot};
use uuid::Uuid;

use crate::error::ArchiveError;

/// Bounded window of processing-time samples retained for metrics.
const PROCESSING_SAMPLE_WINDOW: usize = 1000;

/// Scheduling priority of a queued request. Lower value is served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Configuration for queue behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of simultaneously executing requests.
    pub concurrency: usize,

    /// Maximum admitted-but-not-yet-started requests before rejecting new ones.
    pub max_size: usize,

    /// Default per-request wall-clock budget.
    pub timeout: Duration,

    /// Whether processing begins immediately or must be started explicitly.
    pub auto_start: bool,

    /// When true (default), a request that exceeds its deadline fails with a
    /// timeout error and the in-flight work is abandoned. When false the
    /// deadline is advisory: the overrun is logged and the real result is
    /// still delivered.
    pub throw_on_timeout: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_size: 100,
            timeout: Duration::from_secs(30),
            auto_start: true,
            throw_on_timeout: true,
        }
    }
}

/// Per-request admission options.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub priority: Priority,

    /// Overrides the queue-level default timeout.
    pub timeout: Option<Duration>,

    /// While a key is in flight, a second request bearing the same key is
    /// rejected outright. See [`crate::dedup`] for key derivation.
    pub dedup_key: Option<String>,
}

impl AddOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// Events emitted by the queue for monitoring/logging.
#[derive(Debug)]
pub enum QueueEvent<'a> {
    Added {
        request_id: Uuid,
        priority: Priority,
        pending: usize,
    },
    Started {
        request_id: Uuid,
        /// How long the request waited for a concurrency slot.
        waited: Duration,
    },
    Completed {
        request_id: Uuid,
        elapsed: Duration,
    },
    Failed {
        request_id: Uuid,
        error: &'a ArchiveError,
    },
    TimedOut {
        request_id: Uuid,
        timeout: Duration,
    },
    Paused,
    Resumed,
    Cleared {
        dropped: usize,
    },
    Drained,
}

/// Trait for receiving queue events (decoupled logging).
pub trait QueueReporter: Send + Sync {
    fn report(&self, event: QueueEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingQueueReporter;

impl QueueReporter for TracingQueueReporter {
    fn report(&self, event: QueueEvent<'_>) {
        match event {
            QueueEvent::Added {
                request_id,
                priority,
                pending,
            } => {
                tracing::debug!(%request_id, %priority, %pending, "Request admitted");
            }
            QueueEvent::Started { request_id, waited } => {
                tracing::debug!(%request_id, waited_ms = waited.as_millis() as u64, "Request started");
            }
            QueueEvent::Completed {
                request_id,
                elapsed,
            } => {
                tracing::info!(%request_id, elapsed_ms = elapsed.as_millis() as u64, "Request completed");
            }
            QueueEvent::Failed { request_id, error } => {
                tracing::warn!(%request_id, %error, "Request failed");
            }
            QueueEvent::TimedOut {
                request_id,
                timeout,
            } => {
                tracing::warn!(%request_id, timeout_ms = timeout.as_millis() as u64, "Request deadline exceeded");
            }
            QueueEvent::Paused => {
                tracing::info!("Queue paused");
            }
            QueueEvent::Resumed => {
                tracing::info!("Queue resumed");
            }
            QueueEvent::Cleared { dropped } => {
                tracing::info!(%dropped, "Queue cleared");
            }
            QueueEvent::Drained => {
                tracing::debug!("Queue drained");
            }
        }
    }
}

/// Point-in-time snapshot of queue counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub pending: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub total_processed: u64,
    /// Mean over the retained sample window.
    pub avg_processing_time: Duration,
    /// pending + active.
    pub queue_depth: usize,
    /// total_processed / elapsed seconds since queue construction.
    pub throughput_per_sec: f64,
}

type BoxedWork<T> =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<T, ArchiveError>> + Send>> + Send>;

/// An admitted request waiting for a concurrency slot.
struct PendingEntry<T> {
    id: Uuid,
    priority: Priority,
    seq: u64,
    added_at: Instant,
    timeout: Duration,
    dedup_key: Option<String>,
    work: BoxedWork<T>,
    tx: oneshot::Sender<Result<T, ArchiveError>>,
}

impl<T> PartialEq for PendingEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for PendingEntry<T> {}

impl<T> PartialOrd for PendingEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PendingEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest entry; invert so the lowest
        // (priority, seq) pair is served first. FIFO within a band.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner<T> {
    pending: BinaryHeap<PendingEntry<T>>,
    active: usize,
    paused: bool,
    next_seq: u64,
    in_flight_keys: HashSet<String>,
    completed: u64,
    failed: u64,
    total_processed: u64,
    samples: VecDeque<Duration>,
}

impl<T> QueueInner<T> {
    fn new(paused: bool) -> Self {
        Self {
            pending: BinaryHeap::new(),
            active: 0,
            paused,
            next_seq: 0,
            in_flight_keys: HashSet::new(),
            completed: 0,
            failed: 0,
            total_processed: 0,
            samples: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active == 0
    }

    fn record_outcome(&mut self, failed: bool, sample: Option<Duration>) {
        self.total_processed += 1;
        if failed {
            self.failed += 1;
        } else {
            self.completed += 1;
        }
        if let Some(elapsed) = sample {
            self.samples.push_back(elapsed);
            if self.samples.len() > PROCESSING_SAMPLE_WINDOW {
                self.samples.pop_front();
            }
        }
    }
}

/// Admission-controlled request queue, generic over the work's result type.
///
/// Cloning is cheap and shares the same queue.
pub struct RequestQueue<T> {
    config: QueueConfig,
    inner: Arc<Mutex<QueueInner<T>>>,
    idle: Arc<Notify>,
    started: Instant,
    reporter: Arc<dyn QueueReporter>,
}

impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            idle: Arc::clone(&self.idle),
            started: self.started,
            reporter: Arc::clone(&self.reporter),
        }
    }
}

impl<T: Send + 'static> RequestQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_reporter(config, TracingQueueReporter)
    }

    pub fn with_reporter(config: QueueConfig, reporter: impl QueueReporter + 'static) -> Self {
        let paused = !config.auto_start;
        Self {
            config,
            inner: Arc::new(Mutex::new(QueueInner::new(paused))),
            idle: Arc::new(Notify::new()),
            started: Instant::now(),
            reporter: Arc::new(reporter),
        }
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned queue mutex");
            poisoned.into_inner()
        })
    }

    /// Admit a unit of work and wait for its result.
    ///
    /// Admission failures (overflow, duplicate in-flight key) are raised
    /// immediately, before the work is registered. An accepted request
    /// resolves with the work's own result, a timeout error, or an error if
    /// the queue is cleared before it starts.
    pub async fn add<F, Fut>(&self, work: F, options: AddOptions) -> Result<T, ArchiveError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ArchiveError>> + Send + 'static,
    {
        let request_id = Uuid::new_v4();
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let (tx, rx) = oneshot::channel();

        let pending = {
            let mut inner = self.lock_inner();

            if inner.pending.len() >= self.config.max_size {
                return Err(ArchiveError::queue_overflow(
                    inner.pending.len(),
                    self.config.max_size,
                )
                .with_operation("queue.add"));
            }

            if let Some(key) = &options.dedup_key
                && !inner.in_flight_keys.insert(key.clone())
            {
                return Err(ArchiveError::duplicate_request(key).with_operation("queue.add"));
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            let boxed: BoxedWork<T> = Box::new(move || {
                let fut: Pin<Box<dyn Future<Output = Result<T, ArchiveError>> + Send>> =
                    Box::pin(work());
                fut
            });
            inner.pending.push(PendingEntry {
                id: request_id,
                priority: options.priority,
                seq,
                added_at: Instant::now(),
                timeout,
                dedup_key: options.dedup_key,
                work: boxed,
                tx,
            });
            inner.pending.len()
        };

        self.reporter.report(QueueEvent::Added {
            request_id,
            priority: options.priority,
            pending,
        });

        self.pump();

        match rx.await {
            Ok(result) => result,
            // Sender dropped without settling: the request was discarded.
            Err(_) => Err(ArchiveError::unknown("Request dropped before execution")
                .with_operation("queue.add")),
        }
    }

    /// Allow queued-but-not-started work to begin.
    pub fn start(&self) {
        let resumed = {
            let mut inner = self.lock_inner();
            let was_paused = inner.paused;
            inner.paused = false;
            was_paused
        };
        if resumed {
            self.reporter.report(QueueEvent::Resumed);
            self.pump();
        }
    }

    /// Stop starting new work. In-flight requests are unaffected.
    pub fn pause(&self) {
        let paused = {
            let mut inner = self.lock_inner();
            let was_running = !inner.paused;
            inner.paused = true;
            was_running
        };
        if paused {
            self.reporter.report(QueueEvent::Paused);
        }
    }

    /// Drop all pending work and its dedup keys. In-flight work is
    /// untouched; dropped callers are settled with an error.
    pub fn clear(&self) {
        let (dropped, idle) = {
            let mut inner = self.lock_inner();
            let dropped: Vec<PendingEntry<T>> = inner.pending.drain().collect();
            for entry in &dropped {
                if let Some(key) = &entry.dedup_key {
                    inner.in_flight_keys.remove(key);
                }
            }
            (dropped, inner.is_idle())
        };

        let count = dropped.len();
        for entry in dropped {
            let _ = entry.tx.send(Err(ArchiveError::unknown(
                "Request dropped before execution",
            )
            .with_detail("queue cleared")
            .with_operation("queue.clear")));
        }

        self.reporter.report(QueueEvent::Cleared { dropped: count });
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Resolve once both pending and active counts reach zero. Used for
    /// graceful shutdown.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a completion between the
            // check and the await cannot be missed.
            notified.as_mut().enable();

            if self.lock_inner().is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock_inner().paused
    }

    pub fn pending_count(&self) -> usize {
        self.lock_inner().pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.lock_inner().active
    }

    pub fn metrics(&self) -> QueueMetrics {
        let inner = self.lock_inner();

        let avg_processing_time = if inner.samples.is_empty() {
            Duration::ZERO
        } else {
            inner.samples.iter().sum::<Duration>() / inner.samples.len() as u32
        };

        let elapsed = self.started.elapsed().as_secs_f64();
        let throughput_per_sec = if elapsed > 0.0 {
            inner.total_processed as f64 / elapsed
        } else {
            0.0
        };

        QueueMetrics {
            pending: inner.pending.len(),
            active: inner.active,
            completed: inner.completed,
            failed: inner.failed,
            total_processed: inner.total_processed,
            avg_processing_time,
            queue_depth: inner.pending.len() + inner.active,
            throughput_per_sec,
        }
    }

    /// Start as many pending entries as free concurrency slots allow.
    fn pump(&self) {
        loop {
            let entry = {
                let mut inner = self.lock_inner();
                if inner.paused || inner.active >= self.config.concurrency {
                    return;
                }
                match inner.pending.pop() {
                    Some(entry) => {
                        inner.active += 1;
                        entry
                    }
                    None => return,
                }
            };

            let queue = self.clone();
            tokio::spawn(async move { queue.run_entry(entry).await });
        }
    }

    async fn run_entry(&self, entry: PendingEntry<T>) {
        let PendingEntry {
            id,
            added_at,
            timeout,
            dedup_key,
            work,
            tx,
            ..
        } = entry;

        let started = Instant::now();
        self.reporter.report(QueueEvent::Started {
            request_id: id,
            waited: added_at.elapsed(),
        });

        // The work runs as its own task so an exceeded deadline abandons it
        // (it keeps running in the background) instead of cancelling it.
        let mut handle = tokio::spawn(work());

        let mut timed_out = false;
        let outcome: Result<T, ArchiveError> = tokio::select! {
            joined = &mut handle => flatten_join(joined),
            () = tokio::time::sleep(timeout) => {
                self.reporter.report(QueueEvent::TimedOut {
                    request_id: id,
                    timeout,
                });
                if self.config.throw_on_timeout {
                    timed_out = true;
                    Err(ArchiveError::timeout(timeout).with_operation("queue"))
                } else {
                    // Advisory deadline: note the overrun, keep waiting.
                    tracing::warn!(
                        request_id = %id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Deadline exceeded; waiting for completion"
                    );
                    flatten_join((&mut handle).await)
                }
            }
        };

        let elapsed = started.elapsed();
        let sample = if timed_out { None } else { Some(elapsed) };

        let idle = {
            let mut inner = self.lock_inner();
            inner.active -= 1;
            if let Some(key) = &dedup_key {
                inner.in_flight_keys.remove(key);
            }
            inner.record_outcome(outcome.is_err(), sample);
            inner.is_idle()
        };

        match &outcome {
            Ok(_) => self.reporter.report(QueueEvent::Completed {
                request_id: id,
                elapsed,
            }),
            Err(error) => self.reporter.report(QueueEvent::Failed {
                request_id: id,
                error,
            }),
        }

        // The caller may have given up on the result; that's fine.
        let _ = tx.send(outcome);

        if idle {
            self.reporter.report(QueueEvent::Drained);
            self.idle.notify_waiters();
        }

        self.pump();
    }
}

fn flatten_join<T>(
    joined: Result<Result<T, ArchiveError>, tokio::task::JoinError>,
) -> Result<T, ArchiveError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ArchiveError::unknown("Request task failed")
            .with_detail(e.to_string())
            .with_operation("queue")),
    }
}
