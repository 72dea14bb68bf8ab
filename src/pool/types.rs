use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier for a submitted work item
pub type WorkId = Uuid;

/// Priority bands, lowest first so that `Ord` matches urgency
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Bands in dequeue order
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known error kinds produced by the core itself
pub mod error_kind {
    pub const TRANSIENT: &str = "transient";
    pub const TIMEOUT: &str = "timeout";
    pub const CANCELLED: &str = "cancelled";
    pub const CIRCUIT_OPEN: &str = "circuit_open";
    pub const PANIC: &str = "panic";
    pub const POOL_STOPPED: &str = "pool_stopped";
    pub const FATAL: &str = "fatal";
}

/// Error returned by a task callable.
///
/// `kind` is what retry policies and circuit breakers match against; the
/// message is informational only.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(error_kind::TRANSIENT, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(error_kind::FATAL, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(error_kind::TIMEOUT, message)
    }

    pub fn cancelled() -> Self {
        Self::new(error_kind::CANCELLED, "cancellation requested")
    }

    pub fn circuit_open(resource: &str) -> Self {
        Self::new(
            error_kind::CIRCUIT_OPEN,
            format!("circuit open for resource '{}'", resource),
        )
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(error_kind::PANIC, message)
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == error_kind::CANCELLED
    }
}

/// A set of error kinds, or every kind
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMatcher {
    #[default]
    Any,
    Kinds(BTreeSet<String>),
}

impl ErrorMatcher {
    pub fn kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ErrorMatcher::Kinds(kinds.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, kind: &str) -> bool {
        match self {
            ErrorMatcher::Any => true,
            ErrorMatcher::Kinds(kinds) => kinds.contains(kind),
        }
    }
}

/// Retry behaviour for a work item.
///
/// `max_attempts` is the number of retries after the first attempt, so a
/// policy with `max_attempts = 2` runs the callable at most three times.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub retry_on: ErrorMatcher,
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn retry_on(mut self, matcher: ErrorMatcher) -> Self {
        self.retry_on = matcher;
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Whether another attempt is allowed after `retries_used` retries failed with `error`
    pub fn should_retry(&self, error: &TaskError, retries_used: u32) -> bool {
        retries_used < self.max_attempts
            && !error.is_cancellation()
            && self.retry_on.matches(&error.kind)
    }

    /// Un-jittered delay before retry number `retry` (1-based)
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        Duration::from_millis(millis.clamp(0.0, u64::MAX as f64 / 2.0) as u64)
    }

    /// Delay before retry number `retry`, jittered by up to ±20% when enabled
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.backoff_delay(retry);
        if !self.jitter {
            return delay;
        }
        let jitter = (rand::random::<f64>() - 0.5) * 0.4;
        Duration::from_millis((delay.as_millis() as f64 * (1.0 + jitter)) as u64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            ));
        }
        if let ErrorMatcher::Kinds(kinds) = &self.retry_on
            && kinds.iter().any(|k| k.trim().is_empty())
        {
            return Err("retry_on contains an empty error kind".to_string());
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            backoff_factor: 2.0,
            jitter: true,
            retry_on: ErrorMatcher::Any,
        }
    }
}

/// Tracks the start time and the last heartbeat of the current attempt
#[derive(Debug, Default)]
pub struct ProgressTracker {
    started_at_ms: AtomicI64,
    last_heartbeat_ms: AtomicI64,
}

/// Point-in-time view of a [`ProgressTracker`]
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressInfo {
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ProgressInfo {
    /// Most recent sign of life: the last heartbeat, else the attempt start
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat.or(self.started_at)
    }
}

impl ProgressTracker {
    pub(crate) fn reset(&self, started_at: DateTime<Utc>) {
        self.started_at_ms
            .store(started_at.timestamp_millis(), Ordering::SeqCst);
        self.last_heartbeat_ms.store(0, Ordering::SeqCst);
    }

    pub fn beat(&self) {
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ProgressInfo {
        ProgressInfo {
            started_at: millis_to_datetime(self.started_at_ms.load(Ordering::SeqCst)),
            last_heartbeat: millis_to_datetime(self.last_heartbeat_ms.load(Ordering::SeqCst)),
        }
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        None
    } else {
        Utc.timestamp_millis_opt(millis).single()
    }
}

/// Handed to every invocation of a task callable
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub work_id: WorkId,
    pub attempt: u32,
    cancel: CancellationToken,
    progress: Arc<ProgressTracker>,
}

impl TaskContext {
    pub(crate) fn new(
        work_id: WorkId,
        attempt: u32,
        cancel: CancellationToken,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            work_id,
            attempt,
            cancel,
            progress,
        }
    }

    /// Context that is not attached to any pool, for driving callables directly
    pub fn detached() -> Self {
        Self::new(
            Uuid::new_v4(),
            1,
            CancellationToken::new(),
            Arc::new(ProgressTracker::default()),
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Signals progress; resets the idle clock used for stall detection
    pub fn heartbeat(&self) {
        self.progress.beat();
    }

    /// Returns a cancellation error if cancellation was requested
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// Result type of every task callable
pub type WorkResult = Result<serde_json::Value, TaskError>;

/// Opaque, re-invocable unit of work
pub type WorkFn = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, WorkResult> + Send + Sync>;

/// Wraps an async closure into a [`WorkFn`]
pub fn work_fn<F, Fut>(f: F) -> WorkFn
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// A unit of work submitted to the pool
#[derive(Clone)]
pub struct WorkItem {
    pub label: String,
    pub priority: Priority,
    pub retry_policy: RetryPolicy,
    pub work: WorkFn,
}

impl WorkItem {
    pub fn new(label: impl Into<String>, work: WorkFn) -> Self {
        Self {
            label: label.into(),
            priority: Priority::Normal,
            retry_policy: RetryPolicy::none(),
            work,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

/// Handle returned by `submit`
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkHandle {
    pub id: WorkId,
}

/// Lifecycle of a work item inside the pool
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkStatus {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl WorkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkStatus::Completed | WorkStatus::Failed | WorkStatus::Cancelled
        )
    }
}

/// Result of a single attempt, or of the whole work item once terminal
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkOutcome {
    Succeeded { output: serde_json::Value },
    Failed { error: TaskError },
    Cancelled,
}

/// What `cancel` did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The item had not started (or was waiting to retry) and is now CANCELLED
    Dequeued,
    /// The item is running; its token was cancelled and the callable must observe it
    Signalled,
    /// The item had already reached a terminal state
    AlreadyFinished,
}

/// Events published to subscribers for every attempt and terminal transition
#[derive(Clone, Debug)]
pub enum PoolEvent {
    AttemptStarted {
        work_id: WorkId,
        label: String,
        attempt: u32,
        started_at: DateTime<Utc>,
    },
    AttemptFinished {
        work_id: WorkId,
        attempt: u32,
        finished_at: DateTime<Utc>,
        outcome: WorkOutcome,
        will_retry: bool,
    },
    Retrying {
        work_id: WorkId,
        next_attempt: u32,
        delay: Duration,
    },
    Requeued {
        work_id: WorkId,
    },
    Finished {
        work_id: WorkId,
        status: WorkStatus,
        outcome: WorkOutcome,
    },
}

impl PoolEvent {
    pub fn work_id(&self) -> WorkId {
        match self {
            PoolEvent::AttemptStarted { work_id, .. }
            | PoolEvent::AttemptFinished { work_id, .. }
            | PoolEvent::Retrying { work_id, .. }
            | PoolEvent::Requeued { work_id }
            | PoolEvent::Finished { work_id, .. } => *work_id,
        }
    }
}

/// Pool sizing configuration
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub resize_interval_ms: u64,
    /// Terminal work items kept around for `wait`/`outcome` lookups (at least 1)
    pub retain_finished: usize,
}

impl PoolConfig {
    pub fn resize_interval(&self) -> Duration {
        Duration::from_millis(self.resize_interval_ms)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "min_workers must be at least 1".to_string(),
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.resize_interval_ms == 0 {
            return Err(PoolError::InvalidConfig(
                "resize_interval_ms must be positive".to_string(),
            ));
        }
        if self.retain_finished == 0 {
            return Err(PoolError::InvalidConfig(
                "retain_finished must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 8,
            resize_interval_ms: 5_000,
            retain_finished: 10_000,
        }
    }
}

/// Sizing and load of the pool
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerPoolState {
    pub min_workers: usize,
    pub max_workers: usize,
    pub current_size: usize,
    pub active_count: usize,
    pub queued_count: usize,
}

/// Number of queued items per priority band
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueDepths {
    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }
}

/// Lifetime counters
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolCounters {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PoolMetrics {
    pub state: WorkerPoolState,
    pub queue_depths: QueueDepths,
    /// Items waiting out a retry backoff
    pub retrying_count: usize,
    pub counters: PoolCounters,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is not running")]
    PoolStopped,
    #[error("unknown work item {0}")]
    UnknownWork(WorkId),
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),
}
