use crate::pool::{Priority, PoolError, RetryPolicy, TaskError, WorkFn, WorkOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Unique identifier for a single attempt of a task
pub type ExecutionId = Uuid;

/// When a task fires on its own
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Runs only when explicitly executed
    #[default]
    Once,
    Interval {
        every_ms: u64,
    },
    /// Standard 5-field or seconds-first 6/7-field cron expression, evaluated in UTC
    Cron {
        expression: String,
    },
}

impl Schedule {
    pub fn every(period: Duration) -> Self {
        Schedule::Interval {
            every_ms: period.as_millis() as u64,
        }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Schedule::Cron {
            expression: expression.into(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::Once)
    }
}

/// Task lifecycle.
///
/// `Pending → Ready → Queued → Running → {Completed | Retrying → Queued |
/// Failed | Cancelled}`. A terminal task goes back to `Pending` when a new
/// run is requested.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Retrying,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Handed to the worker pool and not yet terminal
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Queued | TaskStatus::Running | TaskStatus::Retrying
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Ready | Cancelled) => true,
            (Ready, Queued | Cancelled | Failed) => true,
            (Queued, Running | Cancelled) => true,
            (Running, Completed | Retrying | Failed | Cancelled) => true,
            (Retrying, Queued | Cancelled) => true,
            (Completed | Failed | Cancelled, Pending) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Everything needed to register a task
#[derive(Clone)]
pub struct TaskDefinition {
    pub id: Option<TaskId>,
    pub name: String,
    pub task_type: String,
    pub callable: WorkFn,
    pub priority: Priority,
    pub dependencies: Vec<TaskId>,
    pub retry_policy: RetryPolicy,
    pub schedule: Schedule,
    pub idle_timeout: Option<Duration>,
    /// Route every attempt through the circuit breaker under this resource name
    pub circuit_resource: Option<String>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, callable: WorkFn) -> Self {
        Self {
            id: None,
            name: name.into(),
            task_type: "generic".to_string(),
            callable,
            priority: Priority::Normal,
            dependencies: Vec::new(),
            retry_policy: RetryPolicy::default(),
            schedule: Schedule::Once,
            idle_timeout: None,
            circuit_resource: None,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dependency: TaskId) -> Self {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        for dependency in dependencies {
            self = self.depends_on(dependency);
        }
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_circuit_resource(mut self, resource: impl Into<String>) -> Self {
        self.circuit_resource = Some(resource.into());
        self
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

/// Registered task as seen from outside the manager
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub task_type: String,
    pub priority: Priority,
    pub dependencies: Vec<TaskId>,
    pub retry_policy: RetryPolicy,
    pub schedule: Schedule,
    pub idle_timeout_ms: Option<u64>,
    pub circuit_resource: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only when the current run completed
    pub result: Option<serde_json::Value>,
    /// Set only when the current run failed
    pub error: Option<TaskError>,
    pub is_stalled: bool,
    pub stalled_since: Option<DateTime<Utc>>,
    /// Attempts made in the current run
    pub attempts: u32,
    /// Runs started since registration
    pub run_count: u32,
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_definition(id: TaskId, definition: &TaskDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: definition.name.clone(),
            task_type: definition.task_type.clone(),
            priority: definition.priority,
            dependencies: definition.dependencies.clone(),
            retry_policy: definition.retry_policy.clone(),
            schedule: definition.schedule.clone(),
            idle_timeout_ms: definition.idle_timeout.map(|t| t.as_millis() as u64),
            circuit_resource: definition.circuit_resource.clone(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            is_stalled: false,
            stalled_since: None,
            attempts: 0,
            run_count: 0,
            last_fired_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    /// Apply the bookkeeping that goes with entering `next`; legality is the caller's concern
    pub(crate) fn apply_status(&mut self, next: TaskStatus, now: DateTime<Utc>) {
        match next {
            TaskStatus::Pending => {
                self.result = None;
                self.error = None;
                self.started_at = None;
                self.completed_at = None;
                self.is_stalled = false;
                self.stalled_since = None;
                self.attempts = 0;
            }
            TaskStatus::Ready => self.run_count += 1,
            TaskStatus::Running => {
                self.started_at.get_or_insert(now);
                self.is_stalled = false;
                self.stalled_since = None;
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            TaskStatus::Queued | TaskStatus::Retrying => {}
        }
        self.status = next;
        self.updated_at = now;
    }

    /// Record the terminal result of the current run, keeping `result` and `error` exclusive
    pub(crate) fn record_outcome(&mut self, outcome: &WorkOutcome) {
        match outcome {
            WorkOutcome::Succeeded { output } => {
                self.result = Some(output.clone());
                self.error = None;
            }
            WorkOutcome::Failed { error } => {
                self.result = None;
                self.error = Some(error.clone());
            }
            WorkOutcome::Cancelled => {
                self.result = None;
                self.error = None;
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    /// This attempt failed and another one is scheduled
    Retrying,
    Failed,
    Cancelled,
}

/// One attempt of one run of a task
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub task_id: TaskId,
    pub task_name: String,
    /// Which run of the task this attempt belongs to
    pub run: u32,
    pub attempt_number: u32,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<WorkOutcome>,
}

impl Execution {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownEventType {
    TaskStalled,
    TaskAutoShutdown,
    SystemIdleShutdown,
    ManagerShutdown,
}

impl ShutdownEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownEventType::TaskStalled => "task_stalled",
            ShutdownEventType::TaskAutoShutdown => "task_auto_shutdown",
            ShutdownEventType::SystemIdleShutdown => "system_idle_shutdown",
            ShutdownEventType::ManagerShutdown => "manager_shutdown",
        }
    }
}

/// Append-only record of idle detection and shutdown decisions
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ShutdownEvent {
    pub event_type: ShutdownEventType,
    pub task_id: Option<TaskId>,
    pub message: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ShutdownEvent {
    pub fn new(event_type: ShutdownEventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            task_id: None,
            message: message.into(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Outcome of an `execute` call
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ExecutionReport {
    pub statuses: HashMap<TaskId, TaskStatus>,
    /// Requested tasks that cannot start because a dependency failed, was
    /// cancelled or is not registered
    pub blocked: Vec<TaskId>,
}

impl ExecutionReport {
    pub fn status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.statuses.get(&task_id).copied()
    }

    pub fn all_completed(&self) -> bool {
        self.statuses
            .values()
            .all(|status| *status == TaskStatus::Completed)
    }

    pub fn is_settled(&self) -> bool {
        self.statuses
            .iter()
            .all(|(id, status)| status.is_terminal() || self.blocked.contains(id))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// Executions retained in memory
    pub history_limit: usize,
    pub scheduler_tick_ms: u64,
    pub idle_check_interval_ms: u64,
    pub default_idle_timeout_secs: u64,
    /// Idle timeout per task type, in seconds
    pub idle_timeout_overrides: HashMap<String, u64>,
    pub auto_shutdown_enabled: bool,
    pub shutdown_grace_period_ms: u64,
    /// No queued or running work for this long counts as system idleness
    pub global_idle_timeout_ms: u64,
}

impl TaskManagerConfig {
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn global_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.global_idle_timeout_ms)
    }

    /// Task setting, then the per-type override, then the default
    pub fn idle_timeout_for(&self, task: &Task) -> Duration {
        task.idle_timeout().unwrap_or_else(|| {
            let secs = self
                .idle_timeout_overrides
                .get(&task.task_type)
                .copied()
                .unwrap_or(self.default_idle_timeout_secs);
            Duration::from_secs(secs)
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.history_limit == 0 {
            return Err("history_limit must be positive".to_string());
        }
        if self.scheduler_tick_ms == 0 || self.idle_check_interval_ms == 0 {
            return Err("scheduler and idle check intervals must be positive".to_string());
        }
        if self.default_idle_timeout_secs == 0 {
            return Err("default_idle_timeout_secs must be positive".to_string());
        }
        if let Some((task_type, _)) = self
            .idle_timeout_overrides
            .iter()
            .find(|(_, secs)| **secs == 0)
        {
            return Err(format!(
                "idle timeout override for '{}' must be positive",
                task_type
            ));
        }
        if self.global_idle_timeout_ms == 0 {
            return Err("global_idle_timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            history_limit: 1_000,
            scheduler_tick_ms: 1_000,
            idle_check_interval_ms: 5_000,
            default_idle_timeout_secs: 300,
            idle_timeout_overrides: HashMap::new(),
            auto_shutdown_enabled: false,
            shutdown_grace_period_ms: 30_000,
            global_idle_timeout_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskManagerError {
    #[error("dependency cycle through task {task_id}: {cycle:?}")]
    CyclicDependency { task_id: TaskId, cycle: Vec<TaskId> },
    #[error("invalid task definition: {0}")]
    InvalidTaskDefinition(String),
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("invalid task manager configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("persistence failure: {0}")]
    Persistence(String),
}
