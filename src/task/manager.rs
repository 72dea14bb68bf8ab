use crate::circuit_breaker::CircuitBreaker;
use crate::monitor::{MonitorError, ResourceMonitor, ResourceSnapshot};
use crate::pool::{
    CancelOutcome, PoolEvent, PoolMetrics, TaskError, WorkFn, WorkItem, WorkOutcome, WorkStatus,
    WorkerPool, error_kind, work_fn,
};
use crate::task::graph::DependencyGraph;
use crate::task::history::ExecutionHistory;
use crate::task::idle::{IdleTracker, IdleTransition, idle_duration};
use crate::task::schedule;
use crate::task::sink::ExecutionSink;
use crate::task::types::*;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Registers tasks, runs them through the worker pool in dependency order,
/// keeps their execution history and watches for stalls and idleness.
pub struct TaskManager {
    shared: Arc<ManagerShared>,
    pool_events: Mutex<Option<UnboundedReceiver<PoolEvent>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    loops: CancellationToken,
    listener: CancellationToken,
}

/// Events that can occur during task management
#[derive(Debug, Clone)]
pub enum TaskEvent {
    TaskRegistered {
        task_id: TaskId,
        name: String,
    },
    TaskStatusChanged {
        task_id: TaskId,
        old_status: TaskStatus,
        new_status: TaskStatus,
    },
    TaskCompleted {
        task_id: TaskId,
        result: serde_json::Value,
    },
    TaskFailed {
        task_id: TaskId,
        error: TaskError,
    },
    TaskStalled {
        task_id: TaskId,
        idle_for: Duration,
    },
}

/// Handler for task events
pub trait TaskEventHandler {
    fn handle_event(&self, event: &TaskEvent) -> Result<()>;
}

struct ManagerShared {
    config: TaskManagerConfig,
    pool: Arc<WorkerPool>,
    breaker: Arc<CircuitBreaker>,
    monitor: Option<Arc<ResourceMonitor>>,
    sink: Arc<dyn ExecutionSink>,
    registry: RwLock<Registry>,
    history: RwLock<ExecutionHistory>,
    shutdown_log: RwLock<VecDeque<ShutdownEvent>>,
    event_handlers: StdRwLock<Vec<Box<dyn TaskEventHandler + Send + Sync>>>,
    changes: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
    idle: Mutex<IdleTracker>,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<TaskId, TaskEntry>,
    graph: DependencyGraph,
    by_work: HashMap<Uuid, TaskId>,
}

struct TaskEntry {
    task: Task,
    callable: WorkFn,
    /// Requested to run as part of an `execute` call and not finished yet
    armed: bool,
    work: Option<crate::pool::WorkHandle>,
    execution: Option<ExecutionId>,
    shutdown_requested: bool,
}

impl Registry {
    fn dependencies_completed(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|entry| entry.task.status == TaskStatus::Completed)
        })
    }

    /// A pending task that can never start without outside intervention
    fn is_blocked(&self, task_id: TaskId) -> bool {
        self.blocked_inner(task_id, &mut HashSet::new())
    }

    fn blocked_inner(&self, task_id: TaskId, visited: &mut HashSet<TaskId>) -> bool {
        let Some(entry) = self.tasks.get(&task_id) else {
            return true;
        };
        if entry.task.status != TaskStatus::Pending || !visited.insert(task_id) {
            return false;
        }
        entry.task.dependencies.iter().any(|dep| match self.tasks.get(dep) {
            None => true,
            Some(dependency) => match dependency.task.status {
                TaskStatus::Failed | TaskStatus::Cancelled => true,
                TaskStatus::Pending => !dependency.armed || self.blocked_inner(*dep, visited),
                _ => false,
            },
        })
    }
}

impl TaskManager {
    pub fn new(
        config: TaskManagerConfig,
        pool: Arc<WorkerPool>,
        breaker: Arc<CircuitBreaker>,
        sink: Arc<dyn ExecutionSink>,
        monitor: Option<Arc<ResourceMonitor>>,
    ) -> Result<Self, TaskManagerError> {
        config.validate().map_err(TaskManagerError::InvalidConfig)?;

        let pool_events = pool.subscribe();
        let (changes, _) = watch::channel(0u64);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(ManagerShared {
                history: RwLock::new(ExecutionHistory::new(config.history_limit)),
                config,
                pool,
                breaker,
                monitor,
                sink,
                registry: RwLock::new(Registry::default()),
                shutdown_log: RwLock::new(VecDeque::new()),
                event_handlers: StdRwLock::new(Vec::new()),
                changes,
                shutdown_tx,
                idle: Mutex::new(IdleTracker::new(Utc::now())),
            }),
            pool_events: Mutex::new(Some(pool_events)),
            background: Mutex::new(Vec::new()),
            loops: CancellationToken::new(),
            listener: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.shared.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.shared.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.shared.breaker
    }

    /// Add an event handler
    pub fn add_event_handler(&self, handler: Box<dyn TaskEventHandler + Send + Sync>) {
        self.shared
            .event_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Start following pool events and spawn the scheduler and idle loops
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        if !background.is_empty() || self.loops.is_cancelled() {
            debug!("Task manager already started or shut down");
            return;
        }

        if let Some(mut events) = self.pool_events.lock().await.take() {
            let shared = self.shared.clone();
            let token = self.listener.clone();
            background.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            while let Ok(event) = events.try_recv() {
                                shared.handle_pool_event(event).await;
                            }
                            break;
                        }
                        event = events.recv() => match event {
                            Some(event) => shared.handle_pool_event(event).await,
                            None => break,
                        }
                    }
                }
                debug!("Pool event listener exited");
            }));
        }

        let shared = self.shared.clone();
        let token = self.loops.clone();
        background.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(shared.config.scheduler_tick());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        shared.run_scheduler_tick().await;
                    }
                }
            }
            debug!("Scheduler loop exited");
        }));

        let shared = self.shared.clone();
        let token = self.loops.clone();
        background.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(shared.config.idle_check_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        shared.check_idle().await;
                    }
                }
            }
            debug!("Idle detection loop exited");
        }));

        info!(
            "Task manager started (scheduler tick {:?}, idle check {:?})",
            self.shared.config.scheduler_tick(),
            self.shared.config.idle_check_interval()
        );
    }

    /// Stop the loops, shut the worker pool down within the grace period and
    /// settle the statuses of everything the pool reported on the way out
    pub async fn shutdown(&self) {
        if self.loops.is_cancelled() {
            return;
        }
        self.loops.cancel();

        let grace = self.shared.config.shutdown_grace_period();
        self.shared
            .record_shutdown_event(
                ShutdownEvent::new(ShutdownEventType::ManagerShutdown, "task manager shutting down")
                    .with_metadata("grace_period_ms", grace.as_millis() as u64),
            )
            .await;

        self.shared.pool.shutdown(grace).await;
        self.listener.cancel();

        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Task manager background task ended abnormally: {}", e);
            }
        }

        // never started: settle whatever the pool reported directly
        if let Some(mut events) = self.pool_events.lock().await.take() {
            while let Ok(event) = events.try_recv() {
                self.shared.handle_pool_event(event).await;
            }
        }

        info!("Task manager shut down");
    }

    /// Validate and store a task definition
    pub async fn register(&self, definition: TaskDefinition) -> Result<TaskId, TaskManagerError> {
        self.shared.register(definition).await
    }

    /// Register several definitions in order, stopping at the first invalid one
    pub async fn register_all(
        &self,
        definitions: Vec<TaskDefinition>,
    ) -> Result<Vec<TaskId>, TaskManagerError> {
        let mut ids = Vec::with_capacity(definitions.len());
        for definition in definitions {
            ids.push(self.shared.register(definition).await?);
        }
        Ok(ids)
    }

    /// Run `task_ids` and every dependency that has not completed, in
    /// dependency order. With `wait`, returns once every requested task is
    /// terminal or blocked behind a failed, cancelled or unknown dependency.
    pub async fn execute(
        &self,
        task_ids: &[TaskId],
        wait: bool,
    ) -> Result<ExecutionReport, TaskManagerError> {
        self.shared.execute(task_ids, wait).await
    }

    /// Cancel a task. Returns `false` when it was already terminal.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool, TaskManagerError> {
        self.shared.cancel(task_id).await
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, TaskManagerError> {
        let registry = self.shared.registry.read().await;
        registry
            .tasks
            .get(&task_id)
            .map(|entry| entry.task.clone())
            .ok_or(TaskManagerError::TaskNotFound(task_id))
    }

    /// All registered tasks in registration order
    pub async fn tasks(&self) -> Vec<Task> {
        let registry = self.shared.registry.read().await;
        let mut tasks: Vec<Task> = registry
            .tasks
            .values()
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    pub async fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let registry = self.shared.registry.read().await;
        let mut counts = HashMap::new();
        for entry in registry.tasks.values() {
            *counts.entry(entry.task.status).or_insert(0) += 1;
        }
        counts
    }

    /// Most recent executions of one task, newest first
    pub async fn history(
        &self,
        task_id: TaskId,
        limit: usize,
    ) -> Result<Vec<Execution>, TaskManagerError> {
        if !self.shared.registry.read().await.tasks.contains_key(&task_id) {
            return Err(TaskManagerError::TaskNotFound(task_id));
        }
        Ok(self.shared.history.read().await.for_task(task_id, limit))
    }

    /// Most recent executions across all tasks, newest first
    pub async fn recent_history(&self, limit: usize) -> Vec<Execution> {
        self.shared.history.read().await.recent(limit)
    }

    /// Stall, auto-shutdown and idle events, oldest first
    pub async fn shutdown_events(&self) -> Vec<ShutdownEvent> {
        self.shared
            .shutdown_log
            .read()
            .await
            .iter()
            .cloned()
            .collect()
    }

    pub async fn metrics(&self) -> PoolMetrics {
        self.shared.pool.metrics().await
    }

    pub async fn current_usage(&self) -> Result<ResourceSnapshot, MonitorError> {
        match &self.shared.monitor {
            Some(monitor) => monitor.current_usage().await,
            None => Err(MonitorError::NotStarted),
        }
    }

    /// Flips to `true` once the system has been idle past the configured
    /// window with auto-shutdown enabled; terminating is up to the caller
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shared.shutdown_tx.subscribe()
    }

    /// Run one idle detection pass now
    pub async fn check_idle(&self) {
        self.shared.check_idle().await
    }

    /// Run one scheduler pass now, returning the tasks it fired
    pub async fn run_scheduler_tick(&self) -> Vec<TaskId> {
        self.shared.run_scheduler_tick().await
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.loops.cancel();
        self.listener.cancel();
    }
}

impl ManagerShared {
    async fn register(&self, definition: TaskDefinition) -> Result<TaskId, TaskManagerError> {
        validate_definition(&definition)?;
        let task_id = definition.id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();

        let name = {
            let mut registry = self.registry.write().await;
            if registry.tasks.contains_key(&task_id) {
                return Err(TaskManagerError::InvalidTaskDefinition(format!(
                    "task id {} is already registered",
                    task_id
                )));
            }
            if let Some(cycle) = registry
                .graph
                .find_cycle(task_id, &definition.dependencies)
            {
                return Err(TaskManagerError::CyclicDependency { task_id, cycle });
            }

            let task = Task::from_definition(task_id, &definition, now);
            registry
                .graph
                .insert(task_id, definition.dependencies.clone());
            let missing = registry.graph.missing_dependencies(task_id);
            if !missing.is_empty() {
                warn!(
                    "Task '{}' depends on tasks that are not registered yet: {:?}",
                    task.name, missing
                );
            }

            let name = task.name.clone();
            registry.tasks.insert(
                task_id,
                TaskEntry {
                    task,
                    callable: definition.callable,
                    armed: false,
                    work: None,
                    execution: None,
                    shutdown_requested: false,
                },
            );
            name
        };

        info!("Registered task '{}' ({})", name, task_id);
        self.emit_event(&TaskEvent::TaskRegistered { task_id, name });
        self.bump();
        Ok(task_id)
    }

    async fn execute(
        &self,
        task_ids: &[TaskId],
        wait: bool,
    ) -> Result<ExecutionReport, TaskManagerError> {
        let mut changes = self.changes.subscribe();
        {
            let mut guard = self.registry.write().await;
            let registry = &mut *guard;
            if let Some(unknown) = task_ids
                .iter()
                .find(|id| !registry.tasks.contains_key(*id))
            {
                return Err(TaskManagerError::TaskNotFound(*unknown));
            }

            let order = registry.graph.execution_order(task_ids, |dep| {
                registry
                    .tasks
                    .get(&dep)
                    .is_some_and(|entry| entry.task.status != TaskStatus::Completed)
            });

            let now = Utc::now();
            for task_id in order {
                let requested = task_ids.contains(&task_id);
                let Some(entry) = registry.tasks.get_mut(&task_id) else {
                    continue;
                };
                match entry.task.status {
                    TaskStatus::Pending => entry.armed = true,
                    status if status.is_terminal() => {
                        if requested || status != TaskStatus::Completed {
                            self.transition(&mut entry.task, TaskStatus::Pending, now);
                            entry.armed = true;
                        }
                    }
                    _ => debug!("Task '{}' already in flight; joining", entry.task.name),
                }
            }
        }

        self.advance().await;

        loop {
            let report = self.report(task_ids).await;
            if !wait || report.is_settled() {
                return Ok(report);
            }
            if changes.changed().await.is_err() {
                return Ok(report);
            }
        }
    }

    async fn report(&self, task_ids: &[TaskId]) -> ExecutionReport {
        let registry = self.registry.read().await;
        let mut report = ExecutionReport::default();
        for &task_id in task_ids {
            let Some(entry) = registry.tasks.get(&task_id) else {
                continue;
            };
            report.statuses.insert(task_id, entry.task.status);
            if registry.is_blocked(task_id) {
                report.blocked.push(task_id);
            }
        }
        report
    }

    /// Submit every armed pending task whose dependencies have all completed
    async fn advance(&self) {
        let mut guard = self.registry.write().await;
        let registry = &mut *guard;

        let mut ready: Vec<(Reverse<crate::pool::Priority>, DateTime<Utc>, TaskId)> = registry
            .tasks
            .values()
            .filter(|entry| {
                entry.armed
                    && entry.task.status == TaskStatus::Pending
                    && registry.dependencies_completed(&entry.task)
            })
            .map(|entry| {
                (
                    Reverse(entry.task.priority),
                    entry.task.created_at,
                    entry.task.id,
                )
            })
            .collect();
        if ready.is_empty() {
            return;
        }
        ready.sort();

        let now = Utc::now();
        for (_, _, task_id) in ready {
            let Some(entry) = registry.tasks.get_mut(&task_id) else {
                continue;
            };
            self.transition(&mut entry.task, TaskStatus::Ready, now);
            let item = self.work_item(entry);

            match self.pool.submit_item(item).await {
                Ok(handle) => {
                    entry.work = Some(handle);
                    self.transition(&mut entry.task, TaskStatus::Queued, now);
                    registry.by_work.insert(handle.id, task_id);
                }
                Err(e) => {
                    error!("Could not submit task '{}': {}", entry.task.name, e);
                    entry.armed = false;
                    entry.task.error = Some(TaskError::new(error_kind::POOL_STOPPED, e.to_string()));
                    self.transition(&mut entry.task, TaskStatus::Failed, now);
                }
            }
        }
        drop(guard);
        self.bump();
    }

    fn work_item(&self, entry: &TaskEntry) -> WorkItem {
        let task = &entry.task;
        let callable = match &task.circuit_resource {
            Some(resource) => guarded(
                self.breaker.clone(),
                resource.clone(),
                entry.callable.clone(),
            ),
            None => entry.callable.clone(),
        };
        WorkItem::new(task.name.clone(), callable)
            .with_priority(task.priority)
            .with_retry_policy(task.retry_policy.clone())
    }

    async fn handle_pool_event(&self, event: PoolEvent) {
        let work_id = event.work_id();
        let mut finished_execution = None;
        let mut task_finished = false;
        {
            let mut guard = self.registry.write().await;
            let registry = &mut *guard;
            let Some(&task_id) = registry.by_work.get(&work_id) else {
                debug!("Ignoring pool event for untracked work {}", work_id);
                return;
            };
            let Some(entry) = registry.tasks.get_mut(&task_id) else {
                return;
            };
            let now = Utc::now();

            match event {
                PoolEvent::AttemptStarted {
                    attempt,
                    started_at,
                    ..
                } => {
                    self.reconcile(&mut entry.task, TaskStatus::Running, started_at);
                    entry.task.attempts = attempt;
                    let execution = Execution {
                        execution_id: Uuid::new_v4(),
                        task_id,
                        task_name: entry.task.name.clone(),
                        run: entry.task.run_count,
                        attempt_number: attempt,
                        status: ExecutionStatus::Running,
                        started_at,
                        completed_at: None,
                        outcome: None,
                    };
                    entry.execution = Some(execution.execution_id);
                    self.history.write().await.push(execution);
                }
                PoolEvent::AttemptFinished {
                    finished_at,
                    outcome,
                    will_retry,
                    ..
                } => {
                    if let Some(execution_id) = entry.execution.take() {
                        let status = match (&outcome, will_retry) {
                            (WorkOutcome::Succeeded { .. }, _) => ExecutionStatus::Completed,
                            (WorkOutcome::Failed { .. }, true) => ExecutionStatus::Retrying,
                            (WorkOutcome::Failed { .. }, false) => ExecutionStatus::Failed,
                            (WorkOutcome::Cancelled, _) => ExecutionStatus::Cancelled,
                        };
                        finished_execution =
                            self.history.write().await.update(execution_id, |record| {
                                record.status = status;
                                record.completed_at = Some(finished_at);
                                record.outcome = Some(outcome);
                            });
                    }
                }
                PoolEvent::Retrying {
                    next_attempt,
                    delay,
                    ..
                } => {
                    self.reconcile(&mut entry.task, TaskStatus::Retrying, now);
                    debug!(
                        "Task '{}' attempt {} scheduled in {:?}",
                        entry.task.name, next_attempt, delay
                    );
                }
                PoolEvent::Requeued { .. } => {
                    if entry.task.status == TaskStatus::Retrying {
                        self.transition(&mut entry.task, TaskStatus::Queued, now);
                    }
                }
                PoolEvent::Finished {
                    status, outcome, ..
                } => {
                    let next = match status {
                        WorkStatus::Completed => TaskStatus::Completed,
                        WorkStatus::Failed => TaskStatus::Failed,
                        _ => TaskStatus::Cancelled,
                    };
                    if self.reconcile(&mut entry.task, next, now) {
                        entry.task.record_outcome(&outcome);
                        match outcome {
                            WorkOutcome::Succeeded { output } => {
                                self.emit_event(&TaskEvent::TaskCompleted {
                                    task_id,
                                    result: output,
                                })
                            }
                            WorkOutcome::Failed { error } => {
                                self.emit_event(&TaskEvent::TaskFailed { task_id, error })
                            }
                            WorkOutcome::Cancelled => {}
                        }
                    }
                    entry.work = None;
                    entry.armed = false;
                    entry.shutdown_requested = false;
                    registry.by_work.remove(&work_id);
                    task_finished = true;
                }
            }
        }

        if let Some(execution) = finished_execution
            && let Err(e) = self.sink.record_execution(&execution).await
        {
            error!("Failed to persist execution {}: {}", execution.execution_id, e);
        }
        if task_finished {
            self.advance().await;
        }
        self.bump();
    }

    async fn cancel(&self, task_id: TaskId) -> Result<bool, TaskManagerError> {
        let mut guard = self.registry.write().await;
        let registry = &mut *guard;
        let entry = registry
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskManagerError::TaskNotFound(task_id))?;
        let now = Utc::now();

        let cancelled = match entry.task.status {
            status if status.is_active() => {
                let Some(handle) = entry.work else {
                    return Ok(false);
                };
                match self.pool.cancel(handle).await? {
                    CancelOutcome::Dequeued => {
                        entry.task.record_outcome(&WorkOutcome::Cancelled);
                        self.transition(&mut entry.task, TaskStatus::Cancelled, now);
                        entry.work = None;
                        entry.armed = false;
                        registry.by_work.remove(&handle.id);
                        true
                    }
                    CancelOutcome::Signalled => true,
                    CancelOutcome::AlreadyFinished => false,
                }
            }
            TaskStatus::Pending | TaskStatus::Ready => {
                entry.armed = false;
                self.transition(&mut entry.task, TaskStatus::Cancelled, now)
            }
            _ => false,
        };
        drop(guard);

        if cancelled {
            info!("Cancellation requested for task {}", task_id);
            self.bump();
        }
        Ok(cancelled)
    }

    async fn check_idle(&self) {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut to_cancel = Vec::new();

        let busy = {
            let mut guard = self.registry.write().await;
            let registry = &mut *guard;

            for entry in registry.tasks.values_mut() {
                if entry.task.status != TaskStatus::Running {
                    continue;
                }
                let Some(handle) = entry.work else {
                    continue;
                };
                let Ok(progress) = self.pool.progress(handle).await else {
                    continue;
                };
                let Some(idle_for) = idle_duration(&progress, now) else {
                    continue;
                };
                let timeout = self.config.idle_timeout_for(&entry.task);

                if idle_for <= timeout {
                    if entry.task.is_stalled {
                        info!("Task '{}' is making progress again", entry.task.name);
                        entry.task.is_stalled = false;
                        entry.task.stalled_since = None;
                    }
                    continue;
                }

                if !entry.task.is_stalled {
                    entry.task.is_stalled = true;
                    entry.task.stalled_since = Some(now);
                    warn!(
                        "Task '{}' stalled: idle for {:?} (timeout {:?})",
                        entry.task.name, idle_for, timeout
                    );
                    events.push(
                        ShutdownEvent::new(
                            ShutdownEventType::TaskStalled,
                            format!("task '{}' idle for {:?}", entry.task.name, idle_for),
                        )
                        .for_task(entry.task.id)
                        .with_metadata("idle_ms", idle_for.as_millis() as u64)
                        .with_metadata("timeout_ms", timeout.as_millis() as u64),
                    );
                    self.emit_event(&TaskEvent::TaskStalled {
                        task_id: entry.task.id,
                        idle_for,
                    });
                }

                if self.config.auto_shutdown_enabled && !entry.shutdown_requested {
                    let stalled_for = entry
                        .task
                        .stalled_since
                        .map(|since| (now - since).to_std().unwrap_or_default())
                        .unwrap_or_default();
                    if stalled_for >= self.config.shutdown_grace_period() {
                        entry.shutdown_requested = true;
                        to_cancel.push((entry.task.id, entry.task.name.clone(), idle_for));
                    }
                }
            }

            registry
                .tasks
                .values()
                .any(|entry| entry.task.status.is_active() || entry.task.status == TaskStatus::Ready)
        };

        for (task_id, name, idle_for) in to_cancel {
            match self.cancel(task_id).await {
                Ok(_) => {
                    warn!("Auto-shutdown cancelled stalled task '{}'", name);
                    events.push(
                        ShutdownEvent::new(
                            ShutdownEventType::TaskAutoShutdown,
                            format!("cancelled stalled task '{}'", name),
                        )
                        .for_task(task_id)
                        .with_metadata("idle_ms", idle_for.as_millis() as u64),
                    );
                }
                Err(e) => error!("Auto-shutdown of task '{}' failed: {}", name, e),
            }
        }

        let pool_state = self.pool.metrics().await.state;
        let busy = busy || pool_state.active_count > 0 || pool_state.queued_count > 0;
        let transition =
            self.idle
                .lock()
                .await
                .observe(busy, now, self.config.global_idle_timeout());

        match transition {
            IdleTransition::WindowExceeded { idle_for } if self.config.auto_shutdown_enabled => {
                warn!("System idle for {:?}; signalling shutdown", idle_for);
                self.shutdown_tx.send_replace(true);
                events.push(
                    ShutdownEvent::new(
                        ShutdownEventType::SystemIdleShutdown,
                        format!("no queued or running work for {:?}", idle_for),
                    )
                    .with_metadata("idle_ms", idle_for.as_millis() as u64),
                );
            }
            IdleTransition::WindowExceeded { idle_for } => {
                info!("System idle for {:?}; auto-shutdown disabled", idle_for);
            }
            IdleTransition::Resumed => {
                if self.shutdown_tx.send_replace(false) {
                    info!("Work resumed; shutdown signal cleared");
                }
            }
            IdleTransition::None => {}
        }

        let changed = !events.is_empty();
        for event in events {
            self.record_shutdown_event(event).await;
        }
        if changed {
            self.bump();
        }
    }

    async fn run_scheduler_tick(&self) -> Vec<TaskId> {
        let now = Utc::now();
        let due = {
            let mut registry = self.registry.write().await;
            let mut due = Vec::new();
            for entry in registry.tasks.values_mut() {
                let task = &mut entry.task;
                if !schedule::is_due(&task.schedule, task.created_at, task.last_fired_at, now) {
                    continue;
                }
                task.last_fired_at = Some(now);
                let in_flight = task.status.is_active()
                    || task.status == TaskStatus::Ready
                    || (task.status == TaskStatus::Pending && entry.armed);
                if in_flight {
                    debug!("Scheduled run of '{}' skipped: previous run active", task.name);
                    continue;
                }
                due.push(task.id);
            }
            due
        };

        for &task_id in &due {
            debug!("Firing scheduled task {}", task_id);
            if let Err(e) = self.execute(&[task_id], false).await {
                error!("Scheduled execution of {} failed: {}", task_id, e);
            }
        }
        due
    }

    async fn record_shutdown_event(&self, event: ShutdownEvent) {
        {
            let mut log = self.shutdown_log.write().await;
            log.push_back(event.clone());
            while log.len() > self.config.history_limit {
                log.pop_front();
            }
        }
        if let Err(e) = self.sink.record_event(&event).await {
            error!("Failed to persist shutdown event: {}", e);
        }
    }

    /// Move `task` to `next`, first walking through the intermediate states
    /// the pool passed without a matching event being applied
    fn reconcile(&self, task: &mut Task, next: TaskStatus, now: DateTime<Utc>) -> bool {
        use TaskStatus::*;
        let path: &[TaskStatus] = match (task.status, next) {
            (Retrying, Running) => &[Queued],
            (Queued, Retrying | Completed | Failed) => &[Running],
            (Retrying, Completed | Failed) => &[Queued, Running],
            _ => &[],
        };
        for step in path {
            self.transition(task, *step, now);
        }
        self.transition(task, next, now)
    }

    /// Move `task` to `next` if the state machine allows it
    fn transition(&self, task: &mut Task, next: TaskStatus, now: DateTime<Utc>) -> bool {
        let previous = task.status;
        if previous == next {
            return false;
        }
        if !previous.can_transition_to(next) {
            warn!(
                "Ignoring illegal transition {} -> {} for task '{}'",
                previous, next, task.name
            );
            return false;
        }
        task.apply_status(next, now);
        debug!("Task '{}': {} -> {}", task.name, previous, next);
        self.emit_event(&TaskEvent::TaskStatusChanged {
            task_id: task.id,
            old_status: previous,
            new_status: next,
        });
        true
    }

    fn emit_event(&self, event: &TaskEvent) {
        let handlers = self
            .event_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner());
        for handler in handlers.iter() {
            if let Err(e) = handler.handle_event(event) {
                error!("Event handler failed: {}", e);
            }
        }
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }
}

fn validate_definition(definition: &TaskDefinition) -> Result<(), TaskManagerError> {
    let invalid = |message: String| Err(TaskManagerError::InvalidTaskDefinition(message));

    if definition.name.trim().is_empty() {
        return invalid("task name must not be empty".to_string());
    }
    if definition.id.is_some_and(|id| id.is_nil()) {
        return invalid("task id must not be nil".to_string());
    }
    if definition.task_type.trim().is_empty() {
        return invalid(format!("task '{}' has an empty task type", definition.name));
    }
    if let Err(e) = schedule::validate(&definition.schedule) {
        return invalid(format!("task '{}': {}", definition.name, e));
    }
    if let Err(e) = definition.retry_policy.validate() {
        return invalid(format!("task '{}': {}", definition.name, e));
    }
    if definition.idle_timeout.is_some_and(|t| t.is_zero()) {
        return invalid(format!(
            "task '{}' has a zero idle timeout",
            definition.name
        ));
    }
    if definition
        .circuit_resource
        .as_deref()
        .is_some_and(|r| r.trim().is_empty())
    {
        return invalid(format!(
            "task '{}' has an empty circuit resource name",
            definition.name
        ));
    }
    Ok(())
}

/// Route every invocation of `inner` through the breaker for `resource`
fn guarded(breaker: Arc<CircuitBreaker>, resource: String, inner: WorkFn) -> WorkFn {
    work_fn(move |ctx| {
        let breaker = breaker.clone();
        let resource = resource.clone();
        let inner = inner.clone();
        async move {
            breaker
                .call(&resource, || inner(ctx))
                .await
                .map_err(TaskError::from)
        }
    })
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

impl TaskEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &TaskEvent) -> Result<()> {
        match event {
            TaskEvent::TaskRegistered { task_id, name } => {
                info!("Task registered: {} ({})", name, task_id);
            }
            TaskEvent::TaskStatusChanged {
                task_id,
                old_status,
                new_status,
            } => {
                info!("Task {} status: {} -> {}", task_id, old_status, new_status);
            }
            TaskEvent::TaskCompleted { task_id, .. } => {
                info!("Task completed: {}", task_id);
            }
            TaskEvent::TaskFailed { task_id, error } => {
                warn!("Task failed: {} - {}", task_id, error);
            }
            TaskEvent::TaskStalled { task_id, idle_for } => {
                warn!("Task stalled: {} (idle {:?})", task_id, idle_for);
            }
        }
        Ok(())
    }
}
