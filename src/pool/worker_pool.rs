use crate::monitor::ConcurrencyAdvisor;
use crate::pool::queue::PriorityQueue;
use crate::pool::types::*;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long an idle worker sleeps before re-checking the queue on its own
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Dynamically sized pool of async workers draining a strict-priority queue.
///
/// Work is accepted as soon as the pool is created; it runs once `start` has
/// spawned the workers. After `shutdown` every submission fails with
/// [`PoolError::PoolStopped`].
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    resize_loop: Mutex<Option<JoinHandle<()>>>,
}

struct PoolShared {
    config: PoolConfig,
    advisor: Option<Arc<dyn ConcurrencyAdvisor>>,
    state: Mutex<PoolInner>,
    work_available: Notify,
    subscribers: StdMutex<Vec<UnboundedSender<PoolEvent>>>,
    running: AtomicBool,
    stop: CancellationToken,
    next_worker_id: AtomicUsize,
}

#[derive(Default)]
struct PoolInner {
    queue: PriorityQueue<WorkId>,
    entries: HashMap<WorkId, WorkEntry>,
    current_size: usize,
    active_count: usize,
    retire_pending: usize,
    counters: PoolCounters,
    finished_order: VecDeque<WorkId>,
    workers: Vec<JoinHandle<()>>,
}

struct WorkEntry {
    item: WorkItem,
    status_tx: watch::Sender<WorkStatus>,
    cancel: CancellationToken,
    progress: Arc<ProgressTracker>,
    attempts: u32,
    outcome: Option<WorkOutcome>,
}

impl WorkEntry {
    fn status(&self) -> WorkStatus {
        *self.status_tx.borrow()
    }
}

/// A dequeued attempt, carried out without holding the pool lock
struct Job {
    id: WorkId,
    label: String,
    attempt: u32,
    started_at: DateTime<Utc>,
    work: WorkFn,
    ctx: TaskContext,
}

impl WorkerPool {
    /// Pool with static sizing at `min_workers`
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::build(config, None)
    }

    /// Pool that asks `advisor` for a new size every `resize_interval`
    pub fn with_advisor(
        config: PoolConfig,
        advisor: Arc<dyn ConcurrencyAdvisor>,
    ) -> Result<Self, PoolError> {
        Self::build(config, Some(advisor))
    }

    fn build(
        config: PoolConfig,
        advisor: Option<Arc<dyn ConcurrencyAdvisor>>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                advisor,
                state: Mutex::new(PoolInner::default()),
                work_available: Notify::new(),
                subscribers: StdMutex::new(Vec::new()),
                running: AtomicBool::new(false),
                stop: CancellationToken::new(),
                next_worker_id: AtomicUsize::new(0),
            }),
            resize_loop: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Spawn `min_workers` workers and, when an advisor is present, the resize loop
    pub async fn start(&self) -> Result<(), PoolError> {
        if self.shared.stop.is_cancelled() {
            return Err(PoolError::PoolStopped);
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("Worker pool already running");
            return Ok(());
        }

        {
            let mut inner = self.shared.state.lock().await;
            for _ in 0..self.shared.config.min_workers {
                self.shared.spawn_worker(&mut inner);
            }
        }

        if self.shared.advisor.is_some() {
            let shared = self.shared.clone();
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(shared.config.resize_interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // The first tick fires immediately; give workers one interval first.
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = shared.stop.cancelled() => break,
                        _ = interval.tick() => {
                            shared.adjust_size().await;
                        }
                    }
                }
                debug!("Resize loop exited");
            });
            *self.resize_loop.lock().await = Some(handle);
        }

        info!(
            "Worker pool started with {} workers (min {}, max {})",
            self.shared.config.min_workers,
            self.shared.config.min_workers,
            self.shared.config.max_workers
        );
        Ok(())
    }

    /// Enqueue `work` with the given priority and up to `max_retries` retries
    pub async fn submit(
        &self,
        work: WorkFn,
        priority: Priority,
        max_retries: u32,
    ) -> Result<WorkHandle, PoolError> {
        let item = WorkItem::new("work", work)
            .with_priority(priority)
            .with_retry_policy(RetryPolicy::default().with_max_attempts(max_retries));
        self.submit_item(item).await
    }

    pub async fn submit_item(&self, item: WorkItem) -> Result<WorkHandle, PoolError> {
        item.retry_policy
            .validate()
            .map_err(PoolError::InvalidRetryPolicy)?;

        let id = Uuid::new_v4();
        let priority = item.priority;
        let label = item.label.clone();
        {
            let mut inner = self.shared.state.lock().await;
            if self.shared.stop.is_cancelled() {
                return Err(PoolError::PoolStopped);
            }
            let (status_tx, _) = watch::channel(WorkStatus::Queued);
            inner.entries.insert(
                id,
                WorkEntry {
                    item,
                    status_tx,
                    cancel: CancellationToken::new(),
                    progress: Arc::new(ProgressTracker::default()),
                    attempts: 0,
                    outcome: None,
                },
            );
            inner.queue.push(priority, id);
            inner.counters.submitted += 1;
        }
        self.shared.work_available.notify_one();

        debug!("Submitted work {} ({}) at priority {}", id, label, priority);
        Ok(WorkHandle { id })
    }

    /// Wait until the item is terminal or `timeout` elapses.
    ///
    /// Returns the terminal status, or the current status on timeout. Never
    /// cancels the item.
    pub async fn wait(
        &self,
        handle: WorkHandle,
        timeout: Option<Duration>,
    ) -> Result<WorkStatus, PoolError> {
        let mut rx = {
            let inner = self.shared.state.lock().await;
            let entry = inner
                .entries
                .get(&handle.id)
                .ok_or(PoolError::UnknownWork(handle.id))?;
            entry.status_tx.subscribe()
        };

        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx.wait_for(WorkStatus::is_terminal))
                .await
                .ok()
                .and_then(|r| r.ok().map(|status| *status)),
            None => rx.wait_for(WorkStatus::is_terminal).await.ok().map(|s| *s),
        };

        Ok(waited.unwrap_or_else(|| *rx.borrow()))
    }

    /// Request cooperative cancellation
    pub async fn cancel(&self, handle: WorkHandle) -> Result<CancelOutcome, PoolError> {
        let outcome = {
            let mut guard = self.shared.state.lock().await;
            let inner = &mut *guard;
            let entry = inner
                .entries
                .get(&handle.id)
                .ok_or(PoolError::UnknownWork(handle.id))?;

            let (outcome, event) = match entry.status() {
                WorkStatus::Queued => {
                    entry.cancel.cancel();
                    let priority = entry.item.priority;
                    inner.queue.remove_where(priority, |id| *id == handle.id);
                    let event = self.shared.finish(
                        inner,
                        handle.id,
                        WorkStatus::Cancelled,
                        WorkOutcome::Cancelled,
                    );
                    (CancelOutcome::Dequeued, event)
                }
                WorkStatus::Retrying => {
                    // The pending requeue observes the token and drops out.
                    entry.cancel.cancel();
                    let event = self.shared.finish(
                        inner,
                        handle.id,
                        WorkStatus::Cancelled,
                        WorkOutcome::Cancelled,
                    );
                    (CancelOutcome::Dequeued, event)
                }
                WorkStatus::Running => {
                    entry.cancel.cancel();
                    (CancelOutcome::Signalled, None)
                }
                _ => (CancelOutcome::AlreadyFinished, None),
            };
            if let Some(event) = event {
                self.shared.emit(event);
            }
            outcome
        };

        debug!("Cancel {}: {:?}", handle.id, outcome);
        Ok(outcome)
    }

    pub async fn status(&self, handle: WorkHandle) -> Result<WorkStatus, PoolError> {
        let inner = self.shared.state.lock().await;
        inner
            .entries
            .get(&handle.id)
            .map(WorkEntry::status)
            .ok_or(PoolError::UnknownWork(handle.id))
    }

    /// Terminal outcome, `None` while the item is still in flight
    pub async fn outcome(&self, handle: WorkHandle) -> Result<Option<WorkOutcome>, PoolError> {
        let inner = self.shared.state.lock().await;
        inner
            .entries
            .get(&handle.id)
            .map(|entry| entry.outcome.clone())
            .ok_or(PoolError::UnknownWork(handle.id))
    }

    /// Start time and last heartbeat of the item's current attempt
    pub async fn progress(&self, handle: WorkHandle) -> Result<ProgressInfo, PoolError> {
        let inner = self.shared.state.lock().await;
        inner
            .entries
            .get(&handle.id)
            .map(|entry| entry.progress.snapshot())
            .ok_or(PoolError::UnknownWork(handle.id))
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let inner = self.shared.state.lock().await;
        let retrying_count = inner
            .entries
            .values()
            .filter(|entry| entry.status() == WorkStatus::Retrying)
            .count();

        PoolMetrics {
            state: WorkerPoolState {
                min_workers: self.shared.config.min_workers,
                max_workers: self.shared.config.max_workers,
                current_size: inner.current_size - inner.retire_pending.min(inner.current_size),
                active_count: inner.active_count,
                queued_count: inner.queue.len(),
            },
            queue_depths: inner.queue.depths(),
            retrying_count,
            counters: inner.counters,
            running: self.is_running(),
        }
    }

    /// Receive every pool event from now on
    pub fn subscribe(&self) -> UnboundedReceiver<PoolEvent> {
        let (tx, rx) = unbounded_channel();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Perform one resize step against the advisor's recommendation.
    ///
    /// Returns the effective pool size afterwards.
    pub async fn adjust_size(&self) -> usize {
        self.shared.adjust_size().await
    }

    /// Stop accepting work, cancel everything still queued and wait up to
    /// `grace` for in-flight attempts. Attempts still running after that have
    /// their tokens cancelled and get one more `grace` period before they
    /// are detached.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shared.stop.is_cancelled() {
            return;
        }

        let mut workers = {
            let mut guard = self.shared.state.lock().await;
            let inner = &mut *guard;
            self.shared.stop.cancel();
            self.shared.running.store(false, Ordering::SeqCst);

            let pending: Vec<WorkId> = inner
                .entries
                .iter()
                .filter(|(_, entry)| {
                    matches!(entry.status(), WorkStatus::Queued | WorkStatus::Retrying)
                })
                .map(|(id, _)| *id)
                .collect();
            inner.queue.drain();

            let mut events = Vec::new();
            for id in pending {
                if let Some(entry) = inner.entries.get(&id) {
                    entry.cancel.cancel();
                }
                events.extend(self.shared.finish(
                    inner,
                    id,
                    WorkStatus::Cancelled,
                    WorkOutcome::Cancelled,
                ));
            }
            for event in events {
                self.shared.emit(event);
            }
            std::mem::take(&mut inner.workers)
        };

        self.shared.work_available.notify_waiters();

        if let Some(handle) = self.resize_loop.lock().await.take()
            && let Err(e) = handle.await
        {
            error!("Resize loop ended abnormally: {}", e);
        }

        let drained = tokio::time::timeout(grace, futures::future::join_all(workers.iter_mut()))
            .await
            .is_ok();

        if !drained {
            let in_flight: Vec<WorkId> = {
                let inner = self.shared.state.lock().await;
                inner
                    .entries
                    .iter()
                    .filter(|(_, entry)| entry.status() == WorkStatus::Running)
                    .map(|(id, entry)| {
                        entry.cancel.cancel();
                        *id
                    })
                    .collect()
            };
            warn!(
                "Grace period elapsed with {} attempts in flight; cancellation requested",
                in_flight.len()
            );

            let stragglers: Vec<JoinHandle<()>> =
                workers.into_iter().filter(|h| !h.is_finished()).collect();
            let remaining = stragglers.len();
            if tokio::time::timeout(grace, futures::future::join_all(stragglers))
                .await
                .is_err()
            {
                warn!("Detaching {} workers that ignored cancellation", remaining);
            }
        }

        info!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.stop.cancel();
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

impl PoolShared {
    fn spawn_worker(self: &Arc<Self>, inner: &mut PoolInner) {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let shared = self.clone();
        inner.current_size += 1;
        inner.workers.retain(|handle| !handle.is_finished());
        inner
            .workers
            .push(tokio::spawn(async move { shared.worker_loop(worker_id).await }));
        debug!("Spawned worker {}", worker_id);
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            if self.stop.is_cancelled() {
                break;
            }

            let next = {
                let mut guard = self.state.lock().await;
                let inner = &mut *guard;
                if inner.retire_pending > 0 {
                    inner.retire_pending -= 1;
                    inner.current_size = inner.current_size.saturating_sub(1);
                    let backlog = !inner.queue.is_empty();
                    drop(guard);
                    if backlog {
                        self.work_available.notify_one();
                    }
                    debug!("Worker {} retired", worker_id);
                    return;
                }
                let job = Self::dequeue(inner);
                if let Some(job) = &job {
                    self.emit(PoolEvent::AttemptStarted {
                        work_id: job.id,
                        label: job.label.clone(),
                        attempt: job.attempt,
                        started_at: job.started_at,
                    });
                }
                if job.is_some() && !inner.queue.is_empty() {
                    self.work_available.notify_one();
                }
                job
            };

            match next {
                Some(job) => self.run_job(job).await,
                None => {
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = self.work_available.notified() => {}
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
            }
        }

        let mut inner = self.state.lock().await;
        inner.current_size = inner.current_size.saturating_sub(1);
        debug!("Worker {} stopped", worker_id);
    }

    fn dequeue(inner: &mut PoolInner) -> Option<Job> {
        while let Some((_, id)) = inner.queue.pop() {
            let Some(entry) = inner.entries.get_mut(&id) else {
                continue;
            };
            if entry.status() != WorkStatus::Queued {
                continue;
            }

            entry.attempts += 1;
            let started_at = Utc::now();
            entry.progress.reset(started_at);
            entry.status_tx.send_replace(WorkStatus::Running);
            let ctx = TaskContext::new(
                id,
                entry.attempts,
                entry.cancel.clone(),
                entry.progress.clone(),
            );
            let job = Job {
                id,
                label: entry.item.label.clone(),
                attempt: entry.attempts,
                started_at,
                work: entry.item.work.clone(),
                ctx,
            };
            inner.active_count += 1;
            return Some(job);
        }
        None
    }

    async fn run_job(self: &Arc<Self>, job: Job) {
        debug!("Attempt {} of {} ({}) started", job.attempt, job.id, job.label);

        let result = match catch_unwind(AssertUnwindSafe(|| (job.work)(job.ctx.clone()))) {
            Ok(future) => AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(TaskError::panicked(panic_message(panic)))),
            Err(panic) => Err(TaskError::panicked(panic_message(panic))),
        };

        self.complete_attempt(job, result).await;
    }

    async fn complete_attempt(self: &Arc<Self>, job: Job, result: WorkResult) {
        let mut retry = None;
        {
            let mut events = Vec::new();
            let mut guard = self.state.lock().await;
            let inner = &mut *guard;
            inner.active_count = inner.active_count.saturating_sub(1);

            let Some(entry) = inner.entries.get_mut(&job.id) else {
                return;
            };
            let finished_at = Utc::now();

            if entry.cancel.is_cancelled() {
                events.push(PoolEvent::AttemptFinished {
                    work_id: job.id,
                    attempt: job.attempt,
                    finished_at,
                    outcome: WorkOutcome::Cancelled,
                    will_retry: false,
                });
                events.extend(self.finish(
                    inner,
                    job.id,
                    WorkStatus::Cancelled,
                    WorkOutcome::Cancelled,
                ));
            } else {
                match result {
                    Ok(output) => {
                        let outcome = WorkOutcome::Succeeded { output };
                        events.push(PoolEvent::AttemptFinished {
                            work_id: job.id,
                            attempt: job.attempt,
                            finished_at,
                            outcome: outcome.clone(),
                            will_retry: false,
                        });
                        events.extend(self.finish(inner, job.id, WorkStatus::Completed, outcome));
                    }
                    Err(error) => {
                        let retries_used = entry.attempts.saturating_sub(1);
                        let will_retry = !self.stop.is_cancelled()
                            && entry.item.retry_policy.should_retry(&error, retries_used);
                        if will_retry {
                            let delay = entry.item.retry_policy.delay_for(entry.attempts);
                            entry.status_tx.send_replace(WorkStatus::Retrying);
                            retry = Some((delay, entry.cancel.clone()));
                            warn!(
                                "Attempt {} of {} failed ({}); retrying in {:?}",
                                job.attempt, job.id, error, delay
                            );
                            inner.counters.retried += 1;
                            events.push(PoolEvent::AttemptFinished {
                                work_id: job.id,
                                attempt: job.attempt,
                                finished_at,
                                outcome: WorkOutcome::Failed { error },
                                will_retry: true,
                            });
                            events.push(PoolEvent::Retrying {
                                work_id: job.id,
                                next_attempt: job.attempt + 1,
                                delay,
                            });
                        } else {
                            error!("Work {} failed after {} attempts: {}", job.id, job.attempt, error);
                            let outcome = WorkOutcome::Failed { error };
                            events.push(PoolEvent::AttemptFinished {
                                work_id: job.id,
                                attempt: job.attempt,
                                finished_at,
                                outcome: outcome.clone(),
                                will_retry: false,
                            });
                            events.extend(self.finish(inner, job.id, WorkStatus::Failed, outcome));
                        }
                    }
                }
            }

            for event in events {
                self.emit(event);
            }
        }

        if let Some((delay, token)) = retry {
            let shared = self.clone();
            let id = job.id;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => shared.requeue(id).await,
                }
            });
        }
    }

    async fn requeue(&self, id: WorkId) {
        {
            let mut guard = self.state.lock().await;
            let inner = &mut *guard;
            let Some(entry) = inner.entries.get(&id) else {
                return;
            };
            if entry.status() != WorkStatus::Retrying {
                return;
            }
            entry.status_tx.send_replace(WorkStatus::Queued);
            let priority = entry.item.priority;
            inner.queue.push(priority, id);
            self.emit(PoolEvent::Requeued { work_id: id });
        }
        self.work_available.notify_one();
    }

    /// Record a terminal transition; `None` if the item was already terminal
    fn finish(
        &self,
        inner: &mut PoolInner,
        id: WorkId,
        status: WorkStatus,
        outcome: WorkOutcome,
    ) -> Option<PoolEvent> {
        let entry = inner.entries.get_mut(&id)?;
        if entry.status().is_terminal() {
            return None;
        }
        entry.outcome = Some(outcome.clone());
        entry.status_tx.send_replace(status);

        match status {
            WorkStatus::Completed => inner.counters.completed += 1,
            WorkStatus::Failed => inner.counters.failed += 1,
            WorkStatus::Cancelled => inner.counters.cancelled += 1,
            _ => {}
        }

        inner.finished_order.push_back(id);
        while inner.finished_order.len() > self.config.retain_finished {
            if let Some(evicted) = inner.finished_order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }

        Some(PoolEvent::Finished {
            work_id: id,
            status,
            outcome,
        })
    }

    async fn adjust_size(self: &Arc<Self>) -> usize {
        let Some(advisor) = self.advisor.clone() else {
            let inner = self.state.lock().await;
            return inner.current_size - inner.retire_pending.min(inner.current_size);
        };
        if self.stop.is_cancelled() {
            return 0;
        }

        let effective = {
            let inner = self.state.lock().await;
            inner.current_size - inner.retire_pending.min(inner.current_size)
        };
        let recommended = advisor
            .recommend_workers(effective)
            .await
            .clamp(self.config.min_workers, self.config.max_workers);

        let mut guard = self.state.lock().await;
        let inner = &mut *guard;
        let effective = inner.current_size - inner.retire_pending.min(inner.current_size);

        if recommended > effective {
            if inner.retire_pending > 0 {
                inner.retire_pending -= 1;
            } else {
                self.spawn_worker(inner);
            }
            info!("Worker pool grown {} -> {}", effective, effective + 1);
            effective + 1
        } else if recommended < effective {
            inner.retire_pending += 1;
            self.work_available.notify_one();
            info!("Worker pool shrinking {} -> {}", effective, effective - 1);
            effective - 1
        } else {
            effective
        }
    }

    /// Callers hold the state lock, so one item's events are sent in the
    /// order its state changed.
    fn emit(&self, event: PoolEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("task panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("task panicked: {}", message)
    } else {
        "task panicked".to_string()
    }
}
