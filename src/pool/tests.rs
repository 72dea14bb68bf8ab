use super::*;
use crate::monitor::ConcurrencyAdvisor;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Notify;

fn single_worker() -> PoolConfig {
    PoolConfig {
        min_workers: 1,
        max_workers: 1,
        resize_interval_ms: 60_000,
        ..Default::default()
    }
}

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::none()
        .with_max_attempts(max_attempts)
        .with_base_delay(Duration::from_millis(10))
        .with_jitter(false)
}

async fn wait_for_status(pool: &WorkerPool, handle: WorkHandle, expected: WorkStatus) {
    for _ in 0..200 {
        if pool.status(handle).await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("work never reached {:?}", expected);
}

fn recording(label: &'static str, log: Arc<StdMutex<Vec<&'static str>>>) -> WorkFn {
    work_fn(move |_ctx| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(label);
            Ok(json!(label))
        }
    })
}

#[tokio::test]
async fn test_priority_order_with_single_worker() {
    let pool = WorkerPool::new(single_worker()).unwrap();
    pool.start().await.unwrap();

    let gate = Arc::new(Notify::new());
    let blocker_gate = gate.clone();
    let blocker = pool
        .submit_item(WorkItem::new(
            "blocker",
            work_fn(move |_ctx| {
                let gate = blocker_gate.clone();
                async move {
                    gate.notified().await;
                    Ok(json!(null))
                }
            }),
        ))
        .await
        .unwrap();
    wait_for_status(&pool, blocker, WorkStatus::Running).await;

    let log = Arc::new(StdMutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (label, priority) in [
        ("low-1", Priority::Low),
        ("high", Priority::High),
        ("low-2", Priority::Low),
        ("critical", Priority::Critical),
    ] {
        let item = WorkItem::new(label, recording(label, log.clone())).with_priority(priority);
        handles.push(pool.submit_item(item).await.unwrap());
    }

    let metrics = pool.metrics().await;
    assert_eq!(metrics.queue_depths.low, 2);
    assert_eq!(metrics.queue_depths.total(), 4);

    gate.notify_one();
    for handle in handles {
        let status = pool.wait(handle, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(status, WorkStatus::Completed);
    }

    assert_eq!(
        *log.lock().unwrap(),
        vec!["critical", "high", "low-1", "low-2"]
    );
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_successful_work_records_outcome() {
    let pool = WorkerPool::new(PoolConfig::default()).unwrap();
    pool.start().await.unwrap();

    let handle = pool
        .submit(work_fn(|ctx| async move { Ok(json!({ "attempt": ctx.attempt })) }), Priority::Normal, 0)
        .await
        .unwrap();

    assert_eq!(pool.wait(handle, None).await.unwrap(), WorkStatus::Completed);
    assert_eq!(
        pool.outcome(handle).await.unwrap(),
        Some(WorkOutcome::Succeeded {
            output: json!({ "attempt": 1 })
        })
    );
    assert_eq!(pool.metrics().await.counters.completed, 1);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_always_failing_work_is_retried_then_failed() {
    let pool = WorkerPool::new(single_worker()).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let item = WorkItem::new(
        "flaky",
        work_fn(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskError::transient("connection reset")) }
        }),
    )
    .with_retry_policy(fast_retries(2));

    let handle = pool.submit_item(item).await.unwrap();
    let status = pool.wait(handle, Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(status, WorkStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let mut started = Vec::new();
    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::AttemptStarted { attempt, .. } => started.push(attempt),
            PoolEvent::Retrying { .. } => retries += 1,
            _ => {}
        }
    }
    assert_eq!(started, vec![1, 2, 3]);
    assert_eq!(retries, 2);

    let metrics = pool.metrics().await;
    assert_eq!(metrics.counters.retried, 2);
    assert_eq!(metrics.counters.failed, 1);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_errors_outside_retry_set_fail_immediately() {
    let pool = WorkerPool::new(single_worker()).unwrap();
    pool.start().await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let item = WorkItem::new(
        "strict",
        work_fn(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskError::fatal("schema mismatch")) }
        }),
    )
    .with_retry_policy(fast_retries(5).retry_on(ErrorMatcher::kinds([error_kind::TRANSIENT])));

    let handle = pool.submit_item(item).await.unwrap();
    assert_eq!(pool.wait(handle, None).await.unwrap(), WorkStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_cancel_queued_work_never_runs() {
    let pool = WorkerPool::new(single_worker()).unwrap();
    let mut events = pool.subscribe();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handle = pool
        .submit(
            work_fn(move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!(null)) }
            }),
            Priority::High,
            0,
        )
        .await
        .unwrap();

    assert_eq!(pool.cancel(handle).await.unwrap(), CancelOutcome::Dequeued);
    assert_eq!(pool.status(handle).await.unwrap(), WorkStatus::Cancelled);
    assert_eq!(pool.metrics().await.queue_depths.total(), 0);

    pool.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, PoolEvent::AttemptStarted { .. }));
    }
    assert_eq!(
        pool.cancel(handle).await.unwrap(),
        CancelOutcome::AlreadyFinished
    );
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_running_work_observes_cancellation() {
    let pool = WorkerPool::new(single_worker()).unwrap();
    pool.start().await.unwrap();

    let handle = pool
        .submit(
            work_fn(|ctx| async move {
                loop {
                    ctx.heartbeat();
                    tokio::select! {
                        _ = ctx.cancelled() => return Ok(json!("stopped early")),
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                    }
                }
            }),
            Priority::Normal,
            3,
        )
        .await
        .unwrap();
    wait_for_status(&pool, handle, WorkStatus::Running).await;

    let progress = pool.progress(handle).await.unwrap();
    assert!(progress.started_at.is_some());

    assert_eq!(pool.cancel(handle).await.unwrap(), CancelOutcome::Signalled);
    let status = pool.wait(handle, Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(status, WorkStatus::Cancelled);
    assert_eq!(
        pool.outcome(handle).await.unwrap(),
        Some(WorkOutcome::Cancelled)
    );
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_wait_timeout_returns_current_status() {
    let pool = WorkerPool::new(single_worker()).unwrap();
    pool.start().await.unwrap();

    let handle = pool
        .submit(
            work_fn(|ctx| async move {
                ctx.cancelled().await;
                Err(TaskError::cancelled())
            }),
            Priority::Normal,
            0,
        )
        .await
        .unwrap();

    let status = pool
        .wait(handle, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(!status.is_terminal());
    assert!(!pool.status(handle).await.unwrap().is_terminal());

    pool.cancel(handle).await.unwrap();
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_panicking_work_fails_with_panic_kind() {
    let pool = WorkerPool::new(single_worker()).unwrap();
    pool.start().await.unwrap();

    let handle = pool
        .submit(
            work_fn(|_ctx| async move {
                if true {
                    panic!("boom");
                }
                Ok(json!(null))
            }),
            Priority::Normal,
            0,
        )
        .await
        .unwrap();

    assert_eq!(pool.wait(handle, None).await.unwrap(), WorkStatus::Failed);
    match pool.outcome(handle).await.unwrap() {
        Some(WorkOutcome::Failed { error }) => assert_eq!(error.kind, error_kind::PANIC),
        other => panic!("unexpected outcome {:?}", other),
    }
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
    let pool = WorkerPool::new(single_worker()).unwrap();
    pool.start().await.unwrap();

    let queued = pool
        .submit(work_fn(|_ctx| async { Ok(json!(null)) }), Priority::Low, 0)
        .await
        .unwrap();
    pool.shutdown(Duration::from_millis(200)).await;

    assert!(pool.status(queued).await.unwrap().is_terminal());
    let result = pool
        .submit(work_fn(|_ctx| async { Ok(json!(null)) }), Priority::Low, 0)
        .await;
    assert_eq!(result, Err(PoolError::PoolStopped));
    assert_eq!(pool.start().await, Err(PoolError::PoolStopped));
    assert!(!pool.metrics().await.running);
}

#[tokio::test]
async fn test_shutdown_cancels_queued_work() {
    let pool = WorkerPool::new(single_worker()).unwrap();
    let first = pool
        .submit(work_fn(|_ctx| async { Ok(json!(1)) }), Priority::Normal, 0)
        .await
        .unwrap();
    let second = pool
        .submit(work_fn(|_ctx| async { Ok(json!(2)) }), Priority::Normal, 0)
        .await
        .unwrap();

    pool.shutdown(Duration::from_millis(100)).await;

    assert_eq!(pool.status(first).await.unwrap(), WorkStatus::Cancelled);
    assert_eq!(pool.status(second).await.unwrap(), WorkStatus::Cancelled);
    assert_eq!(pool.metrics().await.counters.cancelled, 2);
}

#[tokio::test]
async fn test_unknown_handle() {
    let pool = WorkerPool::new(single_worker()).unwrap();
    let handle = WorkHandle {
        id: uuid::Uuid::new_v4(),
    };
    assert_eq!(
        pool.status(handle).await,
        Err(PoolError::UnknownWork(handle.id))
    );
}

struct FixedAdvisor(usize);

#[async_trait::async_trait]
impl ConcurrencyAdvisor for FixedAdvisor {
    async fn recommend_workers(&self, _current_workers: usize) -> usize {
        self.0
    }
}

/// Flips between "far too many" and "none at all" on every call
struct AlternatingAdvisor {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ConcurrencyAdvisor for AlternatingAdvisor {
    async fn recommend_workers(&self, _current_workers: usize) -> usize {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            100
        } else {
            0
        }
    }
}

fn elastic() -> PoolConfig {
    PoolConfig {
        min_workers: 1,
        max_workers: 3,
        resize_interval_ms: 60_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_resize_is_stepwise_and_idempotent() {
    let pool = WorkerPool::with_advisor(elastic(), Arc::new(FixedAdvisor(3))).unwrap();
    pool.start().await.unwrap();

    assert_eq!(pool.adjust_size().await, 2);
    assert_eq!(pool.adjust_size().await, 3);
    assert_eq!(pool.adjust_size().await, 3);
    assert_eq!(pool.metrics().await.state.current_size, 3);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_resize_stays_within_bounds_under_flapping_advice() {
    let advisor = Arc::new(AlternatingAdvisor {
        calls: AtomicUsize::new(0),
    });
    let pool = WorkerPool::with_advisor(elastic(), advisor).unwrap();
    pool.start().await.unwrap();

    for _ in 0..20 {
        let size = pool.adjust_size().await;
        assert!((1..=3).contains(&size), "size {} out of bounds", size);
        let state = pool.metrics().await.state;
        assert!(state.current_size >= state.min_workers);
        assert!(state.current_size <= state.max_workers);
    }

    // retired workers drain off and the pool keeps serving work
    let handle = pool
        .submit(work_fn(|_ctx| async { Ok(json!("still serving")) }), Priority::Normal, 0)
        .await
        .unwrap();
    assert_eq!(
        pool.wait(handle, Some(Duration::from_secs(5))).await.unwrap(),
        WorkStatus::Completed
    );
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shrink_never_goes_below_min() {
    let pool = WorkerPool::with_advisor(elastic(), Arc::new(FixedAdvisor(0))).unwrap();
    pool.start().await.unwrap();

    for _ in 0..5 {
        assert_eq!(pool.adjust_size().await, 1);
    }
    pool.shutdown(Duration::from_secs(1)).await;
}

#[test]
fn test_backoff_delays() {
    let policy = RetryPolicy::default()
        .with_base_delay(Duration::from_millis(100))
        .with_backoff_factor(2.0)
        .with_jitter(false);

    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for(3), Duration::from_millis(400));

    let jittered = policy.with_jitter(true);
    for _ in 0..50 {
        let delay = jittered.delay_for(2).as_millis();
        assert!((160..=240).contains(&delay), "delay {} outside ±20%", delay);
    }
}

#[test]
fn test_retry_policy_validation() {
    assert!(RetryPolicy::default().validate().is_ok());
    assert!(
        RetryPolicy::default()
            .with_backoff_factor(0.5)
            .validate()
            .is_err()
    );
    assert!(
        RetryPolicy::default()
            .retry_on(ErrorMatcher::kinds([" "]))
            .validate()
            .is_err()
    );
}

#[test]
fn test_should_retry_respects_budget_and_cancellation() {
    let policy = fast_retries(2);
    let error = TaskError::transient("flaky");

    assert!(policy.should_retry(&error, 0));
    assert!(policy.should_retry(&error, 1));
    assert!(!policy.should_retry(&error, 2));
    assert!(!policy.should_retry(&TaskError::cancelled(), 0));
}

#[test]
fn test_pool_config_validation() {
    assert!(PoolConfig::default().validate().is_ok());
    let inverted = PoolConfig {
        min_workers: 4,
        max_workers: 2,
        ..Default::default()
    };
    assert!(matches!(
        inverted.validate(),
        Err(PoolError::InvalidConfig(_))
    ));

    let keeps_nothing = PoolConfig {
        retain_finished: 0,
        ..Default::default()
    };
    assert!(matches!(
        keeps_nothing.validate(),
        Err(PoolError::InvalidConfig(_))
    ));
}

fn event_name(event: &PoolEvent) -> &'static str {
    match event {
        PoolEvent::AttemptStarted { .. } => "started",
        PoolEvent::AttemptFinished { .. } => "finished",
        PoolEvent::Retrying { .. } => "retrying",
        PoolEvent::Requeued { .. } => "requeued",
        PoolEvent::Finished { .. } => "done",
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_events_follow_state_order_across_threads() {
    let pool = WorkerPool::new(PoolConfig {
        min_workers: 8,
        max_workers: 8,
        resize_interval_ms: 60_000,
        ..Default::default()
    })
    .unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..200 {
        let calls = Arc::new(AtomicUsize::new(0));
        let work = work_fn(move |_ctx| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TaskError::transient("not yet"))
                } else {
                    Ok(json!(null))
                }
            }
        });
        let item = WorkItem::new(format!("flaky-{}", i), work)
            .with_retry_policy(fast_retries(2).with_base_delay(Duration::ZERO));
        handles.push(pool.submit_item(item).await.unwrap());
    }

    for handle in &handles {
        let status = pool
            .wait(*handle, Some(Duration::from_secs(20)))
            .await
            .unwrap();
        assert_eq!(status, WorkStatus::Completed);
    }

    let mut per_item: std::collections::HashMap<WorkId, Vec<&'static str>> =
        std::collections::HashMap::new();
    let mut done = 0;
    while done < handles.len() {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, PoolEvent::Finished { .. }) {
            done += 1;
        }
        per_item
            .entry(event.work_id())
            .or_default()
            .push(event_name(&event));
    }

    let expected = [
        "started", "finished", "retrying", "requeued", "started", "finished", "retrying",
        "requeued", "started", "finished", "done",
    ];
    assert_eq!(per_item.len(), handles.len());
    for handle in &handles {
        assert_eq!(per_item[&handle.id], expected);
    }
    pool.shutdown(Duration::from_millis(100)).await;
}
