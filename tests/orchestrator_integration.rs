//! End-to-end tests driving the public orchestrator API.

use infomine::circuit_breaker::CircuitState;
use infomine::monitor::{RawSample, ResourceSampler};
use infomine::orchestrator::{Orchestrator, OrchestratorConfig};
use infomine::pool::{Priority, RetryPolicy, TaskError, error_kind, work_fn};
use infomine::task::{
    ExecutionStatus, JsonlSink, MemorySink, ShutdownEventType, TaskDefinition, TaskStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use test_tag::tag;

/// Reports the same quiet host on every tick
struct QuietHost;

impl ResourceSampler for QuietHost {
    fn sample(&mut self) -> anyhow::Result<RawSample> {
        Ok(RawSample {
            cpu_percent: 12.0,
            memory_percent: 30.0,
            disk_percent: Some(40.0),
            network_bytes_sent: Some(1_000),
            network_bytes_recv: Some(2_000),
        })
    }
}

fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.monitor.sampling_interval_ms = 50;
    config.pool.min_workers = 2;
    config.pool.max_workers = 4;
    config.pool.resize_interval_ms = 100;
    config.tasks.scheduler_tick_ms = 50;
    config.tasks.idle_check_interval_ms = 50;
    config.tasks.shutdown_grace_period_ms = 500;
    config
}

#[tokio::test]
async fn test_pipeline_runs_and_persists_history() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("data");
    let mut config = test_config();
    config.data_dir = Some(data_dir.clone());

    let orchestrator = Orchestrator::with_sampler(config, Box::new(QuietHost))
        .await
        .unwrap();
    orchestrator.start().await.unwrap();

    let crawl = orchestrator
        .register(
            TaskDefinition::new(
                "crawl",
                work_fn(|ctx| async move {
                    ctx.heartbeat();
                    Ok(json!({ "documents": 3 }))
                }),
            )
            .with_type("crawl")
            .with_priority(Priority::High),
        )
        .await
        .unwrap();
    let extract = orchestrator
        .register(
            TaskDefinition::new("extract", work_fn(|_ctx| async { Ok(json!({ "entities": 7 })) }))
                .depends_on(crawl),
        )
        .await
        .unwrap();

    let report = orchestrator.execute(&[extract], true).await.unwrap();
    assert!(report.all_completed());
    assert_eq!(
        orchestrator.get_task(extract).await.unwrap().result,
        Some(json!({ "entities": 7 }))
    );

    let usage = orchestrator.current_usage().await.unwrap();
    assert_eq!(usage.cpu_percent, 12.0);
    let status = orchestrator.status().await;
    assert!(status.is_healthy);
    assert_eq!(status.task_counts.get(&TaskStatus::Completed), Some(&2));
    assert_eq!(status.pool.counters.completed, 2);

    orchestrator.shutdown().await;

    let persisted = JsonlSink::open(&data_dir)
        .await
        .unwrap()
        .load_executions()
        .await
        .unwrap();
    assert_eq!(persisted.len(), 2);
    assert!(persisted
        .iter()
        .all(|e| e.status == ExecutionStatus::Completed));
    assert_eq!(persisted[0].task_id, crawl);
    assert_eq!(persisted[1].task_id, extract);

    let events = JsonlSink::open(&data_dir)
        .await
        .unwrap()
        .load_events()
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == ShutdownEventType::ManagerShutdown));
}

#[tokio::test]
async fn test_retry_breaker_and_blocked_dependents() {
    let mut config = test_config();
    config.breaker.failure_threshold = 2;
    config.breaker.recovery_timeout_ms = 60_000;
    let sink = Arc::new(MemorySink::new());
    let orchestrator =
        Orchestrator::with_sink(config, Box::new(QuietHost), sink.clone()).unwrap();
    orchestrator.start().await.unwrap();

    let fetch = orchestrator
        .register(
            TaskDefinition::new(
                "fetch",
                work_fn(|_ctx| async { Err(TaskError::timeout("origin did not answer")) }),
            )
            .with_circuit_resource("origin")
            .with_retry_policy(
                RetryPolicy::none()
                    .with_max_attempts(3)
                    .with_base_delay(Duration::from_millis(5))
                    .with_jitter(false),
            ),
        )
        .await
        .unwrap();
    let parse = orchestrator
        .register(
            TaskDefinition::new("parse", work_fn(|_ctx| async { Ok(json!(null)) }))
                .depends_on(fetch),
        )
        .await
        .unwrap();

    let report = orchestrator.execute(&[parse], true).await.unwrap();
    assert_eq!(report.blocked, vec![parse]);

    let fetch_task = orchestrator.get_task(fetch).await.unwrap();
    assert_eq!(fetch_task.status, TaskStatus::Failed);
    assert_eq!(fetch_task.attempts, 4);
    // two real timeouts open the breaker, the remaining attempts short-circuit
    assert_eq!(
        fetch_task.error.unwrap().kind,
        error_kind::CIRCUIT_OPEN
    );
    assert_eq!(orchestrator.breaker().state("origin"), CircuitState::Open);

    let history = orchestrator.history(fetch, 10).await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].attempt_number, 4);
    assert_eq!(sink.executions().await.len(), 4);

    let status = orchestrator.status().await;
    assert!(!status.is_healthy);
    assert_eq!(status.breakers["origin"].state, CircuitState::Open);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cancel_through_orchestrator() {
    let orchestrator = Orchestrator::with_sink(
        test_config(),
        Box::new(QuietHost),
        Arc::new(MemorySink::new()),
    )
    .unwrap();
    orchestrator.start().await.unwrap();

    let long_running = orchestrator
        .register(TaskDefinition::new(
            "long-running",
            work_fn(|ctx| async move {
                loop {
                    ctx.checkpoint()?;
                    ctx.heartbeat();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }),
        ))
        .await
        .unwrap();

    orchestrator.execute(&[long_running], false).await.unwrap();
    for _ in 0..200 {
        if orchestrator.get_task(long_running).await.unwrap().status == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(orchestrator.cancel(long_running).await.unwrap());
    for _ in 0..200 {
        if orchestrator.get_task(long_running).await.unwrap().status == TaskStatus::Cancelled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let task = orchestrator.get_task(long_running).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.result.is_none());
    assert!(task.error.is_none());

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.metrics().await.counters.cancelled, 1);
}

#[tokio::test]
#[tag(system)]
async fn test_host_sampling_through_orchestrator() {
    let orchestrator = Orchestrator::new(test_config()).await.unwrap();
    orchestrator.start().await.unwrap();

    let mut usage = orchestrator.current_usage().await;
    for _ in 0..100 {
        if usage.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        usage = orchestrator.current_usage().await;
    }
    let snapshot = usage.unwrap();
    assert!((0.0..=100.0).contains(&snapshot.memory_percent));
    assert!(snapshot.cpu_percent >= 0.0);

    orchestrator.shutdown().await;
}
