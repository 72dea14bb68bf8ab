//! Synthetic crawl → extract → summarize pipeline used by `infomine demo`.

use crate::orchestrator::Orchestrator;
use crate::pool::{Priority, RetryPolicy, TaskError, work_fn};
use crate::task::{ExecutionReport, TaskDefinition, TaskId};
use anyhow::{Result, bail};
use rand::Rng;
use serde_json::json;
use std::time::Duration;
use tracing::info;

/// Breaker resource shared by every crawl task
pub const CRAWL_RESOURCE: &str = "demo-source";

/// Ids of the registered pipeline stages
#[derive(Debug, Clone)]
pub struct DemoPipeline {
    pub crawls: Vec<TaskId>,
    pub extract: TaskId,
    pub summarize: TaskId,
}

impl DemoPipeline {
    pub fn all(&self) -> Vec<TaskId> {
        let mut ids = self.crawls.clone();
        ids.push(self.extract);
        ids.push(self.summarize);
        ids
    }
}

fn crawl_task(index: usize, fail_rate: f64) -> TaskDefinition {
    TaskDefinition::new(
        format!("crawl-{}", index + 1),
        work_fn(move |ctx| async move {
            for _ in 0..5 {
                ctx.checkpoint()?;
                ctx.heartbeat();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if rand::rng().random_bool(fail_rate) {
                return Err(TaskError::transient(format!(
                    "source {} timed out",
                    index + 1
                )));
            }
            Ok(json!({ "source": index + 1, "documents": 10 + index * 3 }))
        }),
    )
    .with_type("crawl")
    .with_priority(Priority::High)
    .with_circuit_resource(CRAWL_RESOURCE)
    .with_retry_policy(
        RetryPolicy::default()
            .with_max_attempts(2)
            .with_base_delay(Duration::from_millis(50)),
    )
}

/// Register the pipeline stages on `orchestrator`
pub async fn register_pipeline(
    orchestrator: &Orchestrator,
    crawl_count: usize,
    fail_rate: f64,
) -> Result<DemoPipeline> {
    if crawl_count == 0 {
        bail!("the demo needs at least one crawl task");
    }
    if !(0.0..=1.0).contains(&fail_rate) {
        bail!("fail rate must be within [0, 1], got {}", fail_rate);
    }

    let mut crawls = Vec::with_capacity(crawl_count);
    for index in 0..crawl_count {
        crawls.push(orchestrator.register(crawl_task(index, fail_rate)).await?);
    }

    let extract = orchestrator
        .register(
            TaskDefinition::new(
                "extract",
                work_fn(|ctx| async move {
                    ctx.heartbeat();
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Ok(json!({ "entities": 42 }))
                }),
            )
            .with_type("extract")
            .with_dependencies(crawls.iter().copied()),
        )
        .await?;

    let summarize = orchestrator
        .register(
            TaskDefinition::new(
                "summarize",
                work_fn(|_ctx| async { Ok(json!({ "summary": "42 entities across sources" })) }),
            )
            .with_type("summarize")
            .with_priority(Priority::Low)
            .depends_on(extract),
        )
        .await?;

    info!(
        "Registered demo pipeline: {} crawl tasks, extract, summarize",
        crawl_count
    );
    Ok(DemoPipeline {
        crawls,
        extract,
        summarize,
    })
}

/// Register and run the pipeline, waiting until it settles
pub async fn run(
    orchestrator: &Orchestrator,
    crawl_count: usize,
    fail_rate: f64,
) -> Result<(DemoPipeline, ExecutionReport)> {
    let pipeline = register_pipeline(orchestrator, crawl_count, fail_rate).await?;
    let report = orchestrator.execute(&[pipeline.summarize], true).await?;
    Ok((pipeline, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{RawSample, ResourceSampler};
    use crate::orchestrator::OrchestratorConfig;
    use crate::task::{MemorySink, TaskStatus};
    use std::sync::Arc;

    struct IdleHost;

    impl ResourceSampler for IdleHost {
        fn sample(&mut self) -> anyhow::Result<RawSample> {
            Ok(RawSample {
                cpu_percent: 5.0,
                memory_percent: 20.0,
                disk_percent: None,
                network_bytes_sent: None,
                network_bytes_recv: None,
            })
        }
    }

    fn orchestrator() -> Orchestrator {
        let mut config = OrchestratorConfig::default();
        config.monitor.sampling_interval_ms = 50;
        config.tasks.scheduler_tick_ms = 50;
        config.tasks.idle_check_interval_ms = 50;
        Orchestrator::with_sink(config, Box::new(IdleHost), Arc::new(MemorySink::new())).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_bad_arguments() {
        let orchestrator = orchestrator();
        assert!(register_pipeline(&orchestrator, 0, 0.0).await.is_err());
        assert!(register_pipeline(&orchestrator, 2, 1.5).await.is_err());
    }

    #[tokio::test]
    async fn test_pipeline_settles_without_failures() {
        let orchestrator = orchestrator();
        orchestrator.start().await.unwrap();

        let (pipeline, report) = run(&orchestrator, 2, 0.0).await.unwrap();
        assert!(report.all_completed());
        assert_eq!(pipeline.all().len(), 4);
        assert_eq!(
            orchestrator.get_task(pipeline.summarize).await.unwrap().status,
            TaskStatus::Completed
        );

        orchestrator.shutdown().await;
    }
}
