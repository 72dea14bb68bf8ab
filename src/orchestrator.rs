//! # Orchestrator
//!
//! Wires one resource monitor, one worker pool, one circuit breaker and one
//! task manager together and drives their lifecycle as a unit.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 Orchestrator                  │
//! │  ┌──────────┐  advice   ┌──────────┐          │
//! │  │ Resource │ ────────▶ │  Worker  │          │
//! │  │ Monitor  │           │   Pool   │          │
//! │  └──────────┘           └──────────┘          │
//! │                              ▲ submits        │
//! │  ┌──────────┐  wraps    ┌──────────┐          │
//! │  │ Circuit  │ ────────▶ │   Task   │          │
//! │  │ Breaker  │           │ Manager  │          │
//! │  └──────────┘           └──────────┘          │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use infomine::orchestrator::{Orchestrator, OrchestratorConfig};
//! use infomine::pool::work_fn;
//! use infomine::task::TaskDefinition;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::new(OrchestratorConfig::default()).await?;
//!     orchestrator.start().await?;
//!
//!     let fetch = orchestrator
//!         .register(TaskDefinition::new(
//!             "fetch",
//!             work_fn(|_ctx| async { Ok(serde_json::json!({ "pages": 3 })) }),
//!         ))
//!         .await?;
//!     let report = orchestrator.execute(&[fetch], true).await?;
//!     println!("all completed: {}", report.all_completed());
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitState};
use crate::monitor::{
    ConcurrencyAdvisor, MonitorConfig, MonitorError, ResourceMonitor, ResourceSampler,
    ResourceSnapshot, SystemSampler,
};
use crate::pool::{PoolConfig, PoolMetrics, WorkerPool};
use crate::task::{
    Execution, ExecutionReport, ExecutionSink, JsonlSink, LoggingSink, ShutdownEvent, Task,
    TaskDefinition, TaskId, TaskManager, TaskManagerConfig, TaskManagerError, TaskStatus,
};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Configuration for every component, loadable from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Directory for the JSON lines execution and event logs; logs only when unset
    pub data_dir: Option<PathBuf>,
    pub monitor: MonitorConfig,
    pub pool: PoolConfig,
    pub tasks: TaskManagerConfig,
    pub breaker: CircuitBreakerConfig,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml_string()?)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    pub fn validate(&self) -> Result<()> {
        self.monitor.validate().context("Invalid monitor configuration")?;
        self.pool.validate().context("Invalid pool configuration")?;
        self.tasks
            .validate()
            .map_err(|e| anyhow!("Invalid task manager configuration: {}", e))?;
        self.breaker
            .validate()
            .map_err(|e| anyhow!("Invalid circuit breaker configuration: {}", e))?;
        Ok(())
    }
}

/// Point-in-time view of the whole system
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub pool: PoolMetrics,
    /// Latest resource sample, if the monitor has produced one
    pub resources: Option<ResourceSnapshot>,
    pub breakers: HashMap<String, CircuitBreakerState>,
    pub task_counts: HashMap<TaskStatus, usize>,
    pub stalled_tasks: usize,
    pub is_healthy: bool,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    monitor: Arc<ResourceMonitor>,
    pool: Arc<WorkerPool>,
    breaker: Arc<CircuitBreaker>,
    manager: Arc<TaskManager>,
}

impl Orchestrator {
    /// Build over the host sampler, persisting to `data_dir` when configured
    pub async fn new(config: OrchestratorConfig) -> Result<Self> {
        Self::with_sampler(config, Box::new(SystemSampler::new())).await
    }

    /// Build with a custom resource sampler
    pub async fn with_sampler(
        config: OrchestratorConfig,
        sampler: Box<dyn ResourceSampler>,
    ) -> Result<Self> {
        let sink: Arc<dyn ExecutionSink> = match &config.data_dir {
            Some(dir) => Arc::new(
                JsonlSink::open(dir)
                    .await
                    .context("Failed to open execution log")?,
            ),
            None => Arc::new(LoggingSink),
        };
        Self::with_sink(config, sampler, sink)
    }

    /// Build with a custom sampler and execution sink
    pub fn with_sink(
        config: OrchestratorConfig,
        sampler: Box<dyn ResourceSampler>,
        sink: Arc<dyn ExecutionSink>,
    ) -> Result<Self> {
        config.validate()?;

        let monitor = Arc::new(
            ResourceMonitor::with_sampler(config.monitor.clone(), sampler)
                .context("Failed to create resource monitor")?
                .with_worker_bounds(config.pool.min_workers, config.pool.max_workers),
        );
        let advisor: Arc<dyn ConcurrencyAdvisor> = monitor.clone();
        let pool = Arc::new(
            WorkerPool::with_advisor(config.pool.clone(), advisor)
                .context("Failed to create worker pool")?,
        );
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let manager = Arc::new(
            TaskManager::new(
                config.tasks.clone(),
                pool.clone(),
                breaker.clone(),
                sink,
                Some(monitor.clone()),
            )
            .context("Failed to create task manager")?,
        );

        Ok(Self {
            config,
            monitor,
            pool,
            breaker,
            manager,
        })
    }

    /// Start the monitor, then the pool, then the task manager loops
    pub async fn start(&self) -> Result<()> {
        info!("Starting orchestrator...");
        self.monitor.start().await;
        self.pool
            .start()
            .await
            .context("Failed to start worker pool")?;
        self.manager.start().await;
        info!("Orchestrator started");
        Ok(())
    }

    /// Stop the task manager (which drains the pool within the grace period),
    /// then the monitor
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator...");
        self.manager.shutdown().await;
        self.monitor.stop().await;
        info!("Orchestrator shutdown complete");
    }

    pub async fn status(&self) -> SystemStatus {
        let pool = self.pool.metrics().await;
        let resources = self.monitor.current_usage().await.ok();
        let breakers = self.breaker.snapshot();
        let task_counts = self.manager.status_counts().await;
        let stalled_tasks = self
            .manager
            .tasks()
            .await
            .iter()
            .filter(|task| task.is_stalled)
            .count();

        let is_healthy = pool.running
            && stalled_tasks == 0
            && breakers
                .values()
                .all(|state| state.state != CircuitState::Open);

        SystemStatus {
            pool,
            resources,
            breakers,
            task_counts,
            stalled_tasks,
            is_healthy,
        }
    }

    pub async fn register(&self, definition: TaskDefinition) -> Result<TaskId, TaskManagerError> {
        self.manager.register(definition).await
    }

    pub async fn execute(
        &self,
        task_ids: &[TaskId],
        wait: bool,
    ) -> Result<ExecutionReport, TaskManagerError> {
        self.manager.execute(task_ids, wait).await
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<bool, TaskManagerError> {
        self.manager.cancel(task_id).await
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, TaskManagerError> {
        self.manager.get_task(task_id).await
    }

    pub async fn history(
        &self,
        task_id: TaskId,
        limit: usize,
    ) -> Result<Vec<Execution>, TaskManagerError> {
        self.manager.history(task_id, limit).await
    }

    pub async fn recent_history(&self, limit: usize) -> Vec<Execution> {
        self.manager.recent_history(limit).await
    }

    pub async fn shutdown_events(&self) -> Vec<ShutdownEvent> {
        self.manager.shutdown_events().await
    }

    pub async fn metrics(&self) -> PoolMetrics {
        self.pool.metrics().await
    }

    pub async fn current_usage(&self) -> Result<ResourceSnapshot, MonitorError> {
        self.monitor.current_usage().await
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.manager.shutdown_signal()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn task_manager(&self) -> Arc<TaskManager> {
        self.manager.clone()
    }

    pub fn monitor(&self) -> Arc<ResourceMonitor> {
        self.monitor.clone()
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }
}
