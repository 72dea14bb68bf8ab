//! # Infomine
//!
//! Execution core for crawl and extraction pipelines: a resource-adaptive
//! worker pool, a dependency-aware task manager with retries and schedules,
//! per-resource circuit breakers and stalled/idle work detection.
//!
//! ## Architecture Overview
//!
//! - **[`monitor`]**: Samples CPU, memory, disk and network usage and turns it
//!   into worker-count advice
//! - **[`pool`]**: Priority queue of work items served by a dynamically sized
//!   set of tokio workers, with retries and cooperative cancellation
//! - **[`circuit_breaker`]**: Per-resource CLOSED/OPEN/HALF_OPEN breaker
//!   wrapped around task callables
//! - **[`task`]**: Task registration, dependency ordering, execution history,
//!   schedules and idle detection
//! - **[`orchestrator`]**: Composition root driving all of the above
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use infomine::{Orchestrator, OrchestratorConfig, TaskDefinition};
//! use infomine::pool::work_fn;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::new(OrchestratorConfig::default()).await?;
//!     orchestrator.start().await?;
//!
//!     let crawl = orchestrator
//!         .register(TaskDefinition::new(
//!             "crawl",
//!             work_fn(|_ctx| async { Ok(serde_json::json!({ "documents": 12 })) }),
//!         ))
//!         .await?;
//!     let extract = orchestrator
//!         .register(
//!             TaskDefinition::new(
//!                 "extract",
//!                 work_fn(|_ctx| async { Ok(serde_json::json!({ "entities": 40 })) }),
//!             )
//!             .depends_on(crawl),
//!         )
//!         .await?;
//!
//!     let report = orchestrator.execute(&[extract], true).await?;
//!     assert!(report.all_completed());
//!
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Host resource sampling and concurrency advice.
pub mod monitor;

/// Priority worker pool with retries, backoff and cooperative cancellation.
pub mod pool;

/// Per-resource circuit breaker.
pub mod circuit_breaker;

/// Task registration, dependency-ordered execution, scheduling and idle detection.
pub mod task;

/// Composition root wiring every component together.
pub mod orchestrator;

/// Environment constants and path utilities.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use monitor::{MonitorConfig, ResourceMonitor, ResourceSnapshot, ResourceThresholds};
pub use orchestrator::{Orchestrator, OrchestratorConfig, SystemStatus};
pub use pool::{PoolConfig, Priority, RetryPolicy, TaskContext, TaskError, WorkerPool};
pub use task::{
    Schedule, Task, TaskDefinition, TaskId, TaskManager, TaskManagerConfig, TaskStatus,
};
