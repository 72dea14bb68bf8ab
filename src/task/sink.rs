//! Destinations for execution records and shutdown events.

use crate::env;
use crate::task::types::{Execution, ShutdownEvent, TaskManagerError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Receives every finished execution attempt and every shutdown event.
///
/// Failures are logged by the caller and never interrupt task processing.
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn record_execution(&self, execution: &Execution) -> Result<()>;
    async fn record_event(&self, event: &ShutdownEvent) -> Result<()>;
}

/// Writes records to the tracing log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait]
impl ExecutionSink for LoggingSink {
    async fn record_execution(&self, execution: &Execution) -> Result<()> {
        debug!(
            "Execution {} of {} attempt {}: {:?}",
            execution.execution_id,
            execution.task_name,
            execution.attempt_number,
            execution.status
        );
        Ok(())
    }

    async fn record_event(&self, event: &ShutdownEvent) -> Result<()> {
        info!("[{}] {}", event.event_type.as_str(), event.message);
        Ok(())
    }
}

/// Keeps everything in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    executions: Mutex<Vec<Execution>>,
    events: Mutex<Vec<ShutdownEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn executions(&self) -> Vec<Execution> {
        self.executions.lock().await.clone()
    }

    pub async fn events(&self) -> Vec<ShutdownEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl ExecutionSink for MemorySink {
    async fn record_execution(&self, execution: &Execution) -> Result<()> {
        self.executions.lock().await.push(execution.clone());
        Ok(())
    }

    async fn record_event(&self, event: &ShutdownEvent) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Appends JSON lines to `executions.jsonl` and `shutdown_events.jsonl`
#[derive(Debug)]
pub struct JsonlSink {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    /// Open (creating if needed) the data directory
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, TaskManagerError> {
        let data_dir = data_dir.into();
        async_fs::create_dir_all(&data_dir).await.map_err(|e| {
            TaskManagerError::Persistence(format!(
                "failed to create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;
        info!("Persisting executions under {}", data_dir.display());
        Ok(Self {
            data_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub async fn load_executions(&self) -> Result<Vec<Execution>> {
        read_lines(&env::executions_file_path(&self.data_dir)).await
    }

    pub async fn load_events(&self) -> Result<Vec<ShutdownEvent>> {
        read_lines(&env::events_file_path(&self.data_dir)).await
    }

    async fn append<T: Serialize>(&self, path: &Path, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("Failed to serialize record")?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = async_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        file.flush().await.context("Failed to flush record")?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionSink for JsonlSink {
    async fn record_execution(&self, execution: &Execution) -> Result<()> {
        self.append(&env::executions_file_path(&self.data_dir), execution)
            .await
    }

    async fn record_event(&self, event: &ShutdownEvent) -> Result<()> {
        self.append(&env::events_file_path(&self.data_dir), event)
            .await
    }
}

async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = async_fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut records = Vec::new();
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                "Skipping malformed line {} in {}: {}",
                number + 1,
                path.display(),
                e
            ),
        }
    }
    Ok(records)
}
