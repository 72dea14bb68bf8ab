use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Monitored resource dimensions
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Disk,
        ResourceKind::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::Network => "network",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sampling tick. Never mutated after creation.
///
/// Disk and network readings are `None` when the platform could not provide
/// them; network rates are also `None` on the first tick, before there is a
/// previous counter to diff against.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: Option<f64>,
    /// Bytes per second
    pub network_sent_rate: Option<f64>,
    /// Bytes per second
    pub network_recv_rate: Option<f64>,
}

impl ResourceSnapshot {
    /// Combined network throughput as a share of `capacity` bytes/sec
    pub fn network_percent(&self, capacity_bytes_per_sec: Option<f64>) -> Option<f64> {
        let capacity = capacity_bytes_per_sec.filter(|c| *c > 0.0)?;
        let sent = self.network_sent_rate?;
        let recv = self.network_recv_rate?;
        Some(((sent + recv) / capacity * 100.0).min(100.0))
    }

    /// Reading for `kind` as a percentage, if known
    pub fn percent(&self, kind: ResourceKind, network_capacity: Option<f64>) -> Option<f64> {
        match kind {
            ResourceKind::Cpu => Some(self.cpu_percent),
            ResourceKind::Memory => Some(self.memory_percent),
            ResourceKind::Disk => self.disk_percent,
            ResourceKind::Network => self.network_percent(network_capacity),
        }
    }
}

/// Raw readings produced by a [`super::ResourceSampler`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: Option<f64>,
    /// Cumulative bytes sent across all interfaces
    pub network_bytes_sent: Option<u64>,
    /// Cumulative bytes received across all interfaces
    pub network_bytes_recv: Option<u64>,
}

/// Per-resource thresholds in percent; each must satisfy 0 < t <= 100
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ResourceThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub network_percent: f64,
}

impl ResourceThresholds {
    pub fn get(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu_percent,
            ResourceKind::Memory => self.memory_percent,
            ResourceKind::Disk => self.disk_percent,
            ResourceKind::Network => self.network_percent,
        }
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        for kind in ResourceKind::ALL {
            let value = self.get(kind);
            if !(value > 0.0 && value <= 100.0) {
                return Err(MonitorError::InvalidThreshold { kind, value });
            }
        }
        Ok(())
    }
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 80.0,
            disk_percent: 90.0,
            network_percent: 80.0,
        }
    }
}

/// A sample that crossed a configured threshold
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct ThresholdBreach {
    pub kind: ResourceKind,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub sampling_interval_ms: u64,
    pub history_size: usize,
    pub thresholds: ResourceThresholds,
    /// Fraction of a threshold every resource must stay under before growth is advised
    pub grow_ratio: f64,
    /// Link capacity used to express network throughput as a percentage
    pub network_capacity_bytes_per_sec: Option<f64>,
}

impl MonitorConfig {
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        self.thresholds.validate()?;
        if self.sampling_interval_ms == 0 {
            return Err(MonitorError::InvalidConfig(
                "sampling_interval_ms must be positive".to_string(),
            ));
        }
        if self.history_size == 0 {
            return Err(MonitorError::InvalidConfig(
                "history_size must be positive".to_string(),
            ));
        }
        if !(self.grow_ratio > 0.0 && self.grow_ratio < 1.0) {
            return Err(MonitorError::InvalidConfig(format!(
                "grow_ratio must be within (0, 1), got {}",
                self.grow_ratio
            )));
        }
        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 1_000,
            history_size: 120,
            thresholds: ResourceThresholds::default(),
            grow_ratio: 0.7,
            network_capacity_bytes_per_sec: None,
        }
    }
}

/// Observer invoked synchronously with (resource, current value, threshold)
pub type ThresholdCallback =
    Box<dyn Fn(ResourceKind, f64, f64) -> anyhow::Result<()> + Send + Sync>;

/// Source of concurrency recommendations consumed by the worker pool
#[async_trait::async_trait]
pub trait ConcurrencyAdvisor: Send + Sync {
    async fn recommend_workers(&self, current_workers: usize) -> usize;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MonitorError {
    #[error("resource monitor has not produced a sample yet")]
    NotStarted,
    #[error("resource sampling failed: {0}")]
    Sampling(String),
    #[error("threshold for {kind} must satisfy 0 < t <= 100, got {value}")]
    InvalidThreshold { kind: ResourceKind, value: f64 },
    #[error("invalid monitor configuration: {0}")]
    InvalidConfig(String),
}
