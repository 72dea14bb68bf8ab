use crate::monitor::sampler::{ResourceSampler, SystemSampler, detect_cpus};
use crate::monitor::types::*;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Periodically samples host resources, keeps a bounded history and advises
/// the worker pool on concurrency.
pub struct ResourceMonitor {
    shared: Arc<MonitorShared>,
    sampling: Mutex<Option<SamplingLoop>>,
}

struct MonitorShared {
    config: MonitorConfig,
    min_workers: usize,
    max_workers: usize,
    sampler: Mutex<Box<dyn ResourceSampler>>,
    state: RwLock<MonitorState>,
    callbacks: RwLock<Vec<ThresholdCallback>>,
}

#[derive(Default)]
struct MonitorState {
    history: VecDeque<ResourceSnapshot>,
    last_network: Option<NetworkCounters>,
    breach_count: u64,
}

#[derive(Clone, Copy)]
struct NetworkCounters {
    at: DateTime<Utc>,
    sent: u64,
    recv: u64,
}

struct SamplingLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ResourceMonitor {
    /// Create a monitor over the host operating system
    pub fn new(config: MonitorConfig) -> Result<Self, MonitorError> {
        Self::with_sampler(config, Box::new(SystemSampler::new()))
    }

    /// Create a monitor with a custom sampler
    pub fn with_sampler(
        config: MonitorConfig,
        sampler: Box<dyn ResourceSampler>,
    ) -> Result<Self, MonitorError> {
        config.validate()?;
        let max_workers = detect_cpus() * 2;

        Ok(Self {
            shared: Arc::new(MonitorShared {
                config,
                min_workers: 1,
                max_workers,
                sampler: Mutex::new(sampler),
                state: RwLock::new(MonitorState::default()),
                callbacks: RwLock::new(Vec::new()),
            }),
            sampling: Mutex::new(None),
        })
    }

    /// Bound the concurrency recommendations to `[min_workers, max_workers]`.
    ///
    /// Must be called before the monitor is shared.
    pub fn with_worker_bounds(mut self, min_workers: usize, max_workers: usize) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.min_workers = min_workers.max(1);
            shared.max_workers = max_workers.max(shared.min_workers);
        } else {
            warn!("Worker bounds ignored: monitor already shared");
        }
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.shared.config
    }

    /// Begin periodic sampling. The first sample is taken immediately.
    pub async fn start(&self) {
        let mut sampling = self.sampling.lock().await;
        if sampling.is_some() {
            debug!("Resource monitor already running");
            return;
        }

        let cancel = CancellationToken::new();
        let shared = self.shared.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(shared.config.sampling_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = shared.take_sample().await {
                            error!("Resource sampling tick failed: {}", e);
                        }
                    }
                }
            }
            debug!("Resource sampling loop exited");
        });

        *sampling = Some(SamplingLoop { cancel, handle });
        info!(
            "Resource monitor started (interval {:?})",
            self.shared.config.sampling_interval()
        );
    }

    /// Stop sampling and wait for the sampling task to exit
    pub async fn stop(&self) {
        let sampling = self.sampling.lock().await.take();
        if let Some(SamplingLoop { cancel, handle }) = sampling {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!("Resource sampling task ended abnormally: {}", e);
            }
            info!("Resource monitor stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.sampling.lock().await.is_some()
    }

    /// Take one sample now, outside the periodic schedule
    pub async fn sample_now(&self) -> Result<ResourceSnapshot, MonitorError> {
        self.shared.take_sample().await
    }

    /// Latest snapshot; fails with `NotStarted` if nothing has been sampled
    pub async fn current_usage(&self) -> Result<ResourceSnapshot, MonitorError> {
        let state = self.shared.state.read().await;
        state.history.back().cloned().ok_or(MonitorError::NotStarted)
    }

    /// The most recent `limit` snapshots, oldest first
    pub async fn history(&self, limit: usize) -> Vec<ResourceSnapshot> {
        let state = self.shared.state.read().await;
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Number of threshold breaches observed since creation
    pub async fn breach_count(&self) -> u64 {
        self.shared.state.read().await.breach_count
    }

    /// Add an observer for threshold breaches.
    ///
    /// Observers run synchronously on the sampling task; errors and panics are
    /// logged and swallowed.
    pub async fn register_callback(&self, callback: ThresholdCallback) {
        self.shared.callbacks.write().await.push(callback);
    }

    /// Breaches in the latest snapshot
    pub async fn current_breaches(&self) -> Vec<ThresholdBreach> {
        match self.current_usage().await {
            Ok(snapshot) => self.shared.breaches(&snapshot),
            Err(_) => Vec::new(),
        }
    }

    /// Recommended worker count given `current_workers`.
    ///
    /// Shrinks by one when any known resource is above its threshold, grows by
    /// one when every known resource is below `grow_ratio` of its threshold,
    /// and holds otherwise.
    pub async fn optimal_concurrency(&self, current_workers: usize) -> usize {
        let latest = self.shared.state.read().await.history.back().cloned();
        let Some(snapshot) = latest else {
            return current_workers;
        };
        self.shared.recommend(&snapshot, current_workers)
    }
}

#[async_trait::async_trait]
impl ConcurrencyAdvisor for ResourceMonitor {
    async fn recommend_workers(&self, current_workers: usize) -> usize {
        self.optimal_concurrency(current_workers).await
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        if let Ok(mut sampling) = self.sampling.try_lock()
            && let Some(SamplingLoop { cancel, .. }) = sampling.take()
        {
            cancel.cancel();
        }
    }
}

impl MonitorShared {
    async fn take_sample(&self) -> Result<ResourceSnapshot, MonitorError> {
        let raw = {
            let mut sampler = self.sampler.lock().await;
            sampler
                .sample()
                .map_err(|e| MonitorError::Sampling(e.to_string()))?
        };
        let now = Utc::now();

        let snapshot = {
            let mut state = self.state.write().await;

            let (sent_rate, recv_rate) = match (raw.network_bytes_sent, raw.network_bytes_recv) {
                (Some(sent), Some(recv)) => {
                    let rates = state.last_network.and_then(|previous| {
                        let elapsed =
                            now.signed_duration_since(previous.at).num_milliseconds() as f64 / 1000.0;
                        (elapsed > 0.0).then(|| {
                            (
                                sent.saturating_sub(previous.sent) as f64 / elapsed,
                                recv.saturating_sub(previous.recv) as f64 / elapsed,
                            )
                        })
                    });
                    state.last_network = Some(NetworkCounters { at: now, sent, recv });
                    (rates.map(|r| r.0), rates.map(|r| r.1))
                }
                _ => {
                    state.last_network = None;
                    (None, None)
                }
            };

            let snapshot = ResourceSnapshot {
                timestamp: now,
                cpu_percent: raw.cpu_percent,
                memory_percent: raw.memory_percent,
                disk_percent: raw.disk_percent,
                network_sent_rate: sent_rate,
                network_recv_rate: recv_rate,
            };

            state.history.push_back(snapshot.clone());
            while state.history.len() > self.config.history_size {
                state.history.pop_front();
            }
            snapshot
        };

        let breaches = self.breaches(&snapshot);
        if !breaches.is_empty() {
            self.state.write().await.breach_count += breaches.len() as u64;
            self.notify(&breaches).await;
        }

        Ok(snapshot)
    }

    fn breaches(&self, snapshot: &ResourceSnapshot) -> Vec<ThresholdBreach> {
        ResourceKind::ALL
            .iter()
            .filter_map(|&kind| {
                let value = snapshot.percent(kind, self.config.network_capacity_bytes_per_sec)?;
                let threshold = self.config.thresholds.get(kind);
                (value > threshold).then_some(ThresholdBreach {
                    kind,
                    value,
                    threshold,
                })
            })
            .collect()
    }

    async fn notify(&self, breaches: &[ThresholdBreach]) {
        let callbacks = self.callbacks.read().await;
        for breach in breaches {
            warn!(
                "{} usage {:.1}% above threshold {:.1}%",
                breach.kind, breach.value, breach.threshold
            );
            for callback in callbacks.iter() {
                match catch_unwind(AssertUnwindSafe(|| {
                    callback(breach.kind, breach.value, breach.threshold)
                })) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Threshold callback failed: {}", e),
                    Err(_) => error!("Threshold callback panicked"),
                }
            }
        }
    }

    fn recommend(&self, snapshot: &ResourceSnapshot, current: usize) -> usize {
        let capacity = self.config.network_capacity_bytes_per_sec;
        let readings: Vec<(f64, f64)> = ResourceKind::ALL
            .iter()
            .filter_map(|&kind| {
                snapshot
                    .percent(kind, capacity)
                    .map(|value| (value, self.config.thresholds.get(kind)))
            })
            .collect();

        let over = readings.iter().any(|(value, threshold)| value > threshold);
        let comfortably_under = readings
            .iter()
            .all(|(value, threshold)| *value < threshold * self.config.grow_ratio);

        let recommended = if over {
            current.saturating_sub(1).max(self.min_workers)
        } else if comfortably_under && current < self.max_workers {
            current + 1
        } else {
            current
        };

        if recommended != current {
            debug!(
                "Concurrency recommendation {} -> {} (cpu {:.1}%, memory {:.1}%)",
                current, recommended, snapshot.cpu_percent, snapshot.memory_percent
            );
        }
        recommended
    }
}
