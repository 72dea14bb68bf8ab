use super::*;
use anyhow::anyhow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

/// Replays a fixed list of samples, repeating the last one forever
struct ScriptedSampler {
    samples: VecDeque<RawSample>,
    last: RawSample,
}

impl ScriptedSampler {
    fn new(samples: Vec<RawSample>) -> Box<Self> {
        Box::new(Self {
            samples: samples.into(),
            last: RawSample::default(),
        })
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&mut self) -> anyhow::Result<RawSample> {
        if let Some(next) = self.samples.pop_front() {
            self.last = next;
        }
        Ok(self.last.clone())
    }
}

struct BrokenSampler;

impl ResourceSampler for BrokenSampler {
    fn sample(&mut self) -> anyhow::Result<RawSample> {
        Err(anyhow!("sensor unavailable"))
    }
}

fn load(cpu: f64, memory: f64) -> RawSample {
    RawSample {
        cpu_percent: cpu,
        memory_percent: memory,
        disk_percent: None,
        network_bytes_sent: None,
        network_bytes_recv: None,
    }
}

fn monitor_with(samples: Vec<RawSample>) -> ResourceMonitor {
    let config = MonitorConfig {
        sampling_interval_ms: 20,
        history_size: 3,
        ..Default::default()
    };
    ResourceMonitor::with_sampler(config, ScriptedSampler::new(samples))
        .unwrap()
        .with_worker_bounds(1, 4)
}

#[tokio::test]
async fn test_current_usage_before_sampling() {
    let monitor = monitor_with(vec![load(10.0, 10.0)]);

    assert_eq!(monitor.current_usage().await, Err(MonitorError::NotStarted));
    assert!(monitor.history(10).await.is_empty());
    assert!(monitor.current_breaches().await.is_empty());
}

#[tokio::test]
async fn test_history_is_bounded_and_oldest_first() {
    let samples = (1..=5).map(|i| load(i as f64, 1.0)).collect();
    let monitor = monitor_with(samples);

    for _ in 0..5 {
        monitor.sample_now().await.unwrap();
    }

    let history = monitor.history(10).await;
    let cpu: Vec<f64> = history.iter().map(|s| s.cpu_percent).collect();
    assert_eq!(cpu, vec![3.0, 4.0, 5.0]);

    let latest_two = monitor.history(2).await;
    assert_eq!(latest_two.len(), 2);
    assert_eq!(latest_two[1].cpu_percent, 5.0);

    let current = monitor.current_usage().await.unwrap();
    assert_eq!(current.cpu_percent, 5.0);
}

#[tokio::test]
async fn test_network_rates_need_two_samples() {
    let mut first = load(10.0, 10.0);
    first.network_bytes_sent = Some(1_000);
    first.network_bytes_recv = Some(2_000);
    let mut second = first.clone();
    second.network_bytes_sent = Some(101_000);
    second.network_bytes_recv = Some(2_000);

    let monitor = monitor_with(vec![first, second]);

    let snapshot = monitor.sample_now().await.unwrap();
    assert_eq!(snapshot.network_sent_rate, None);
    assert_eq!(snapshot.network_recv_rate, None);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let snapshot = monitor.sample_now().await.unwrap();
    let sent_rate = snapshot.network_sent_rate.unwrap();
    assert!(sent_rate > 0.0);
    assert_eq!(snapshot.network_recv_rate, Some(0.0));
}

#[tokio::test]
async fn test_threshold_callbacks_receive_breaches() {
    let monitor = monitor_with(vec![load(95.0, 20.0)]);
    let seen = Arc::new(StdMutex::new(Vec::new()));

    let sink = seen.clone();
    monitor
        .register_callback(Box::new(move |kind, value, threshold| {
            sink.lock().unwrap().push((kind, value, threshold));
            Ok(())
        }))
        .await;

    monitor.sample_now().await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![(ResourceKind::Cpu, 95.0, 80.0)]);
    assert_eq!(monitor.breach_count().await, 1);
}

#[tokio::test]
async fn test_misbehaving_callbacks_are_contained() {
    let monitor = monitor_with(vec![load(95.0, 95.0)]);
    let calls = Arc::new(AtomicUsize::new(0));

    monitor
        .register_callback(Box::new(|_, _, _| Err(anyhow!("observer failed"))))
        .await;
    monitor
        .register_callback(Box::new(|_, _, _| -> anyhow::Result<()> {
            panic!("observer panicked")
        }))
        .await;
    let counter = calls.clone();
    monitor
        .register_callback(Box::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .await;

    let snapshot = monitor.sample_now().await;
    assert!(snapshot.is_ok());
    // cpu and memory both breach
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_optimal_concurrency_bands() {
    // above threshold: shrink
    let monitor = monitor_with(vec![load(90.0, 10.0)]);
    monitor.sample_now().await.unwrap();
    assert_eq!(monitor.optimal_concurrency(3).await, 2);
    assert_eq!(monitor.optimal_concurrency(1).await, 1);

    // comfortably below: grow, capped at max
    let monitor = monitor_with(vec![load(20.0, 20.0)]);
    monitor.sample_now().await.unwrap();
    assert_eq!(monitor.optimal_concurrency(2).await, 3);
    assert_eq!(monitor.optimal_concurrency(4).await, 4);

    // between 70% of threshold and threshold: hold
    let monitor = monitor_with(vec![load(60.0, 20.0)]);
    monitor.sample_now().await.unwrap();
    assert_eq!(monitor.optimal_concurrency(2).await, 2);
}

#[tokio::test]
async fn test_optimal_concurrency_without_samples_holds() {
    let monitor = monitor_with(vec![]);
    assert_eq!(monitor.optimal_concurrency(3).await, 3);
    assert_eq!(monitor.recommend_workers(3).await, 3);
}

#[tokio::test]
async fn test_unknown_dimensions_are_ignored() {
    let mut sample = load(10.0, 10.0);
    sample.disk_percent = None;
    let monitor = monitor_with(vec![sample]);
    let snapshot = monitor.sample_now().await.unwrap();

    assert_eq!(snapshot.disk_percent, None);
    assert_eq!(monitor.optimal_concurrency(1).await, 2);
}

#[tokio::test]
async fn test_network_threshold_uses_capacity() {
    let config = MonitorConfig {
        network_capacity_bytes_per_sec: Some(1_000.0),
        ..Default::default()
    };
    let snapshot = ResourceSnapshot {
        timestamp: chrono::Utc::now(),
        cpu_percent: 10.0,
        memory_percent: 10.0,
        disk_percent: Some(10.0),
        network_sent_rate: Some(600.0),
        network_recv_rate: Some(300.0),
    };

    let percent = snapshot
        .percent(ResourceKind::Network, config.network_capacity_bytes_per_sec)
        .unwrap();
    assert!((percent - 90.0).abs() < f64::EPSILON);
    assert_eq!(snapshot.percent(ResourceKind::Network, None), None);
}

#[tokio::test]
async fn test_start_and_stop_sampling() {
    let monitor = monitor_with(vec![load(10.0, 10.0)]);

    monitor.start().await;
    monitor.start().await;
    assert!(monitor.is_running().await);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!monitor.history(10).await.is_empty());

    monitor.stop().await;
    assert!(!monitor.is_running().await);

    let stamp = monitor.current_usage().await.unwrap().timestamp;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(monitor.current_usage().await.unwrap().timestamp, stamp);
}

#[tokio::test]
async fn test_sampling_failure_is_reported() {
    let monitor =
        ResourceMonitor::with_sampler(MonitorConfig::default(), Box::new(BrokenSampler)).unwrap();

    let result = monitor.sample_now().await;
    assert!(matches!(result, Err(MonitorError::Sampling(_))));
    assert_eq!(monitor.current_usage().await, Err(MonitorError::NotStarted));
}

#[test]
fn test_threshold_validation() {
    let mut thresholds = ResourceThresholds::default();
    assert!(thresholds.validate().is_ok());

    thresholds.memory_percent = 0.0;
    assert!(matches!(
        thresholds.validate(),
        Err(MonitorError::InvalidThreshold {
            kind: ResourceKind::Memory,
            ..
        })
    ));

    thresholds.memory_percent = 100.0;
    thresholds.cpu_percent = 120.0;
    assert!(thresholds.validate().is_err());
}
