//! Host resource sampling.
//!
//! [`SystemSampler`] reads CPU, memory, disk and network counters through
//! `sysinfo`. Disk and network reads are best effort: when the platform
//! exposes no disks or interfaces the corresponding reading is `None` and the
//! rest of the sample is still produced.

use crate::monitor::types::RawSample;
use anyhow::{Result, anyhow};
use sysinfo::{Disks, Networks, System};
use tracing::debug;

/// Produces raw resource readings; the monitor owns one and calls it once per tick
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> Result<RawSample>;
}

/// Sampler backed by the host operating system
pub struct SystemSampler {
    system: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is computed between two refreshes; prime the first one.
        system.refresh_cpu_usage();
        Self { system }
    }

    fn memory_percent(&mut self) -> Result<f64> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(anyhow!("total memory reported as zero"));
        }
        Ok(self.system.used_memory() as f64 / total as f64 * 100.0)
    }

    fn disk_percent() -> Option<f64> {
        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks
            .list()
            .iter()
            .filter(|disk| disk.total_space() > 0)
            .fold((0u64, 0u64), |(total, available), disk| {
                (
                    total.saturating_add(disk.total_space()),
                    available.saturating_add(disk.available_space()),
                )
            });

        if total == 0 {
            debug!("No disks reported; disk usage unknown");
            return None;
        }
        Some(total.saturating_sub(available) as f64 / total as f64 * 100.0)
    }

    fn network_totals() -> Option<(u64, u64)> {
        let networks = Networks::new_with_refreshed_list();
        if networks.list().is_empty() {
            debug!("No network interfaces reported; network usage unknown");
            return None;
        }
        Some(
            networks
                .list()
                .values()
                .fold((0u64, 0u64), |(sent, recv), data| {
                    (
                        sent.saturating_add(data.total_transmitted()),
                        recv.saturating_add(data.total_received()),
                    )
                }),
        )
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&mut self) -> Result<RawSample> {
        self.system.refresh_cpu_usage();
        let cpu_percent = f64::from(self.system.global_cpu_usage()).clamp(0.0, 100.0);
        let memory_percent = self.memory_percent()?;
        let network = Self::network_totals();

        Ok(RawSample {
            cpu_percent,
            memory_percent,
            disk_percent: Self::disk_percent(),
            network_bytes_sent: network.map(|(sent, _)| sent),
            network_bytes_recv: network.map(|(_, recv)| recv),
        })
    }
}

/// Number of logical CPUs, falling back to 4 when unknown
pub fn detect_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
