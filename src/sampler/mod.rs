use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use sysinfo::{CpuRefreshKind, RefreshKind, System};

/// One instantaneous CPU utilization reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    /// Utilization across all cores, within [0, 100].
    pub percent: f64,
}

impl Sample {
    /// Creates a sample, rejecting values outside [0, 100].
    pub fn new(timestamp: DateTime<Utc>, percent: f64) -> Result<Self> {
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            bail!("cpu percent {percent} outside [0, 100]");
        }

        Ok(Self { timestamp, percent })
    }
}

/// Produces CPU utilization samples on demand.
pub trait SampleSource: Send {
    fn sample(&mut self) -> Result<Sample>;
}

/// System-wide CPU usage read through sysinfo.
///
/// Usage is computed between consecutive refreshes, so the source is primed
/// once on construction and the first real sample covers the first interval.
pub struct SysinfoSource {
    system: System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let mut system = System::new_with_specifics(
            RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
        );
        system.refresh_cpu();

        Self { system }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for SysinfoSource {
    fn sample(&mut self) -> Result<Sample> {
        self.system.refresh_cpu();

        if self.system.cpus().is_empty() {
            bail!("no CPUs reported by the system");
        }

        let usage = f64::from(self.system.global_cpu_info().cpu_usage());

        // Rounding in the per-core average can overshoot by a hair.
        Sample::new(Utc::now(), usage.clamp(0.0, 100.0))
    }
}
