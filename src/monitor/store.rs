// SPDX-License-Identifier: MPL-2.0

//! # Published Value Store
//!
//! The only structure shared between the sampler loops and the presentation
//! layer. Each loop publishes through [`Store::publish`], which applies all of
//! that tick's changes under one write lock, so a reader never sees half a
//! tick. Readers take a cloned [`Snapshot`].
//!
//! Absent values stay `None`; the presentation layer renders them as a dash.

use super::attribution::ProcessActivity;
use super::delta::{History, RateSample, Unit};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

// ============================================================================
// Keys
// ============================================================================

/// Resource domain, one sampler each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Domain {
    Cpu,
    Network,
    Disk,
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Domain::Cpu => "cpu",
            Domain::Network => "network",
            Domain::Disk => "disk",
        };
        f.write_str(name)
    }
}

/// Every published rate metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Metric {
    CpuUsage,
    CpuUser,
    CpuSystem,
    MemoryUsage,
    SwapUsage,
    GpuUsage,
    NetworkIn,
    NetworkOut,
    DiskRead,
    DiskWrite,
}

impl Metric {
    pub fn unit(self) -> Unit {
        match self {
            Metric::NetworkIn | Metric::NetworkOut | Metric::DiskRead | Metric::DiskWrite => Unit::BytesPerSecond,
            _ => Unit::Percent,
        }
    }
}

// ============================================================================
// Published Values
// ============================================================================

/// Latest value and rolling history of one metric.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricSeries {
    pub history: History,
}

impl MetricSeries {
    pub fn latest(&self) -> Option<&RateSample> {
        self.history.latest()
    }
}

/// CPU-domain secondary values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuDetails {
    pub user_percent: Option<f64>,
    pub system_percent: Option<f64>,
    pub nice_percent: Option<f64>,
    pub idle_percent: Option<f64>,
    /// 1, 5 and 15 minute load averages
    pub load_average: Option<[f64; 3]>,
    pub memory_used: u64,
    pub memory_total: u64,
    pub swap_used: u64,
    pub swap_total: u64,
    pub gpu_percent: Option<f64>,
    pub temperature_celsius: Option<f32>,
}

/// One mounted volume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskInfo {
    pub name: String,
    pub mount_point: String,
    pub total_space: u64,
    pub free_space: u64,
    /// `total - free`, never negative
    pub used_space: u64,
    /// Used fraction in `[0, 1]`
    pub usage_percentage: f64,
    pub removable: bool,
}

impl DiskInfo {
    pub fn new(name: impl Into<String>, mount_point: impl Into<String>, total_space: u64, free_space: u64, removable: bool) -> Self {
        let used_space = total_space.saturating_sub(free_space);
        let usage_percentage = if total_space > 0 {
            (used_space as f64 / total_space as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            name: name.into(),
            mount_point: mount_point.into(),
            total_space,
            free_space,
            used_space,
            usage_percentage,
            removable,
        }
    }
}

/// Network-domain availability values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkDetails {
    pub reachable: Option<bool>,
    pub wan_address: Option<String>,
    pub wan_updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Threshold crossings, re-evaluated on every publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Warnings {
    pub cpu: bool,
    pub memory: bool,
    pub disk: bool,
}

/// Everything the presentation layer can read.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub metrics: BTreeMap<Metric, MetricSeries>,
    pub processes: HashMap<Domain, Vec<ProcessActivity>>,
    pub cpu: CpuDetails,
    pub disks: Vec<DiskInfo>,
    pub network: NetworkDetails,
    pub warnings: Warnings,
}

impl Snapshot {
    /// Append a value to a metric's history.
    pub fn push(&mut self, metric: Metric, value: f64) {
        self.metrics
            .entry(metric)
            .or_default()
            .history
            .push(RateSample::now(value, metric.unit()));
    }

    pub fn latest(&self, metric: Metric) -> Option<f64> {
        self.metrics.get(&metric).and_then(|s| s.latest()).map(|s| s.value)
    }

    pub fn history(&self, metric: Metric) -> Vec<f64> {
        self.metrics.get(&metric).map(|s| s.history.values()).unwrap_or_default()
    }

    pub fn processes(&self, domain: Domain) -> &[ProcessActivity] {
        self.processes.get(&domain).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ============================================================================
// Store
// ============================================================================

/// Thread-safe holder of the current [`Snapshot`].
#[derive(Debug, Default)]
pub struct Store {
    inner: RwLock<Snapshot>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one tick's worth of changes atomically.
    pub fn publish<R>(&self, update: impl FnOnce(&mut Snapshot) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut guard)
    }

    /// Eventually-consistent copy for readers.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Read one value without cloning the whole snapshot.
    pub fn read<R>(&self, view: impl FnOnce(&Snapshot) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        view(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_usage_is_a_fraction() {
        let disk = DiskInfo::new("disk0", "/", 1_000_000_000_000, 400_000_000_000, false);
        assert_eq!(disk.used_space, 600_000_000_000);
        assert!((disk.usage_percentage - 0.6).abs() < 1e-12);
    }

    #[test]
    fn free_above_total_clamps_used_to_zero() {
        let disk = DiskInfo::new("odd", "/mnt", 100, 250, true);
        assert_eq!(disk.used_space, 0);
        assert_eq!(disk.usage_percentage, 0.0);
        let empty = DiskInfo::new("empty", "/e", 0, 0, false);
        assert_eq!(empty.usage_percentage, 0.0);
    }

    #[test]
    fn publish_is_visible_as_a_whole() {
        let store = Store::new();
        store.publish(|s| {
            s.push(Metric::NetworkIn, 10.0);
            s.push(Metric::NetworkOut, 20.0);
        });
        let snap = store.snapshot();
        assert_eq!(snap.latest(Metric::NetworkIn), Some(10.0));
        assert_eq!(snap.latest(Metric::NetworkOut), Some(20.0));
        assert_eq!(snap.latest(Metric::DiskRead), None);
        assert!(snap.processes(Domain::Cpu).is_empty());
    }

    #[test]
    fn metric_units() {
        assert_eq!(Metric::DiskWrite.unit(), Unit::BytesPerSecond);
        assert_eq!(Metric::GpuUsage.unit(), Unit::Percent);
    }
}
