// SPDX-License-Identifier: MPL-2.0

//! Sampler configuration
//!
//! The settings store is an external collaborator. Samplers never cache a
//! [`Config`]; they ask their [`ConfigSource`] for the current value every time
//! they need one, so edits made by the settings UI take effect on the next tick.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Smallest poll interval a sampler will honour (matches the rate limiter gap).
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Largest poll interval a sampler will honour.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Bounds for the per-domain process list length.
pub const PROCESS_COUNT_RANGE: std::ops::RangeInclusive<usize> = 1..=10;

// ============================================================================
// Config Struct
// ============================================================================

/// Plain read-only settings consumed by the samplers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Primary poll interval in milliseconds
    pub update_interval_ms: u64,
    /// Number of top CPU processes to publish
    pub cpu_process_count: usize,
    /// Number of top network processes to publish
    pub network_process_count: usize,
    /// Number of top disk processes to publish
    pub disk_process_count: usize,
    /// CPU usage warning threshold (percent)
    pub cpu_warning_threshold: f32,
    /// Memory usage warning threshold (percent)
    pub memory_warning_threshold: f32,
    /// Disk space usage warning threshold (percent)
    pub disk_warning_threshold: f32,
    /// Whether the WAN address lookup runs at all
    pub wan_lookup_enabled: bool,
    /// Ordered list of plaintext-IP endpoints, tried first to last
    pub wan_endpoints: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            update_interval_ms: 1000,
            cpu_process_count: 5,
            network_process_count: 5,
            disk_process_count: 5,
            cpu_warning_threshold: 80.0,
            memory_warning_threshold: 85.0,
            disk_warning_threshold: 90.0,
            wan_lookup_enabled: true,
            wan_endpoints: vec![
                String::from("https://api.ipify.org"),
                String::from("https://icanhazip.com"),
                String::from("https://ifconfig.me/ip"),
            ],
        }
    }
}

impl Config {
    /// Poll interval clamped to `[MIN_POLL_INTERVAL, MAX_POLL_INTERVAL]`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
    }

    pub fn cpu_processes(&self) -> usize {
        clamp_count(self.cpu_process_count)
    }

    pub fn network_processes(&self) -> usize {
        clamp_count(self.network_process_count)
    }

    pub fn disk_processes(&self) -> usize {
        clamp_count(self.disk_process_count)
    }

    pub fn cpu_warning(&self) -> f32 {
        clamp_threshold(self.cpu_warning_threshold)
    }

    pub fn memory_warning(&self) -> f32 {
        clamp_threshold(self.memory_warning_threshold)
    }

    pub fn disk_warning(&self) -> f32 {
        clamp_threshold(self.disk_warning_threshold)
    }
}

fn clamp_count(count: usize) -> usize {
    count.clamp(*PROCESS_COUNT_RANGE.start(), *PROCESS_COUNT_RANGE.end())
}

fn clamp_threshold(value: f32) -> f32 {
    if value.is_nan() {
        return 100.0;
    }
    value.clamp(0.0, 100.0)
}

// ============================================================================
// Config Sources
// ============================================================================

/// Read-only view of the settings store, re-read on every use.
pub trait ConfigSource: Send + Sync {
    fn current(&self) -> Config;
}

/// A fixed configuration, mostly useful for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub Config);

impl ConfigSource for StaticConfig {
    fn current(&self) -> Config {
        self.0.clone()
    }
}

/// Re-reads a JSON settings file on every call.
///
/// A missing or malformed file yields the defaults, so a half-written file
/// from the settings app never stops sampling. Only the first failure after a
/// good read is logged as a warning.
#[derive(Debug)]
pub struct FileConfig {
    path: PathBuf,
    failing: AtomicBool,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            failing: AtomicBool::new(false),
        }
    }

    /// Record a failed read. Returns `true` if this failure was warned about.
    fn report_failure(&self, e: &dyn std::error::Error) -> bool {
        if self.failing.swap(true, Ordering::Relaxed) {
            log::debug!("using default config, {} unreadable: {}", self.path.display(), e);
            false
        } else {
            log::warn!("using default config, {} unreadable: {}", self.path.display(), e);
            true
        }
    }

    fn load(&self) -> Result<Config, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl ConfigSource for FileConfig {
    fn current(&self) -> Config {
        match self.load() {
            Ok(config) => {
                if self.failing.swap(false, Ordering::Relaxed) {
                    log::info!("config {} readable again", self.path.display());
                }
                config
            }
            Err(e) => {
                self.report_failure(e.as_ref());
                Config::default()
            }
        }
    }
}
