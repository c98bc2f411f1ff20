// SPDX-License-Identifier: MPL-2.0

//! CPU, Memory, and GPU Sampling
//!
//! The CPU sampler owns two loops:
//!
//! - **Primary** (configured interval): CPU tick split, load average,
//!   memory/swap, GPU utilization and CPU temperature.
//! - **Attribution** (every 2s): per-process CPU time from `/proc/<pid>/stat`
//!   on Linux and `ps` elsewhere.
//!
//! # CPU Ticks
//!
//! On Linux the aggregate `cpu` line of `/proc/stat` gives cumulative tick
//! counters. Each poll takes the delta of every field (with counter-reset
//! semantics) and reports each field's share of the total delta. Elsewhere the
//! sampler falls back to sysinfo's global usage, which only yields the total.
//!
//! # GPU Monitoring
//!
//! The detection order is:
//!
//! 1. **NVIDIA**: `nvidia-smi` through the command gateway
//! 2. **AMD**: `/sys/class/drm/card*/device/gpu_busy_percent`
//! 3. **Intel**: current/max frequency ratio from sysfs
//!
//! All percentages are clamped to `[0, 100]` and "used" values never exceed
//! their totals.

use super::attribution::{AttributionTracker, ProcessSample, ATTRIBUTION_PERIOD};
use super::command::run_command;
use super::delta::{counter_delta, percent};
use super::schedule::{sleep_or_stop, stop_requested, RateLimiter};
use super::store::{CpuDetails, Domain, Metric};
use super::supervisor::{DomainSampler, SamplerContext};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{Components, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const NVIDIA_SMI: &str = "/usr/bin/nvidia-smi";
const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const PS_TIMEOUT: Duration = Duration::from_secs(3);
const PS_PATHS: [&str; 2] = ["/bin/ps", "/usr/bin/ps"];

// ============================================================================
// CPU Tick Counters
// ============================================================================

/// Cumulative CPU tick counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTicks {
    pub user: u64,
    pub system: u64,
    pub idle: u64,
    pub nice: u64,
}

/// Share of each tick class over one poll, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSplit {
    pub user: f64,
    pub system: f64,
    pub idle: f64,
    pub nice: f64,
}

impl CpuSplit {
    /// Busy share: everything except idle.
    pub fn usage(&self) -> f64 {
        (self.user + self.system + self.nice).clamp(0.0, 100.0)
    }
}

impl CpuTicks {
    pub fn new(user: u64, system: u64, idle: u64, nice: u64) -> Self {
        Self { user, system, idle, nice }
    }

    /// Percent split between two readings; `None` if no ticks elapsed.
    pub fn split(previous: &CpuTicks, current: &CpuTicks) -> Option<CpuSplit> {
        let user = counter_delta(previous.user, current.user) as f64;
        let system = counter_delta(previous.system, current.system) as f64;
        let idle = counter_delta(previous.idle, current.idle) as f64;
        let nice = counter_delta(previous.nice, current.nice) as f64;
        let total = user + system + idle + nice;
        if total <= 0.0 {
            return None;
        }
        Some(CpuSplit {
            user: percent(user, total),
            system: percent(system, total),
            idle: percent(idle, total),
            nice: percent(nice, total),
        })
    }
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
///
/// iowait is counted as idle; irq, softirq and steal as system.
pub fn parse_proc_stat(text: &str) -> Option<CpuTicks> {
    let line = text.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse().ok())
        .collect::<Option<Vec<u64>>>()?;
    if fields.len() < 4 {
        return None;
    }
    let field = |i: usize| fields.get(i).copied().unwrap_or(0);
    Some(CpuTicks {
        user: field(0),
        nice: field(1),
        system: field(2) + field(5) + field(6) + field(7),
        idle: field(3) + field(4),
    })
}

fn read_cpu_ticks() -> Option<CpuTicks> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    std::fs::read_to_string("/proc/stat")
        .ok()
        .and_then(|text| parse_proc_stat(&text))
}

// ============================================================================
// Process CPU Time (ps)
// ============================================================================

/// Parse a `ps` cumulative time field into milliseconds.
///
/// Accepts `[[dd-]hh:]mm:ss[.cc]`, which covers both Linux and BSD `ps`.
pub fn parse_cpu_time(field: &str) -> Option<u64> {
    let (days, rest) = match field.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, field),
    };
    let parts: Vec<&str> = rest.split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let seconds: f64 = parts.last()?.parse().ok()?;
    if !(0.0..1e9).contains(&seconds) {
        return None;
    }
    let mut whole_minutes = 0u64;
    for part in &parts[..parts.len() - 1] {
        whole_minutes = whole_minutes.checked_mul(60)?.checked_add(part.parse::<u64>().ok()?)?;
    }
    days.checked_mul(86_400)?
        .checked_add(whole_minutes.checked_mul(60)?)?
        .checked_mul(1_000)?
        .checked_add((seconds * 1_000.0).round() as u64)
}

/// Parse `ps -A -o pid=,time=,comm=` output into process samples.
///
/// The primary counter is cumulative CPU time in milliseconds.
pub fn parse_ps_output(text: &str) -> Vec<ProcessSample> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, rest) = line.split_once(char::is_whitespace)?;
            let rest = rest.trim_start();
            let (time, command) = rest.split_once(char::is_whitespace)?;
            let pid = pid.parse::<u32>().ok()?;
            let millis = parse_cpu_time(time)?;
            let command = command.trim();
            // BSD ps prints the full executable path.
            let name = Path::new(command)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| command.to_owned());
            Some(ProcessSample::new(pid, name, millis, 0))
        })
        .collect()
}

fn ps_path() -> PathBuf {
    PS_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from(PS_PATHS[0]))
}

// ============================================================================
// Process CPU Time (procfs)
// ============================================================================

/// Parse `/proc/<pid>/stat` into (command name, utime + stime in clock ticks).
///
/// The command name sits in parentheses and may itself contain spaces or
/// parentheses, so the fields are split after the last `)`.
pub fn parse_pid_stat(text: &str) -> Option<(String, u64)> {
    let open = text.find('(')?;
    let close = text.rfind(')')?;
    let name = text.get(open + 1..close)?;
    let fields: Vec<&str> = text.get(close + 1..)?.split_whitespace().collect();
    // Fields 14 and 15 of the stat line, counted from `state` (field 3).
    let utime = fields.get(11)?.parse::<u64>().ok()?;
    let stime = fields.get(12)?.parse::<u64>().ok()?;
    Some((name.to_owned(), utime.checked_add(stime)?))
}

fn clock_ticks_per_second() -> u64 {
    // SAFETY: sysconf has no preconditions.
    #[cfg(unix)]
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    #[cfg(not(unix))]
    let hz = 100;
    u64::try_from(hz).ok().filter(|hz| *hz > 0).unwrap_or(100)
}

/// Cumulative CPU milliseconds of every process under `/proc`.
fn read_proc_cpu_times(hz: u64) -> Vec<ProcessSample> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            // Processes can exit between listing and reading.
            let text = std::fs::read_to_string(entry.path().join("stat")).ok()?;
            let (name, ticks) = parse_pid_stat(&text)?;
            let millis = ticks.checked_mul(1_000)? / hz;
            Some(ProcessSample::new(pid, name, millis, 0))
        })
        .collect()
}

/// One poll of per-process CPU time: procfs on Linux, `ps` elsewhere.
async fn poll_process_cpu(ps: &Path, hz: u64) -> Option<Vec<ProcessSample>> {
    if cfg!(target_os = "linux") {
        match tokio::task::spawn_blocking(move || read_proc_cpu_times(hz)).await {
            Ok(samples) => Some(samples),
            Err(e) => {
                log::warn!("procfs scan failed: {}", e);
                None
            }
        }
    } else {
        let args = ["-A", "-o", "pid=,time=,comm="];
        let output = run_command(ps, &args, PS_TIMEOUT).await.ok()?;
        Some(parse_ps_output(&output))
    }
}

// ============================================================================
// GPU Vendor Detection
// ============================================================================

/// Supported GPU vendors for utilization monitoring.
#[derive(Debug, Clone, Copy, PartialEq)]
enum GpuVendor {
    /// NVIDIA GPU (uses nvidia-smi)
    Nvidia,
    /// AMD GPU (uses sysfs)
    Amd,
    /// Intel integrated/discrete GPU (uses sysfs frequency ratio)
    Intel,
    /// No supported GPU detected
    None,
}

/// Detect which GPU vendor is present on the system.
fn detect_gpu_vendor() -> GpuVendor {
    if Path::new(NVIDIA_SMI).exists() {
        return GpuVendor::Nvidia;
    }

    // Look at the driver behind each card device (card0, card1, not render nodes).
    for card in drm_cards() {
        if let Ok(driver) = std::fs::read_link(card.join("device/driver")) {
            let driver = driver.to_string_lossy();
            if driver.contains("amdgpu") {
                return GpuVendor::Amd;
            }
            if driver.contains("i915") || driver.contains("xe") {
                return GpuVendor::Intel;
            }
        }
    }

    GpuVendor::None
}

fn drm_cards() -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir("/sys/class/drm") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("card") && !name.contains('-')
        })
        .map(|entry| entry.path())
        .collect()
}

/// Parse nvidia-smi CSV output; multiple GPUs are averaged.
pub fn parse_nvidia_smi(text: &str) -> Option<f64> {
    let values: Vec<f64> = text.lines().filter_map(|l| l.trim().parse::<f64>().ok()).collect();
    if values.is_empty() {
        return None;
    }
    Some((values.iter().sum::<f64>() / values.len() as f64).clamp(0.0, 100.0))
}

async fn fetch_gpu_usage(vendor: GpuVendor) -> Option<f64> {
    let usage = match vendor {
        GpuVendor::Nvidia => {
            let args = ["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"];
            let output = run_command(NVIDIA_SMI, &args, GPU_QUERY_TIMEOUT).await.ok()?;
            parse_nvidia_smi(&output)
        }
        GpuVendor::Amd => drm_cards().into_iter().find_map(|card| {
            let busy = std::fs::read_to_string(card.join("device/gpu_busy_percent")).ok()?;
            busy.trim().parse::<f64>().ok()
        }),
        GpuVendor::Intel => drm_cards().into_iter().find_map(|card| {
            let read = |file: &str| -> Option<f64> {
                std::fs::read_to_string(card.join("gt/gt0").join(file)).ok()?.trim().parse().ok()
            };
            let current = read("rps_cur_freq_mhz")?;
            let max = read("rps_max_freq_mhz")?;
            (max > 0.0).then(|| current / max * 100.0)
        }),
        GpuVendor::None => None,
    };
    usage.map(|u| u.clamp(0.0, 100.0))
}

// ============================================================================
// Temperature
// ============================================================================

/// First sensor whose label looks like a CPU sensor.
///
/// Matches (case-insensitive) "cpu", "package", "core", "tctl" or "tdie",
/// covering Intel coretemp and AMD k10temp labels.
fn cpu_temperature(components: &Components) -> Option<f32> {
    components
        .list()
        .iter()
        .find(|c| {
            let label = c.label().to_lowercase();
            ["cpu", "package", "core", "tctl", "tdie"].iter().any(|k| label.contains(k))
        })
        .map(|c| c.temperature())
        .filter(|t| t.is_finite() && *t > 0.0)
}

// ============================================================================
// Sampler
// ============================================================================

/// CPU domain sampler.
pub struct CpuSampler {
    ctx: SamplerContext,
}

impl CpuSampler {
    pub fn new(ctx: SamplerContext) -> Self {
        Self { ctx }
    }
}

impl DomainSampler for CpuSampler {
    fn id(&self) -> Domain {
        Domain::Cpu
    }

    fn spawn(&self, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(PrimaryLoop::new(self.ctx.clone()).run(stop.clone())),
            tokio::spawn(attribution_loop(self.ctx.clone(), stop)),
        ]
    }
}

/// State owned by the primary loop.
struct PrimaryLoop {
    ctx: SamplerContext,
    sys: System,
    components: Components,
    gpu_vendor: GpuVendor,
    previous_ticks: Option<CpuTicks>,
    limiter: RateLimiter,
}

impl PrimaryLoop {
    fn new(ctx: SamplerContext) -> Self {
        Self {
            ctx,
            sys: System::new(),
            components: Components::new_with_refreshed_list(),
            gpu_vendor: detect_gpu_vendor(),
            previous_ticks: None,
            limiter: RateLimiter::default(),
        }
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        log::debug!("cpu primary loop started, gpu vendor {:?}", self.gpu_vendor);
        loop {
            self.tick(&stop).await;
            let period = self.ctx.config.current().poll_interval();
            if !sleep_or_stop(&mut stop, period).await {
                break;
            }
        }
    }

    async fn tick(&mut self, stop: &watch::Receiver<bool>) {
        if !self.limiter.allow(tokio::time::Instant::now()) {
            return;
        }
        let config = self.ctx.config.current();

        let ticks = read_cpu_ticks();
        let split = match (self.previous_ticks, ticks) {
            (Some(previous), Some(current)) => CpuTicks::split(&previous, &current),
            _ => None,
        };
        if ticks.is_some() {
            self.previous_ticks = ticks;
        }
        let usage = match (ticks, split) {
            (_, Some(split)) => Some(split.usage()),
            // No tick source on this platform: sysinfo keeps its own baseline.
            (None, None) => {
                self.sys.refresh_cpu_all();
                Some(f64::from(self.sys.global_cpu_usage()).clamp(0.0, 100.0))
            }
            // First reading is only a baseline.
            (Some(_), None) => None,
        };

        self.sys.refresh_memory();
        let memory_total = self.sys.total_memory();
        let memory_used = self.sys.used_memory().min(memory_total);
        let swap_total = self.sys.total_swap();
        let swap_used = self.sys.used_swap().min(swap_total);
        let load = System::load_average();
        let load_average = [load.one, load.five, load.fifteen]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
            .then_some([load.one, load.five, load.fifteen]);

        let gpu = fetch_gpu_usage(self.gpu_vendor).await;
        self.components.refresh();
        let temperature = cpu_temperature(&self.components);

        let memory_percent = percent(memory_used as f64, memory_total as f64);
        let swap_percent = percent(swap_used as f64, swap_total as f64);
        if stop_requested(stop) {
            return;
        }

        self.ctx.store.publish(|snap| {
            if let Some(usage) = usage {
                snap.push(Metric::CpuUsage, usage);
                snap.warnings.cpu = usage > f64::from(config.cpu_warning());
            }
            if let Some(split) = split {
                snap.push(Metric::CpuUser, split.user);
                snap.push(Metric::CpuSystem, split.system);
            }
            snap.push(Metric::MemoryUsage, memory_percent);
            snap.push(Metric::SwapUsage, swap_percent);
            if let Some(gpu) = gpu {
                snap.push(Metric::GpuUsage, gpu);
            }
            snap.warnings.memory = memory_percent > f64::from(config.memory_warning());

            let previous = std::mem::take(&mut snap.cpu);
            snap.cpu = CpuDetails {
                user_percent: split.map(|s| s.user).or(previous.user_percent),
                system_percent: split.map(|s| s.system).or(previous.system_percent),
                nice_percent: split.map(|s| s.nice).or(previous.nice_percent),
                idle_percent: split.map(|s| s.idle).or(previous.idle_percent),
                load_average: load_average.or(previous.load_average),
                memory_used,
                memory_total,
                swap_used,
                swap_total,
                gpu_percent: gpu.or(previous.gpu_percent),
                temperature_celsius: temperature.or(previous.temperature_celsius),
            };
        });
        self.ctx.health.record_success(Domain::Cpu);
    }
}

async fn attribution_loop(ctx: SamplerContext, mut stop: watch::Receiver<bool>) {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    // cpu-milliseconds per second to percent of one core
    let mut tracker = AttributionTracker::new(100.0 * cores as f64).with_scale(0.1);
    let ps = ps_path();
    let hz = clock_ticks_per_second();

    while sleep_or_stop(&mut stop, ATTRIBUTION_PERIOD).await {
        let Some(samples) = poll_process_cpu(&ps, hz).await else {
            continue;
        };
        tracker.update(&samples, Instant::now());
        let top = tracker.top(ctx.config.current().cpu_processes());
        if stop_requested(&stop) {
            break;
        }
        ctx.store.publish(|snap| {
            snap.processes.insert(Domain::Cpu, top);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 0.05
    }

    #[test]
    fn tick_split_shares() {
        let previous = CpuTicks::new(100, 50, 850, 0);
        let current = CpuTicks::new(150, 60, 940, 0);
        let split = CpuTicks::split(&previous, &current).unwrap();
        assert!(close(split.user, 33.3));
        assert!(close(split.system, 6.7));
        assert!(close(split.idle, 60.0));
        assert!(close(split.user + split.system + split.idle + split.nice, 100.0));
    }

    #[test]
    fn tick_split_of_raw_deltas() {
        let previous = CpuTicks::new(100, 50, 850, 0);
        let current = CpuTicks::new(150, 60, 890, 0);
        let split = CpuTicks::split(&previous, &current).unwrap();
        assert!(close(split.user, 50.0));
        assert!(close(split.system, 10.0));
        assert!(close(split.idle, 40.0));
        assert!(close(split.usage(), 60.0));
    }

    #[test]
    fn no_elapsed_ticks_gives_nothing() {
        let ticks = CpuTicks::new(1, 2, 3, 4);
        assert_eq!(CpuTicks::split(&ticks, &ticks), None);
    }

    #[test]
    fn proc_stat_aggregate_line() {
        let text = "cpu  4705 150 1120 16250 520 20 30 5 0 0\ncpu0 2000 70 500 8000 260 10 15 2 0 0\nintr 1 2 3\n";
        let ticks = parse_proc_stat(text).unwrap();
        assert_eq!(ticks, CpuTicks::new(4705, 1120 + 20 + 30 + 5, 16250 + 520, 150));
        assert_eq!(parse_proc_stat("intr 1 2\n"), None);
    }

    #[test]
    fn cpu_time_formats() {
        assert_eq!(parse_cpu_time("00:00:05"), Some(5_000));
        assert_eq!(parse_cpu_time("01:02:03"), Some(3_723_000));
        assert_eq!(parse_cpu_time("2-00:00:01"), Some(172_801_000));
        assert_eq!(parse_cpu_time("0:01.50"), Some(1_500));
        assert_eq!(parse_cpu_time("garbage"), None);
    }

    #[test]
    fn ps_output_is_parsed() {
        let text = "    1 00:00:03 systemd\n  812 00:01:10 Xwayland\n 9001 0:02.25 /Applications/Safari.app/Contents/MacOS/Safari\nbogus line\n";
        let samples = parse_ps_output(text);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], ProcessSample::new(1, "systemd", 3_000, 0));
        assert_eq!(samples[1].counters.primary, 70_000);
        assert_eq!(samples[2].key.name, "Safari");
        assert_eq!(samples[2].key.pid, 9001);
    }

    #[test]
    fn oversized_cpu_time_is_rejected() {
        assert_eq!(parse_cpu_time("999999999999999-00:00:01"), None);
        assert_eq!(parse_cpu_time("99999999999999999999:00:00"), None);
        assert_eq!(parse_cpu_time("1e300"), None);
    }

    #[test]
    fn pid_stat_fields() {
        let text = "4242 (Web Content (x)) S 1 4242 4242 0 -1 4194560 9000 0 12 0 731 169 0 0 20 0 30 0 12345 0 0\n";
        assert_eq!(parse_pid_stat(text), Some((String::from("Web Content (x)"), 900)));
        assert_eq!(parse_pid_stat("17 (short) S 1 2"), None);
        assert_eq!(parse_pid_stat("garbage"), None);
    }

    #[test]
    fn sub_second_cpu_time_is_attributed() {
        // 0.9s of CPU in a 2s period, at 100 ticks per second.
        let before = "77 (worker) R 1 77 77 0 -1 0 0 0 0 0 400 100 0 0 20 0 1 0 1 0 0";
        let after = "77 (worker) R 1 77 77 0 -1 0 0 0 0 0 470 120 0 0 20 0 1 0 1 0 0";
        let sample = |text: &str| {
            let (name, ticks) = parse_pid_stat(text).unwrap();
            ProcessSample::new(77, name, ticks * 1_000 / 100, 0)
        };
        let mut tracker = AttributionTracker::new(800.0).with_scale(0.1);
        let now = Instant::now();
        tracker.update(&[sample(before)], now);
        tracker.update(&[sample(after)], now + ATTRIBUTION_PERIOD);
        let top = tracker.top(5);
        assert_eq!(top.len(), 1);
        assert!(close(top[0].rate_primary, 45.0));
    }

    #[test]
    fn nvidia_output_is_averaged_and_clamped() {
        assert_eq!(parse_nvidia_smi("40\n60\n"), Some(50.0));
        assert_eq!(parse_nvidia_smi("250\n"), Some(100.0));
        assert_eq!(parse_nvidia_smi("[N/A]\n"), None);
    }
}
