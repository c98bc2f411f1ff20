// SPDX-License-Identifier: MPL-2.0

//! Disk I/O, enumeration and eject
//!
//! The disk sampler owns three loops: aggregate read/write byte rates on the
//! configured interval, the mounted-volume list every 10s, and per-process I/O
//! every 2s. Ejecting a volume is a one-shot call on [`DiskEjector`].

use super::attribution::{AttributionTracker, ProcessSample, ATTRIBUTION_PERIOD};
use super::command::run_command;
use super::delta::{CounterPair, MAX_BYTE_RATE};
use super::schedule::{sleep_or_stop, stop_requested, RateLimiter};
use super::store::{DiskInfo, Domain, Metric};
use super::supervisor::{DomainSampler, SamplerContext};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{Disks, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How often the mounted-volume list is refreshed.
pub const ENUMERATION_PERIOD: Duration = Duration::from_secs(10);
pub const EJECT_TIMEOUT: Duration = Duration::from_secs(30);

const SECTOR_SIZE: u64 = 512;
const DISKSTATS: &str = "/proc/diskstats";
const IOREG: &str = "/usr/sbin/ioreg";
const IOREG_TIMEOUT: Duration = Duration::from_secs(3);
const VIRTUAL_DEVICE_PREFIXES: [&str; 5] = ["loop", "ram", "zram", "dm-", "md"];

// ============================================================================
// Counter Parsers
// ============================================================================

/// Whether a `/proc/diskstats` device name can be a physical disk.
///
/// Partitions are filtered separately, since their I/O is already counted by
/// the parent device.
pub fn is_physical_device(name: &str) -> bool {
    !name.is_empty() && !VIRTUAL_DEVICE_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Sum of (read, written) bytes over whole devices in `/proc/diskstats`.
///
/// `is_whole_device` decides which names are whole disks rather than
/// partitions.
pub fn parse_diskstats(text: &str, is_whole_device: impl Fn(&str) -> bool) -> Option<(u64, u64)> {
    let mut totals = None;
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let name = fields[2];
        if !is_physical_device(name) || !is_whole_device(name) {
            continue;
        }
        let (Ok(sectors_read), Ok(sectors_written)) = (fields[5].parse::<u64>(), fields[9].parse::<u64>()) else {
            continue;
        };
        let (read, written) = totals.get_or_insert((0u64, 0u64));
        *read = read.saturating_add(sectors_read.saturating_mul(SECTOR_SIZE));
        *written = written.saturating_add(sectors_written.saturating_mul(SECTOR_SIZE));
    }
    totals
}

fn sys_block_has(name: &str) -> bool {
    Path::new("/sys/block").join(name).exists()
}

/// Numeric value following `"key"=` in an ioreg statistics dictionary.
fn ioreg_value(line: &str, key: &str) -> Option<u64> {
    let needle = format!("\"{}\"=", key);
    let start = line.find(&needle)? + needle.len();
    let digits: String = line[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Sum of (read, written) bytes over every block storage driver in
/// `ioreg -c IOBlockStorageDriver -r -w 0` output.
pub fn parse_ioreg(text: &str) -> Option<(u64, u64)> {
    let mut totals = None;
    for line in text.lines().filter(|l| l.contains("\"Statistics\"")) {
        let read = ioreg_value(line, "Bytes (Read)");
        let written = ioreg_value(line, "Bytes (Write)");
        if read.is_none() && written.is_none() {
            continue;
        }
        let (r, w) = totals.get_or_insert((0u64, 0u64));
        *r = r.saturating_add(read.unwrap_or(0));
        *w = w.saturating_add(written.unwrap_or(0));
    }
    totals
}

/// Current cumulative (read, written) bytes for the whole host.
async fn read_disk_counters() -> Option<(u64, u64)> {
    if cfg!(target_os = "linux") {
        match tokio::fs::read_to_string(DISKSTATS).await {
            Ok(text) => parse_diskstats(&text, sys_block_has),
            Err(e) => {
                log::debug!("cannot read {}: {}", DISKSTATS, e);
                None
            }
        }
    } else {
        let output = run_command(IOREG, &["-c", "IOBlockStorageDriver", "-r", "-w", "0"], IOREG_TIMEOUT)
            .await
            .ok()?;
        parse_ioreg(&output)
    }
}

// ============================================================================
// Enumeration
// ============================================================================

fn list_disks(disks: &Disks) -> Vec<DiskInfo> {
    let mut seen = std::collections::HashSet::new();
    disks
        .list()
        .iter()
        .filter(|disk| disk.total_space() > 0)
        .filter(|disk| seen.insert(disk.mount_point().to_path_buf()))
        .map(|disk| {
            DiskInfo::new(
                disk.name().to_string_lossy(),
                disk.mount_point().to_string_lossy(),
                disk.total_space(),
                disk.available_space(),
                disk.is_removable(),
            )
        })
        .collect()
}

/// Whether any volume is fuller than `threshold` percent.
pub fn disk_warning(disks: &[DiskInfo], threshold: f32) -> bool {
    disks.iter().any(|d| d.usage_percentage * 100.0 > f64::from(threshold))
}

/// Re-enumerate mounted volumes off the runtime and publish them.
///
/// A hung mount point can stall the enumeration, so it runs on the blocking
/// pool. Returns the `Disks` handle for reuse.
async fn refresh_disks(ctx: &SamplerContext, mut disks: Disks) -> Disks {
    let scan = tokio::task::spawn_blocking(move || {
        disks.refresh_list();
        let list = list_disks(&disks);
        (disks, list)
    })
    .await;
    let (disks, list) = match scan {
        Ok(scan) => scan,
        Err(e) => {
            log::warn!("disk enumeration failed: {}", e);
            return Disks::new();
        }
    };
    let warning = disk_warning(&list, ctx.config.current().disk_warning());
    ctx.store.publish(|snap| {
        snap.disks = list;
        snap.warnings.disk = warning;
    });
    disks
}

// ============================================================================
// Eject
// ============================================================================

/// Result of an eject request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EjectOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

impl EjectOutcome {
    fn ok() -> Self {
        Self { success: true, reason: None }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

fn default_eject_command() -> (PathBuf, Vec<String>) {
    if cfg!(target_os = "macos") {
        (PathBuf::from("/usr/sbin/diskutil"), vec!["eject".to_string()])
    } else {
        (PathBuf::from("/usr/bin/eject"), Vec::new())
    }
}

/// Ejects mounted volumes through the command gateway.
pub struct DiskEjector {
    ctx: SamplerContext,
    program: PathBuf,
    leading_args: Vec<String>,
    timeout: Duration,
}

impl DiskEjector {
    pub fn new(ctx: SamplerContext) -> Self {
        let (program, leading_args) = default_eject_command();
        Self::with_command(ctx, program, leading_args)
    }

    /// Eject with `program leading_args.. <mount>`.
    pub fn with_command(ctx: SamplerContext, program: impl Into<PathBuf>, leading_args: Vec<String>) -> Self {
        Self {
            ctx,
            program: program.into(),
            leading_args,
            timeout: EJECT_TIMEOUT,
        }
    }

    pub async fn eject(&self, mount: &str) -> EjectOutcome {
        let mount = mount.trim();
        if mount.is_empty() {
            return EjectOutcome::failed("no mount point given");
        }

        let mut args: Vec<&str> = self.leading_args.iter().map(String::as_str).collect();
        args.push(mount);
        match run_command(&self.program, &args, self.timeout).await {
            Ok(_) => {
                log::info!("ejected {}", mount);
                refresh_disks(&self.ctx, Disks::new()).await;
                EjectOutcome::ok()
            }
            Err(e) => EjectOutcome::failed(e.to_string()),
        }
    }
}

// ============================================================================
// Sampler
// ============================================================================

/// Disk domain sampler.
pub struct DiskSampler {
    ctx: SamplerContext,
}

impl DiskSampler {
    pub fn new(ctx: SamplerContext) -> Self {
        Self { ctx }
    }
}

impl DomainSampler for DiskSampler {
    fn id(&self) -> Domain {
        Domain::Disk
    }

    fn spawn(&self, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(primary_loop(self.ctx.clone(), stop.clone())),
            tokio::spawn(enumeration_loop(self.ctx.clone(), stop.clone())),
            tokio::spawn(attribution_loop(self.ctx.clone(), stop)),
        ]
    }
}

async fn primary_loop(ctx: SamplerContext, mut stop: watch::Receiver<bool>) {
    let mut limiter = RateLimiter::default();
    let mut counters = CounterPair::new(MAX_BYTE_RATE);

    loop {
        if limiter.allow(tokio::time::Instant::now()) {
            let rates = match read_disk_counters().await {
                Some((read, written)) => counters.update(Instant::now(), read, written),
                None => None,
            };
            if stop_requested(&stop) {
                break;
            }
            if let Some((read_rate, write_rate)) = rates {
                ctx.store.publish(|snap| {
                    snap.push(Metric::DiskRead, read_rate);
                    snap.push(Metric::DiskWrite, write_rate);
                });
            }
            // The loop itself is alive even on hosts without a counter source.
            ctx.health.record_success(Domain::Disk);
        }

        let period = ctx.config.current().poll_interval();
        if !sleep_or_stop(&mut stop, period).await {
            break;
        }
    }
}

async fn enumeration_loop(ctx: SamplerContext, mut stop: watch::Receiver<bool>) {
    let mut disks = Disks::new();
    loop {
        disks = refresh_disks(&ctx, disks).await;
        if !sleep_or_stop(&mut stop, ENUMERATION_PERIOD).await {
            break;
        }
    }
}

fn process_io(sys: &System) -> Vec<ProcessSample> {
    sys.processes()
        .iter()
        .map(|(pid, process)| {
            let usage = process.disk_usage();
            ProcessSample::new(
                pid.as_u32(),
                process.name().to_string_lossy(),
                usage.total_read_bytes,
                usage.total_written_bytes,
            )
        })
        .collect()
}

async fn attribution_loop(ctx: SamplerContext, mut stop: watch::Receiver<bool>) {
    let mut sys = System::new();
    let mut tracker = AttributionTracker::new(MAX_BYTE_RATE);

    while sleep_or_stop(&mut stop, ATTRIBUTION_PERIOD).await {
        // Process scans touch procfs for every pid; keep them off the runtime.
        let scan = tokio::task::spawn_blocking(move || {
            sys.refresh_processes(ProcessesToUpdate::All, true);
            let samples = process_io(&sys);
            (sys, samples)
        })
        .await;
        let samples = match scan {
            Ok((scanned, samples)) => {
                sys = scanned;
                samples
            }
            Err(e) => {
                log::warn!("process scan failed: {}", e);
                sys = System::new();
                continue;
            }
        };
        tracker.update(&samples, Instant::now());
        let top = tracker.top(ctx.config.current().disk_processes());
        if stop_requested(&stop) {
            break;
        }
        ctx.store.publish(|snap| {
            snap.processes.insert(Domain::Disk, top);
        });
    }
}
