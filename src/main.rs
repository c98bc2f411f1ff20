// SPDX-License-Identifier: MPL-2.0

//! Headless sampler: prints one summary line per update interval.
//!
//! Usage: `cosmic-monitor-sampler [--json] [CONFIG.json]`

use cosmic_monitor_sampler::{ConfigSource, Domain, Engine, FileConfig, Metric, Snapshot, StaticConfig};
use std::sync::Arc;

const DASH: &str = "-";

fn percent(snap: &Snapshot, metric: Metric) -> String {
    snap.latest(metric).map_or_else(|| DASH.to_string(), |v| format!("{:.1}%", v))
}

fn rate(snap: &Snapshot, metric: Metric) -> String {
    snap.latest(metric)
        .map_or_else(|| DASH.to_string(), |v| format!("{:.1} KB/s", v / 1024.0))
}

fn top_process(snap: &Snapshot, domain: Domain) -> String {
    snap.processes(domain)
        .first()
        .map_or_else(|| DASH.to_string(), |p| format!("{} ({})", p.name, p.pid))
}

fn summary(snap: &Snapshot) -> String {
    let wan = snap.network.wan_address.as_deref().unwrap_or(DASH);
    let temp = snap
        .cpu
        .temperature_celsius
        .map_or_else(|| DASH.to_string(), |t| format!("{:.0}°C", t));
    format!(
        "CPU {} [{}] {} | RAM {} | GPU {} | Net ↓ {} ↑ {} [{}] | Disk R {} W {} [{}] | WAN {}",
        percent(snap, Metric::CpuUsage),
        top_process(snap, Domain::Cpu),
        temp,
        percent(snap, Metric::MemoryUsage),
        percent(snap, Metric::GpuUsage),
        rate(snap, Metric::NetworkIn),
        rate(snap, Metric::NetworkOut),
        top_process(snap, Domain::Network),
        rate(snap, Metric::DiskRead),
        rate(snap, Metric::DiskWrite),
        top_process(snap, Domain::Disk),
        wan,
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut json = false;
    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json" => json = true,
            _ => config_path = Some(arg),
        }
    }

    let config: Arc<dyn ConfigSource> = match config_path {
        Some(path) => Arc::new(FileConfig::new(path)),
        None => Arc::new(StaticConfig::default()),
    };

    let engine = Engine::new(config.clone());
    engine.start().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(config.current().poll_interval()) => {
                let snap = engine.snapshot();
                if json {
                    println!("{}", serde_json::to_string(&snap)?);
                } else {
                    println!("{}", summary(&snap));
                }
            }
        }
    }

    engine.stop().await;
    Ok(())
}
