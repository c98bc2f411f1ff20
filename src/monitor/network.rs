// SPDX-License-Identifier: MPL-2.0

//! Network monitoring
//!
//! Three loops: interface byte rates on the configured interval, per-process
//! traffic via `nettop` every 2s, and the WAN address lookup once a minute.

use super::attribution::{AttributionTracker, ProcessSample, ATTRIBUTION_PERIOD};
use super::command::run_command;
use super::delta::{CounterPair, MAX_BYTE_RATE};
use super::fetcher::{HttpLookup, Reachability, ResilientFetcher, RouteCheck, FETCH_PERIOD};
use super::schedule::{sleep_or_stop, stop_requested, RateLimiter};
use super::store::{Domain, Metric};
use super::supervisor::{DomainSampler, SamplerContext};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::Networks;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const NETTOP: &str = "/usr/bin/nettop";
const NETTOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback traffic never leaves the host and is excluded from totals.
fn is_loopback(interface: &str) -> bool {
    interface == "lo" || interface.starts_with("lo0")
}

/// Cumulative (received, transmitted) bytes over all non-loopback interfaces.
fn total_bytes(networks: &Networks) -> (u64, u64) {
    networks
        .iter()
        .filter(|(name, _)| !is_loopback(name))
        .fold((0u64, 0u64), |(rx, tx), (_, data)| {
            (rx.saturating_add(data.total_received()), tx.saturating_add(data.total_transmitted()))
        })
}

/// Parse `nettop -P -L 1 -x -J bytes_in,bytes_out` CSV output.
///
/// Rows look like `Safari.4321,1048576,20480,`; the header row starts with a
/// comma. The primary counter is bytes in, the secondary bytes out.
pub fn parse_nettop(text: &str) -> Vec<ProcessSample> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split(',');
            let process = fields.next()?.trim();
            let (name, pid) = process.rsplit_once('.')?;
            let pid = pid.parse::<u32>().ok()?;
            let bytes_in = fields.next()?.trim().parse::<u64>().ok()?;
            let bytes_out = fields.next()?.trim().parse::<u64>().ok()?;
            Some(ProcessSample::new(pid, name, bytes_in, bytes_out))
        })
        .collect()
}

/// Network domain sampler.
pub struct NetworkSampler {
    ctx: SamplerContext,
    reachability: Arc<dyn Reachability>,
}

impl NetworkSampler {
    pub fn new(ctx: SamplerContext) -> Self {
        Self::with_reachability(ctx, Arc::new(RouteCheck))
    }

    pub fn with_reachability(ctx: SamplerContext, reachability: Arc<dyn Reachability>) -> Self {
        Self { ctx, reachability }
    }
}

impl DomainSampler for NetworkSampler {
    fn id(&self) -> Domain {
        Domain::Network
    }

    fn spawn(&self, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(primary_loop(self.ctx.clone(), self.reachability.clone(), stop.clone())),
            tokio::spawn(attribution_loop(self.ctx.clone(), stop.clone())),
            tokio::spawn(fetch_loop(self.ctx.clone(), self.reachability.clone(), stop)),
        ]
    }
}

async fn primary_loop(ctx: SamplerContext, reachability: Arc<dyn Reachability>, mut stop: watch::Receiver<bool>) {
    let mut networks = Networks::new_with_refreshed_list();
    let mut limiter = RateLimiter::default();
    let mut counters = CounterPair::new(MAX_BYTE_RATE);

    loop {
        if limiter.allow(tokio::time::Instant::now()) {
            networks.refresh();
            let (rx, tx) = total_bytes(&networks);
            let rates = counters.update(Instant::now(), rx, tx);
            let reachable = reachability.is_reachable();
            if stop_requested(&stop) {
                break;
            }
            ctx.store.publish(|snap| {
                if let Some((rx_rate, tx_rate)) = rates {
                    snap.push(Metric::NetworkIn, rx_rate);
                    snap.push(Metric::NetworkOut, tx_rate);
                }
                snap.network.reachable = Some(reachable);
            });
            ctx.health.record_success(Domain::Network);
        }

        let period = ctx.config.current().poll_interval();
        if !sleep_or_stop(&mut stop, period).await {
            break;
        }
    }
}

async fn attribution_loop(ctx: SamplerContext, mut stop: watch::Receiver<bool>) {
    let mut tracker = AttributionTracker::new(MAX_BYTE_RATE);
    let args = ["-P", "-L", "1", "-x", "-J", "bytes_in,bytes_out"];

    while sleep_or_stop(&mut stop, ATTRIBUTION_PERIOD).await {
        let Ok(output) = run_command(NETTOP, &args, NETTOP_TIMEOUT).await else {
            continue;
        };
        tracker.update(&parse_nettop(&output), Instant::now());
        let top = tracker.top(ctx.config.current().network_processes());
        if stop_requested(&stop) {
            break;
        }
        ctx.store.publish(|snap| {
            snap.processes.insert(Domain::Network, top);
        });
    }
}

async fn fetch_loop(ctx: SamplerContext, reachability: Arc<dyn Reachability>, mut stop: watch::Receiver<bool>) {
    let mut fetcher = ResilientFetcher::new(HttpLookup::default());

    loop {
        let config = ctx.config.current();
        if config.wan_lookup_enabled {
            // A stop request interrupts a fetch that is sitting in backoff.
            let outcome = tokio::select! {
                outcome = fetcher.fetch(&config.wan_endpoints, reachability.as_ref()) => Some(outcome),
                _ = stop.changed() => None,
            };
            match outcome {
                None => break,
                Some(Ok(address)) => {
                    log::debug!("WAN address {}", address);
                    ctx.store.publish(|snap| {
                        snap.network.wan_address = Some(address);
                        snap.network.wan_updated_at = Some(chrono::Utc::now());
                    });
                }
                // Keep whatever address was published before.
                Some(Err(e)) => log::debug!("WAN address unchanged: {}", e),
            }
        }
        if !sleep_or_stop(&mut stop, FETCH_PERIOD).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nettop_rows_are_parsed() {
        let text = ",bytes_in,bytes_out,\nkernel_task.0,0,0,\nSafari.4321,1048576,20480,\ncom.apple.WebKit.Networking.812,77,9,\n";
        let samples = parse_nettop(text);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[1], ProcessSample::new(4321, "Safari", 1_048_576, 20_480));
        // Dots inside the process name are kept; only the last one splits the pid.
        assert_eq!(samples[2].key.name, "com.apple.WebKit.Networking");
        assert_eq!(samples[2].key.pid, 812);
    }

    #[test]
    fn malformed_nettop_rows_are_skipped() {
        assert!(parse_nettop("garbage\nname.notapid,1,2,\nname.1,x,2,\n").is_empty());
    }

    #[test]
    fn loopback_is_excluded() {
        assert!(is_loopback("lo"));
        assert!(is_loopback("lo0"));
        assert!(!is_loopback("eth0"));
        assert!(!is_loopback("wlo1"));
    }
}
