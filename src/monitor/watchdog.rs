// SPDX-License-Identifier: MPL-2.0

//! Health records and the watchdog that restarts wedged samplers.
//!
//! Each sampler stamps its [`HealthRegistry`] entry after every successful
//! primary poll. The watchdog compares those stamps against its own check
//! interval; a sampler that is merely slow stamps again before the threshold
//! and is left alone.

use super::schedule::sleep_or_stop;
use super::store::Domain;
use super::supervisor::Supervisor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Check interval, also used as the staleness threshold.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Whether a sampler last seen at `last_success` is stale at `now`.
pub fn is_stale(last_success: Instant, now: Instant, threshold: Duration) -> bool {
    now.saturating_duration_since(last_success) > threshold
}

/// Last successful update per sampler.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    records: Mutex<HashMap<Domain, Instant>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, id: Domain) {
        self.record_success_at(id, Instant::now());
    }

    pub fn record_success_at(&self, id: Domain, at: Instant) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).insert(id, at);
    }

    pub fn last_success(&self, id: Domain) -> Option<Instant> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).get(&id).copied()
    }

    pub fn forget(&self, id: Domain) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }

    /// Registered samplers whose last success is older than `threshold`.
    pub fn stale(&self, now: Instant, threshold: Duration) -> Vec<Domain> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stale: Vec<Domain> = records
            .iter()
            .filter(|(_, last)| is_stale(**last, now, threshold))
            .map(|(id, _)| *id)
            .collect();
        stale.sort();
        stale
    }
}

/// Periodically restarts samplers whose health record went stale.
pub struct Watchdog {
    interval: Duration,
    health: Arc<HealthRegistry>,
    supervisor: Arc<Supervisor>,
}

impl Watchdog {
    pub fn new(health: Arc<HealthRegistry>, supervisor: Arc<Supervisor>) -> Self {
        Self::with_interval(WATCHDOG_INTERVAL, health, supervisor)
    }

    pub fn with_interval(interval: Duration, health: Arc<HealthRegistry>, supervisor: Arc<Supervisor>) -> Self {
        Self {
            interval,
            health,
            supervisor,
        }
    }

    /// One check pass. Returns the samplers that were restarted.
    pub async fn check(&self, now: Instant) -> Vec<Domain> {
        let stale = self.health.stale(now, self.interval);
        for id in &stale {
            log::warn!("{} sampler stale for over {:?}, restarting", id, self.interval);
            self.supervisor.restart(*id).await;
        }
        stale
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        log::info!("watchdog started, interval {:?}", self.interval);
        while sleep_or_stop(&mut stop, self.interval).await {
            self.check(Instant::now()).await;
        }
        log::info!("watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_threshold_is_exclusive() {
        let last = Instant::now();
        assert!(is_stale(last, last + Duration::from_secs(31), WATCHDOG_INTERVAL));
        assert!(!is_stale(last, last + Duration::from_secs(29), WATCHDOG_INTERVAL));
        assert!(!is_stale(last, last + WATCHDOG_INTERVAL, WATCHDOG_INTERVAL));
    }

    #[test]
    fn clock_skew_is_never_stale() {
        let now = Instant::now();
        assert!(!is_stale(now + Duration::from_secs(5), now, WATCHDOG_INTERVAL));
    }

    #[test]
    fn registry_reports_only_stale_samplers() {
        let registry = HealthRegistry::new();
        let now = Instant::now();
        registry.record_success_at(Domain::Cpu, now);
        registry.record_success_at(Domain::Network, now + Duration::from_secs(20));
        registry.record_success_at(Domain::Disk, now + Duration::from_secs(2));

        let later = now + Duration::from_secs(31);
        assert_eq!(registry.stale(later, WATCHDOG_INTERVAL), vec![Domain::Cpu]);

        registry.forget(Domain::Cpu);
        assert!(registry.stale(later, WATCHDOG_INTERVAL).is_empty());
        assert_eq!(registry.last_success(Domain::Cpu), None);
    }
}
