// SPDX-License-Identifier: MPL-2.0

//! Sampling engine
//!
//! Wires the three domain samplers, the published store and the watchdog
//! together behind one start/stop surface.

use crate::config::ConfigSource;
use crate::monitor::{
    CpuSampler, DiskEjector, DiskSampler, DomainSampler, EjectOutcome, HealthRegistry, NetworkSampler,
    SamplerContext, Snapshot, Store, Supervisor, Watchdog,
};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

struct WatchdogTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns every sampler and exposes the published values.
pub struct Engine {
    ctx: SamplerContext,
    supervisor: Arc<Supervisor>,
    ejector: DiskEjector,
    watchdog: Mutex<Option<WatchdogTask>>,
}

impl Engine {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        let ctx = SamplerContext {
            store: Arc::new(Store::new()),
            health: Arc::new(HealthRegistry::new()),
            config,
        };
        let samplers: Vec<Arc<dyn DomainSampler>> = vec![
            Arc::new(CpuSampler::new(ctx.clone())),
            Arc::new(NetworkSampler::new(ctx.clone())),
            Arc::new(DiskSampler::new(ctx.clone())),
        ];
        Self::with_samplers(ctx, samplers)
    }

    /// Engine over an explicit sampler set.
    pub fn with_samplers(ctx: SamplerContext, samplers: Vec<Arc<dyn DomainSampler>>) -> Self {
        Self {
            supervisor: Arc::new(Supervisor::new(samplers, ctx.health.clone())),
            ejector: DiskEjector::new(ctx.clone()),
            watchdog: Mutex::new(None),
            ctx,
        }
    }

    /// Start every sampler and the watchdog. Starting twice is a no-op.
    pub async fn start(&self) {
        let mut watchdog = self.watchdog.lock().await;
        if watchdog.is_some() {
            return;
        }
        self.supervisor.start_all().await;

        let (stop, stop_rx) = watch::channel(false);
        let dog = Watchdog::new(self.ctx.health.clone(), self.supervisor.clone());
        let task = tokio::spawn(dog.run(stop_rx));
        *watchdog = Some(WatchdogTask { stop, task });
        log::info!("sampling engine started");
    }

    /// Stop the watchdog first so it cannot restart anything, then every sampler.
    pub async fn stop(&self) {
        let mut watchdog = self.watchdog.lock().await;
        let Some(WatchdogTask { stop, task }) = watchdog.take() else {
            return;
        };
        let _ = stop.send(true);
        if let Err(e) = task.await {
            log::warn!("watchdog task ended abnormally: {}", e);
        }
        self.supervisor.stop_all().await;
        log::info!("sampling engine stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.watchdog.lock().await.is_some()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.ctx.store.snapshot()
    }

    pub fn store(&self) -> Arc<Store> {
        self.ctx.store.clone()
    }

    /// Eject the volume mounted at `mount`. Failures come back in the outcome.
    pub async fn eject_disk(&self, mount: &str) -> EjectOutcome {
        self.ejector.eject(mount).await
    }
}
