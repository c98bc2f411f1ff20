// SPDX-License-Identifier: MPL-2.0

//! Sampler lifecycle: start, stop and restart of each domain's task set.
//!
//! Stopping first flips the sampler's stop signal. Loops wake from their sleep
//! at once; a loop caught inside a slow step (an external tool, a process scan)
//! checks the signal again before publishing and drops that tick's result. The
//! supervisor then waits briefly for the loops to exit and aborts any that did
//! not. The loop state is owned by the tasks themselves, so it is only
//! dropped once the tasks are gone.

use super::store::{Domain, Store};
use super::watchdog::HealthRegistry;
use crate::config::ConfigSource;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Delay between stopping a stale sampler and starting it again.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);
/// How long stopped loops get to exit on their own before being aborted.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Shared handles every domain sampler needs.
#[derive(Clone)]
pub struct SamplerContext {
    pub store: Arc<Store>,
    pub health: Arc<HealthRegistry>,
    pub config: Arc<dyn ConfigSource>,
}

/// One resource domain's set of loops.
pub trait DomainSampler: Send + Sync {
    fn id(&self) -> Domain;

    /// Spawn this domain's loops with fresh state. Every loop must exit once
    /// `stop` turns `true`.
    fn spawn(&self, stop: watch::Receiver<bool>) -> Vec<JoinHandle<()>>;
}

struct Running {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    async fn halt(mut self) {
        let _ = self.stop.send(true);
        let exited = tokio::time::timeout(STOP_GRACE, join_all(self.tasks.iter_mut())).await;
        if exited.is_err() {
            for task in &self.tasks {
                task.abort();
            }
            let pending = self.tasks.iter_mut().filter(|t| !t.is_finished());
            join_all(pending).await;
        }
    }
}

struct Slot {
    sampler: Arc<dyn DomainSampler>,
    running: Option<Running>,
    restarts: u32,
}

struct Slots {
    by_id: HashMap<Domain, Slot>,
    accepting: bool,
}

/// Owns every sampler and its running tasks.
pub struct Supervisor {
    slots: Mutex<Slots>,
    health: Arc<HealthRegistry>,
    restart_delay: Duration,
}

impl Supervisor {
    pub fn new(samplers: Vec<Arc<dyn DomainSampler>>, health: Arc<HealthRegistry>) -> Self {
        Self::with_restart_delay(samplers, health, RESTART_DELAY)
    }

    pub fn with_restart_delay(samplers: Vec<Arc<dyn DomainSampler>>, health: Arc<HealthRegistry>, restart_delay: Duration) -> Self {
        let by_id = samplers
            .into_iter()
            .map(|sampler| {
                let slot = Slot {
                    sampler: sampler.clone(),
                    running: None,
                    restarts: 0,
                };
                (sampler.id(), slot)
            })
            .collect();
        Self {
            slots: Mutex::new(Slots { by_id, accepting: true }),
            health,
            restart_delay,
        }
    }

    pub async fn start_all(&self) {
        let mut slots = self.slots.lock().await;
        slots.accepting = true;
        for (id, slot) in slots.by_id.iter_mut() {
            if slot.running.is_none() {
                slot.running = Some(self.launch(*id, slot));
            }
        }
    }

    pub async fn stop_all(&self) {
        let stopping: Vec<(Domain, Running)> = {
            let mut slots = self.slots.lock().await;
            slots.accepting = false;
            slots
                .by_id
                .iter_mut()
                .filter_map(|(id, slot)| slot.running.take().map(|r| (*id, r)))
                .collect()
        };
        for (id, running) in stopping {
            running.halt().await;
            self.health.forget(id);
            log::info!("{} sampler stopped", id);
        }
    }

    /// Stop `id`, wait the restart delay, and start it again with fresh state.
    pub async fn restart(&self, id: Domain) {
        let running = {
            let mut slots = self.slots.lock().await;
            slots.by_id.get_mut(&id).and_then(|slot| slot.running.take())
        };
        if let Some(running) = running {
            running.halt().await;
        }
        self.health.forget(id);

        tokio::time::sleep(self.restart_delay).await;

        let mut slots = self.slots.lock().await;
        if !slots.accepting {
            return;
        }
        if let Some(slot) = slots.by_id.get_mut(&id) {
            if slot.running.is_none() {
                slot.restarts += 1;
                slot.running = Some(self.launch(id, slot));
            }
        }
    }

    pub async fn is_running(&self, id: Domain) -> bool {
        let slots = self.slots.lock().await;
        slots.by_id.get(&id).is_some_and(|slot| slot.running.is_some())
    }

    pub async fn restarts(&self, id: Domain) -> u32 {
        let slots = self.slots.lock().await;
        slots.by_id.get(&id).map_or(0, |slot| slot.restarts)
    }

    fn launch(&self, id: Domain, slot: &Slot) -> Running {
        let (stop, stop_rx) = watch::channel(false);
        // A freshly started sampler gets one full interval before it can be stale.
        self.health.record_success(id);
        let tasks = slot.sampler.spawn(stop_rx);
        log::info!("{} sampler started", id);
        Running { stop, tasks }
    }
}
