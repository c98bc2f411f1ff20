// SPDX-License-Identifier: MPL-2.0

//! Monitor module organization

pub mod attribution;
pub mod command;
pub mod delta;
pub mod fetcher;
pub mod schedule;
pub mod store;
pub mod supervisor;
pub mod watchdog;

pub mod cpu;
pub mod disk;
pub mod network;

pub use attribution::{AttributionTracker, ProcessActivity, ProcessSample};
pub use command::run_command;
pub use fetcher::{HttpLookup, Reachability, ResilientFetcher, RouteCheck};
pub use store::{DiskInfo, Domain, Metric, Snapshot, Store};
pub use supervisor::{DomainSampler, SamplerContext, Supervisor};
pub use watchdog::{HealthRegistry, Watchdog};

pub use cpu::CpuSampler;
pub use disk::{DiskEjector, DiskSampler, EjectOutcome};
pub use network::NetworkSampler;
