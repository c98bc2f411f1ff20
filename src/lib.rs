// SPDX-License-Identifier: MPL-2.0

//! Host telemetry sampling for the system monitor.
//!
//! [`Engine`] runs one sampler per resource domain (CPU, network, disk),
//! publishes per-second rates and per-process activity into a shared
//! [`Store`](monitor::Store), and restarts any sampler that stops reporting.

pub mod config;
pub mod engine;
pub mod error;
pub mod monitor;

pub use config::{Config, ConfigSource, FileConfig, StaticConfig};
pub use engine::Engine;
pub use error::{CommandError, CommandResult, FetchError};
pub use monitor::{Domain, EjectOutcome, Metric, Snapshot};
