// SPDX-License-Identifier: MPL-2.0

//! Error taxonomy for external commands and network lookups.
//!
//! Neither error type ever escapes a sampler loop: each is logged where it
//! happens and turned into "no update this cycle".

use std::time::Duration;
use thiserror::Error;

/// Failure of a bounded external command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The executable does not exist at the given path.
    #[error("executable not found: {0}")]
    NotFound(String),

    /// The executable exists but could not be started.
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// The process did not exit within its time budget and was terminated.
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// The process exited with a non-zero status.
    #[error("{program} exited with status {code:?}: {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Clean exit, but stdout was not valid UTF-8 text.
    #[error("{0} produced no decodable output")]
    NoOutput(String),
}

/// Result of one command gateway call: captured stdout or a tagged failure.
pub type CommandResult = Result<String, CommandError>;

/// Failure of the WAN address lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The reachability signal reported no usable network path.
    #[error("network unreachable")]
    Unreachable,

    /// Transport-level failure (connect, timeout, HTTP status).
    #[error("transport error from {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    /// The endpoint answered with something that is not an IP address.
    #[error("implausible address from {endpoint}: {body:?}")]
    InvalidResponse { endpoint: String, body: String },

    /// Every endpoint failed every retry.
    #[error("all endpoints exhausted")]
    Exhausted,
}
