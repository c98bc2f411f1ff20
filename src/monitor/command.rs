// SPDX-License-Identifier: MPL-2.0

//! External command gateway
//!
//! Every diagnostic tool (`ps`, `nettop`, `ioreg`, `nvidia-smi`, `diskutil`, ...)
//! is run through [`run_command`], which bounds it in time and converts every
//! failure into a [`CommandError`]. The gateway knows nothing about what the
//! output means; parsing lives next to each sampler.
//!
//! The wait runs on the tokio runtime, so a slow tool only stalls the loop
//! that invoked it.

use crate::error::{CommandError, CommandResult};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// Time a timed-out process gets between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// Run `program` with `args`, returning its stdout if it exits cleanly within `timeout`.
pub async fn run_command(program: impl AsRef<Path>, args: &[&str], timeout: Duration) -> CommandResult {
    let program = program.as_ref();
    let name = program.display().to_string();

    let result = execute(program, &name, args, timeout).await;
    if let Err(e) = &result {
        match e {
            CommandError::NotFound(_) => log::debug!("{}", e),
            _ => log::warn!("{}", e),
        }
    }
    result
}

async fn execute(program: &Path, name: &str, args: &[&str], timeout: Duration) -> CommandResult {
    if !program.exists() {
        return Err(CommandError::NotFound(name.to_owned()));
    }

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so helpers the tool leaves behind can be signalled too.
    #[cfg(unix)]
    command.process_group(0);
    let mut child = command.spawn().map_err(|e| spawn_error(name, e))?;
    let pid = child.id();

    // Drain both pipes concurrently so a chatty tool never blocks on a full pipe.
    let mut stdout = tokio::spawn(drain(child.stdout.take()));
    let mut stderr = tokio::spawn(drain(child.stderr.take()));

    // The budget covers the drains as well: a backgrounded helper holding the
    // pipe open must not outlive the timeout.
    let finished = tokio::time::timeout(timeout, async {
        let status = child.wait().await;
        let out = (&mut stdout).await.unwrap_or_default();
        let err = (&mut stderr).await.unwrap_or_default();
        (status, out, err)
    })
    .await;

    let (status, stdout, stderr) = match finished {
        Ok((status, out, err)) => (status.map_err(|e| spawn_error(name, e))?, out, err),
        Err(_) => {
            stdout.abort();
            stderr.abort();
            terminate(&mut child, pid).await;
            return Err(CommandError::Timeout {
                program: name.to_owned(),
                timeout,
            });
        }
    };

    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr).trim().to_owned();
        let stderr = if stderr.is_empty() {
            format!("{} failed without diagnostics", name)
        } else {
            stderr
        };
        return Err(CommandError::NonZeroExit {
            program: name.to_owned(),
            code: status.code(),
            stderr,
        });
    }

    String::from_utf8(stdout).map_err(|_| CommandError::NoOutput(name.to_owned()))
}

fn spawn_error(name: &str, e: std::io::Error) -> CommandError {
    CommandError::Spawn {
        program: name.to_owned(),
        reason: e.to_string(),
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            log::debug!("pipe read failed: {}", e);
        }
    }
    buf
}

/// SIGTERM to the whole process group, then SIGKILL after [`KILL_GRACE`].
async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        if signal_group(pid, Signal::Terminate) {
            let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
        }
        signal_group(pid, Signal::Kill);
    }
    if let Ok(None) = child.try_wait() {
        log::debug!("process ignored SIGTERM, killing");
        if let Err(e) = child.kill().await {
            log::debug!("kill failed: {}", e);
        }
    }
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: Signal) -> bool {
    let signal = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) on the process group created for a child we spawned.
    unsafe { libc::kill(-(pgid as libc::pid_t), signal) == 0 }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: Signal) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const SH: &str = "/bin/sh";

    #[tokio::test]
    async fn captures_stdout() {
        let out = run_command(SH, &["-c", "echo hello"], Duration::from_secs(5)).await;
        assert_eq!(out.as_deref(), Ok("hello\n"));
    }

    #[tokio::test]
    async fn missing_executable_is_not_found() {
        let out = run_command("/nonexistent/tool", &[], Duration::from_secs(5)).await;
        assert!(matches!(out, Err(CommandError::NotFound(_))));
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let out = run_command(SH, &["-c", "echo broken >&2; exit 3"], Duration::from_secs(5)).await;
        match out {
            Err(CommandError::NonZeroExit { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_failure_gets_synthesized_message() {
        let out = run_command(SH, &["-c", "exit 1"], Duration::from_secs(5)).await;
        match out {
            Err(CommandError::NonZeroExit { stderr, .. }) => assert!(stderr.contains("failed")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let started = std::time::Instant::now();
        let out = run_command(SH, &["-c", "sleep 10"], Duration::from_millis(200)).await;
        assert!(matches!(out, Err(CommandError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn backgrounded_helper_cannot_outlive_timeout() {
        let started = std::time::Instant::now();
        let out = run_command(SH, &["-c", "sleep 4 & echo hi"], Duration::from_millis(500)).await;
        assert!(matches!(out, Err(CommandError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn undecodable_stdout_is_no_output() {
        let out = run_command(SH, &["-c", "printf '\\377\\376'"], Duration::from_secs(5)).await;
        assert!(matches!(out, Err(CommandError::NoOutput(_))));
    }
}
