//! `tokio::process` implementation of [`ProcessLauncher`].
//!
//! Spawned processes get `kill_on_drop(true)` and a supervisor task that
//! owns the child, forwards its output to `tracing`, and reports the exit
//! through the [`ProcessControl`] half of the handle.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{
    CapturedOutput, ExitInfo, LaunchFuture, LaunchSpec, ProcessControl, ProcessHandle,
    ProcessLauncher,
};
use crate::{AppError, Result};

/// Launcher backed by real operating system processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

impl TokioLauncher {
    fn command(spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).envs(&spec.env).kill_on_drop(true);
        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl ProcessLauncher for TokioLauncher {
    fn spawn<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a, ProcessHandle> {
        Box::pin(async move {
            let mut cmd = Self::command(spec);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut child = cmd.spawn().map_err(|err| {
                AppError::Spawn(format!("failed to spawn {}: {err}", spec.program.display()))
            })?;

            let pid = child.id();
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(forward_output(stdout, pid, "stdout"));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(forward_output(stderr, pid, "stderr"));
            }

            info!(pid = pid.unwrap_or(0), program = %spec.program.display(), "process spawned");

            let (handle, control) = ProcessHandle::pair(pid);
            tokio::spawn(supervise(child, control));
            Ok(handle)
        })
    }

    fn run_captured<'a>(
        &'a self,
        spec: &'a LaunchSpec,
        timeout: Duration,
    ) -> LaunchFuture<'a, CapturedOutput> {
        Box::pin(async move {
            let mut cmd = Self::command(spec);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let child = cmd.spawn().map_err(|err| {
                AppError::Probe(format!("failed to run {}: {err}", spec.program.display()))
            })?;

            // Dropping the timed-out future drops the child, and
            // `kill_on_drop` takes care of the process.
            let output = tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| AppError::Probe(format!("timed out after {timeout:?}")))?
                .map_err(|err| AppError::Probe(format!("failed to collect output: {err}")))?;

            Ok(CapturedOutput {
                code: output.status.code(),
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Own the child until it exits, honouring terminate and kill requests.
async fn supervise(mut child: Child, control: ProcessControl) {
    let pid = child.id();
    let mut signalled = false;

    let result = loop {
        tokio::select! {
            status = child.wait() => break status,
            () = control.kill_requested() => {
                if let Err(err) = child.kill().await {
                    warn!(pid = pid.unwrap_or(0), %err, "failed to kill process");
                }
                break child.wait().await;
            }
            () = control.terminate_requested(), if !signalled => {
                signalled = true;
                if let Err(err) = send_terminate(&mut child) {
                    warn!(pid = pid.unwrap_or(0), %err, "graceful terminate failed, killing");
                    if let Err(err) = child.start_kill() {
                        warn!(pid = pid.unwrap_or(0), %err, "failed to kill process");
                    }
                }
            }
        }
    };

    let info = ExitInfo::from_wait(&result);
    info!(pid = pid.unwrap_or(0), status = %info, "process exited");
    control.report_exit(info);
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(());
    };
    let raw = i32::try_from(pid)
        .map_err(|err| AppError::Process(format!("pid {pid} out of range: {err}")))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
        .map_err(|err| AppError::Process(format!("failed to send SIGTERM to {pid}: {err}")))
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> Result<()> {
    child
        .start_kill()
        .map_err(|err| AppError::Process(format!("failed to terminate process: {err}")))
}

async fn forward_output<R>(stream: R, pid: Option<u32>, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(pid = pid.unwrap_or(0), stream = name, "{line}"),
            Ok(None) => break,
            Err(err) => {
                debug!(pid = pid.unwrap_or(0), stream = name, %err, "output stream closed");
                break;
            }
        }
    }
}
