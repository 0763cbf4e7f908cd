//! Handle to a supervised child process.
//!
//! A [`ProcessHandle`] and its [`ProcessControl`] are created as a pair.
//! The handle is held by the session that owns the process; the control
//! half lives in the backend task that actually owns the OS child. The
//! handle only expresses intent (terminate, kill) and observes the exit
//! status the backend reports.
//!
//! Dropping a handle requests a hard kill, so a process can never outlive
//! the session that owns it.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; `None` when killed by a signal or unknown.
    pub code: Option<i32>,
    /// Human-readable description of the exit.
    pub reason: String,
}

impl ExitInfo {
    /// Exit information derived from an OS wait result.
    #[must_use]
    pub fn from_wait(result: &std::io::Result<std::process::ExitStatus>) -> Self {
        match result {
            Ok(status) if status.success() => Self {
                code: status.code(),
                reason: "exited normally (code 0)".to_owned(),
            },
            Ok(status) => Self {
                code: status.code(),
                reason: status.code().map_or_else(
                    || "terminated by signal".to_owned(),
                    |c| format!("exited with code {c}"),
                ),
            },
            Err(err) => Self {
                code: None,
                reason: format!("wait error: {err}"),
            },
        }
    }

    /// Exit information for a process whose status could not be observed.
    #[must_use]
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }
}

impl Display for ExitInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Cloneable waiter for a process exit.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitInfo>>,
}

impl ExitWatch {
    /// Whether the exit has been reported, or the backend is gone.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.rx.borrow().is_some() || self.rx.has_changed().is_err()
    }

    /// Wait until the process has exited.
    ///
    /// If the backend goes away without reporting, the process is treated
    /// as gone with an unknown status.
    pub async fn terminated(mut self) -> ExitInfo {
        let info = match self.rx.wait_for(Option::is_some).await {
            Ok(info) => info
                .clone()
                .unwrap_or_else(|| ExitInfo::unknown("status unknown")),
            Err(_) => ExitInfo::unknown("process monitor closed without reporting exit"),
        };
        info
    }
}

/// Session-side handle to a running process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    terminate: CancellationToken,
    kill: CancellationToken,
    exit: ExitWatch,
}

/// Backend-side half of a [`ProcessHandle`].
#[derive(Debug)]
pub struct ProcessControl {
    terminate: CancellationToken,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ExitInfo>>,
}

impl ProcessHandle {
    /// Create a connected handle/control pair for a process with `pid`.
    #[must_use]
    pub fn pair(pid: Option<u32>) -> (Self, ProcessControl) {
        let terminate = CancellationToken::new();
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        let handle = Self {
            pid,
            terminate: terminate.clone(),
            kill: kill.clone(),
            exit: ExitWatch { rx: exit_rx },
        };
        let control = ProcessControl {
            terminate,
            kill,
            exit_tx,
        };
        (handle, control)
    }

    /// Operating system process id, when known.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process has exited.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.exit.is_terminated()
    }

    /// Exit status, if the process has exited.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.rx.borrow().clone()
    }

    /// Waiter that resolves when the process exits. Outlives the handle.
    #[must_use]
    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    /// Ask the process to shut down gracefully (SIGTERM on unix).
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    /// Kill the process immediately.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Stop the process: request a graceful exit, then kill it if it is
    /// still running after `grace`.
    pub async fn stop(self, grace: Duration) -> ExitInfo {
        if let Some(info) = self.exit_info() {
            debug!(pid = ?self.pid, %info, "process already exited");
            return info;
        }

        self.terminate();
        if let Ok(info) = tokio::time::timeout(grace, self.exit.clone().terminated()).await {
            return info;
        }

        warn!(pid = ?self.pid, "process did not exit within grace period, forcing kill");
        self.kill();
        match tokio::time::timeout(grace, self.exit.clone().terminated()).await {
            Ok(info) => info,
            Err(_) => ExitInfo::unknown("process did not report exit after kill"),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

impl ProcessControl {
    /// Resolves once a graceful termination has been requested.
    pub async fn terminate_requested(&self) {
        self.terminate.cancelled().await;
    }

    /// Resolves once a hard kill has been requested.
    pub async fn kill_requested(&self) {
        self.kill.cancelled().await;
    }

    /// Whether a hard kill has been requested.
    #[must_use]
    pub fn is_kill_requested(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Publish the process exit to the handle and every [`ExitWatch`].
    pub fn report_exit(&self, info: ExitInfo) {
        self.exit_tx.send_replace(Some(info));
    }
}
