//! Child process spawning and supervision.
//!
//! The [`ProcessLauncher`] trait decouples the session manager from the
//! operating system. [`TokioLauncher`] is the production implementation;
//! tests substitute their own launcher to simulate spawns and exits.
//!
//! Submodules:
//! - `handle`: [`ProcessHandle`] and its backend half [`ProcessControl`].
//! - `launcher`: [`TokioLauncher`], built on `tokio::process`.

pub mod handle;
pub mod launcher;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

pub use handle::{ExitInfo, ExitWatch, ProcessControl, ProcessHandle};
pub use launcher::TokioLauncher;

use crate::Result;

/// Everything needed to start a process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments, excluding the program itself.
    pub args: Vec<String>,
    /// Variables added on top of the inherited environment.
    pub env: HashMap<String, String>,
    /// Working directory; inherited when `None`.
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Launch description for running `program` with `args` and nothing else.
    #[must_use]
    pub fn command(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|&a| a.to_owned()).collect(),
            ..Self::default()
        }
    }
}

/// Output of a process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Whether the process exited successfully.
    pub success: bool,
    /// Captured standard output, lossily decoded.
    pub stdout: String,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
}

/// Boxed future returned by [`ProcessLauncher`] methods.
pub type LaunchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Interface between the session manager and the process spawning primitive.
pub trait ProcessLauncher: Send + Sync {
    /// Start a long-running, supervised process.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`](crate::AppError::Spawn) if the operating
    /// system refuses to start the process.
    fn spawn<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a, ProcessHandle>;

    /// Run a short-lived process to completion, capturing its output.
    ///
    /// The process is killed if it has not exited within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Probe`](crate::AppError::Probe) on spawn failure,
    /// I/O failure, or timeout.
    fn run_captured<'a>(
        &'a self,
        spec: &'a LaunchSpec,
        timeout: Duration,
    ) -> LaunchFuture<'a, CapturedOutput>;
}
