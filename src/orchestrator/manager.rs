//! Emulator session lifecycle: start, stop, clean.
//!
//! [`SessionManager`] is the only writer of the
//! [`SessionStateHolder`]. Every transition (start, stop, process exit)
//! runs under one transition lock that also covers the event publish, so
//! observers never see a state change without its event or the reverse.
//!
//! At most one emulator process is alive. A second `start` while a
//! session is running, while another start is still probing/spawning, or
//! while a stopped session's process has not exited yet, is a no-op that
//! warns the user.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::events::{
    SessionEvent, SessionEventPublisher, SessionObserver, StopReason, SubscriptionId,
};
use super::probe::probe_features;
use super::state::SessionStateHolder;
use crate::config::AzuriteConfig;
use crate::models::session::{ActiveSession, Session, SessionInfo, SessionSnapshot};
use crate::notify::{Notification, Notifier};
use crate::process::{ExitInfo, ExitWatch, ProcessLauncher};
use crate::{AppError, Result};

const NOTIFICATION_TITLE: &str = "Azurite";

/// Grace period used until a configuration supplies one.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Result of [`SessionManager::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session is active.
    Started(SessionInfo),
    /// A session is already running or starting; nothing was done.
    AlreadyRunning,
    /// A preflight check failed; nothing was done.
    Rejected(String),
    /// The caller cancelled before the process was spawned.
    Cancelled,
    /// The operating system refused to start the process.
    SpawnFailed(String),
}

impl StartOutcome {
    /// Whether a new session was started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

/// Result of [`SessionManager::clean`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    /// The workspace was emptied and recreated.
    Cleaned,
    /// Deleting or recreating the workspace failed.
    Failed(String),
}

/// Owner of the emulator session.
///
/// Cheap to clone; clones share the same session. Dropping the last clone
/// kills a still-running emulator.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    launcher: Arc<dyn ProcessLauncher>,
    notifier: Arc<dyn Notifier>,
    state: Arc<SessionStateHolder>,
    events: Arc<SessionEventPublisher>,
    starting: AtomicBool,
    generation: AtomicU64,
    transition: Mutex<()>,
    /// Exit watch of a process taken by `stop` that may still be alive.
    stopping: Mutex<Option<ExitWatch>>,
    stop_grace: Mutex<Duration>,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Create a manager with no active session.
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher,
                notifier,
                state: Arc::new(SessionStateHolder::new()),
                events: Arc::new(SessionEventPublisher::new()),
                starting: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                transition: Mutex::new(()),
                stopping: Mutex::new(None),
                stop_grace: Mutex::new(DEFAULT_STOP_GRACE),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Read access to the session state, for observers.
    #[must_use]
    pub fn state(&self) -> &Arc<SessionStateHolder> {
        &self.inner.state
    }

    /// The event publisher, for subscribing observers.
    #[must_use]
    pub fn events(&self) -> &Arc<SessionEventPublisher> {
        &self.inner.events
    }

    /// Shorthand for `events().subscribe(observer)`.
    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> SubscriptionId {
        self.inner.events.subscribe(observer)
    }

    /// Whether a session is active and its process is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.state.is_running()
    }

    /// Observer view of the current session.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.snapshot()
    }

    /// Start an emulator session. See [`start_with_cancel`](Self::start_with_cancel).
    pub async fn start(&self, config: &AzuriteConfig) -> StartOutcome {
        self.start_with_cancel(config, &CancellationToken::new())
            .await
    }

    /// Start an emulator session unless one is already running.
    ///
    /// Checks that the executable and workspace exist, probes the
    /// executable for optional features, then spawns it. `cancel` is
    /// honoured up to the spawn; a cancelled start changes nothing.
    pub async fn start_with_cancel(
        &self,
        config: &AzuriteConfig,
        cancel: &CancellationToken,
    ) -> StartOutcome {
        let span = info_span!("start_session", workspace = %config.workspace_path.display());
        self.start_inner(config, cancel).instrument(span).await
    }

    async fn start_inner(&self, config: &AzuriteConfig, cancel: &CancellationToken) -> StartOutcome {
        if self.inner.shutdown.is_cancelled() {
            return self.reject("the session manager is shut down".to_owned());
        }

        let Some(_starting) = StartingGuard::acquire(&self.inner.starting) else {
            return self.already_running("a start is already in progress");
        };

        if let Some((generation, exit)) = self.inner.state.exited_active() {
            // The watcher has not caught up yet; finish the old session first.
            self.inner.finish_exited(generation, exit);
        }
        if let Some(reason) = self.inner.busy_reason() {
            return self.already_running(reason);
        }

        if let Err(reason) = preflight(config).await {
            return self.reject(reason);
        }

        if cancel.is_cancelled() {
            info!("start cancelled before feature probe");
            return StartOutcome::Cancelled;
        }

        let features = probe_features(
            self.inner.launcher.as_ref(),
            &config.executable_path,
            config.probe_timeout(),
        )
        .await;

        if cancel.is_cancelled() {
            info!("start cancelled before spawn");
            return StartOutcome::Cancelled;
        }

        let spec = config.launch_spec(features);
        let handle = match self.inner.launcher.spawn(&spec).await {
            Ok(handle) => handle,
            Err(err) => {
                let reason = err.to_string();
                warn!(%reason, "failed to start emulator");
                self.inner.notifier.notify(Notification::error(
                    NOTIFICATION_TITLE,
                    format!("Failed to start Azurite: {reason}"),
                ));
                return StartOutcome::SpawnFailed(reason);
            }
        };

        *lock(&self.inner.stop_grace) = config.stop_grace();

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let exit = handle.exit_watch();
        let active = ActiveSession::new(generation, handle, config.workspace_path.clone());
        let info = active.info();

        {
            let _transition = self.inner.transition();
            if self.inner.shutdown.is_cancelled() {
                // Shut down while probing or spawning; `handle` is dropped
                // with `active` and the process is killed.
                info!("start abandoned, session manager shut down");
                return StartOutcome::Cancelled;
            }
            if let Session::Active(previous) = self.inner.state.activate(active) {
                warn!(session_id = previous.id(), "replaced a session that was still recorded as active");
            }
            self.inner.events.publish(&SessionEvent::Started(info.clone()));
        }

        self.spawn_exit_watcher(generation, exit);

        info!(
            session_id = info.id,
            pid = info.pid.unwrap_or(0),
            table = features.table,
            "emulator session started"
        );
        self.inner.notifier.notify(Notification::info(
            NOTIFICATION_TITLE,
            format!("Azurite started in {}", config.workspace_path.display()),
        ));

        StartOutcome::Started(info)
    }

    /// Stop the active session. Returns `false` if nothing was running.
    ///
    /// The state is `NotStarted` and `Stopped` has been published before
    /// the process is asked to exit. The call returns once the process has
    /// exited, and `start` is refused until then. A `stop` racing another
    /// one waits for the same exit and returns `false`.
    pub async fn stop(&self) -> bool {
        let taken = {
            let _transition = self.inner.transition();
            match self.inner.state.take() {
                Some(active) => {
                    *lock(&self.inner.stopping) = Some(active.handle().exit_watch());
                    self.inner.events.publish(&SessionEvent::Stopped {
                        session_id: active.id().to_owned(),
                        reason: StopReason::Requested,
                    });
                    Ok(active)
                }
                None => Err(lock(&self.inner.stopping).clone()),
            }
        };

        let active = match taken {
            Ok(active) => active,
            Err(Some(pending)) if !pending.is_terminated() => {
                debug!("stop requested while a previous stop is in progress");
                pending.terminated().await;
                return false;
            }
            Err(_) => {
                debug!("stop requested with no active session");
                return false;
            }
        };

        let session_id = active.id().to_owned();
        let grace = *lock(&self.inner.stop_grace);
        let exit = active.into_handle().stop(grace).await;
        info!(session_id, status = %exit, "emulator session stopped");
        true
    }

    /// Stop the active session, if any, then delete and recreate `workspace`.
    ///
    /// Failures are reported to the user and returned as
    /// [`CleanOutcome::Failed`]; they never escape as errors.
    pub async fn clean(&self, workspace: &Path) -> CleanOutcome {
        let span = info_span!("clean_workspace", workspace = %workspace.display());
        async {
            if self.stop().await {
                info!("stopped running session before cleaning");
            }

            let dir = workspace.to_path_buf();
            let result = tokio::task::spawn_blocking(move || reset_directory(&dir))
                .await
                .map_err(|err| AppError::Io(format!("cleanup task failed: {err}")))
                .and_then(|res| res);

            match result {
                Ok(()) => {
                    info!("workspace cleaned");
                    self.inner.notifier.notify(Notification::info(
                        NOTIFICATION_TITLE,
                        format!("Cleaned {}", workspace.display()),
                    ));
                    CleanOutcome::Cleaned
                }
                Err(err) => {
                    let reason = err.to_string();
                    warn!(%reason, "workspace cleanup failed");
                    self.inner.notifier.notify(Notification::error(
                        NOTIFICATION_TITLE,
                        format!("Failed to clean {}: {reason}", workspace.display()),
                    ));
                    CleanOutcome::Failed(reason)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Stop the active session and end all background watchers.
    ///
    /// Later `start` calls are rejected.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.stop().await;
        info!("session manager shut down");
    }

    fn already_running(&self, reason: &str) -> StartOutcome {
        warn!(reason, "start ignored");
        self.inner.notifier.notify(Notification::warning(
            NOTIFICATION_TITLE,
            format!("Azurite was not started: {reason}"),
        ));
        StartOutcome::AlreadyRunning
    }

    fn reject(&self, reason: String) -> StartOutcome {
        warn!(%reason, "start rejected");
        self.inner
            .notifier
            .notify(Notification::warning(NOTIFICATION_TITLE, reason.clone()));
        StartOutcome::Rejected(reason)
    }

    fn spawn_exit_watcher(&self, generation: u64, exit: ExitWatch) {
        let inner = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    info = exit.terminated() => {
                        if let Some(inner) = Weak::upgrade(&inner) {
                            inner.finish_exited(generation, info);
                        }
                    }
                    () = shutdown.cancelled() => {
                        debug!(generation, "exit watcher cancelled");
                    }
                }
            }
            .instrument(info_span!("exit_watcher", generation)),
        );
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn transition(&self) -> MutexGuard<'_, ()> {
        lock(&self.transition)
    }

    /// Why a new process must not be spawned right now, if anything.
    fn busy_reason(&self) -> Option<&'static str> {
        let _transition = self.transition();
        if self.state.active_generation().is_some() {
            return Some("the emulator is already running");
        }
        let stopping = lock(&self.stopping);
        if stopping.as_ref().is_some_and(|exit| !exit.is_terminated()) {
            return Some("the previous emulator is still stopping");
        }
        None
    }

    /// Move an externally terminated session to `NotStarted`, once.
    fn finish_exited(&self, generation: u64, exit: ExitInfo) {
        let _transition = self.transition();
        let Some(active) = self.state.take_generation(generation) else {
            debug!(generation, "session already ended");
            return;
        };

        let session_id = active.id().to_owned();
        drop(active);

        warn!(session_id, status = %exit, "emulator process exited");
        let message = format!("Azurite stopped: {exit}");
        self.events.publish(&SessionEvent::Stopped {
            session_id,
            reason: StopReason::ProcessExited(exit),
        });
        self.notifier
            .notify(Notification::warning(NOTIFICATION_TITLE, message));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Holds the "start in progress" flag for the duration of one start.
struct StartingGuard<'a>(&'a AtomicBool);

impl<'a> StartingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Checks that must pass before anything is spawned. The error is the
/// user-facing reason.
async fn preflight(config: &AzuriteConfig) -> std::result::Result<(), String> {
    if !path_exists(&config.executable_path).await {
        return Err(format!(
            "Azurite executable not found: {}",
            config.executable_path.display()
        ));
    }
    if !path_exists(&config.workspace_path).await {
        return Err(format!(
            "Azurite workspace not found: {}",
            config.workspace_path.display()
        ));
    }
    Ok(())
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn reset_directory(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(AppError::Io(format!(
                "failed to delete {}: {err}",
                dir.display()
            )))
        }
    }
    std::fs::create_dir_all(dir)
        .map_err(|err| AppError::Io(format!("failed to create {}: {err}", dir.display())))
}
