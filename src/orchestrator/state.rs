//! Synchronized holder for the current [`Session`].
//!
//! Observers read concurrently; only the session manager writes, through
//! the crate-private mutators. A poisoned lock is recovered rather than
//! propagated: the session value is replaced wholesale on every write, so
//! it is never left half-updated.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::session::{ActiveSession, Session, SessionSnapshot};
use crate::process::ExitInfo;

/// Shared cell holding the current session.
#[derive(Debug, Default)]
pub struct SessionStateHolder {
    session: RwLock<Session>,
}

impl SessionStateHolder {
    /// Create a holder in the `NotStarted` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer view of the current session.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.read().snapshot()
    }

    /// Whether a session is active and its process has not exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        match &*self.read() {
            Session::NotStarted => false,
            Session::Active(active) => !active.handle().is_terminated(),
        }
    }

    /// Generation of the active session, if any.
    #[must_use]
    pub fn active_generation(&self) -> Option<u64> {
        match &*self.read() {
            Session::NotStarted => None,
            Session::Active(active) => Some(active.generation()),
        }
    }

    /// Generation and exit status of an active session whose process has
    /// already exited.
    #[must_use]
    pub fn exited_active(&self) -> Option<(u64, ExitInfo)> {
        match &*self.read() {
            Session::NotStarted => None,
            Session::Active(active) => active
                .handle()
                .exit_info()
                .map(|info| (active.generation(), info)),
        }
    }

    /// Install a new active session. Returns the session it replaced.
    pub(crate) fn activate(&self, active: ActiveSession) -> Session {
        std::mem::replace(&mut *self.write(), Session::Active(active))
    }

    /// Move back to `NotStarted`, handing out the active session if any.
    pub(crate) fn take(&self) -> Option<ActiveSession> {
        match std::mem::take(&mut *self.write()) {
            Session::NotStarted => None,
            Session::Active(active) => Some(active),
        }
    }

    /// Like [`take`](Self::take), but only if the active session has the
    /// given generation.
    pub(crate) fn take_generation(&self, generation: u64) -> Option<ActiveSession> {
        let mut guard = self.write();
        match &*guard {
            Session::Active(active) if active.generation() == generation => {
                match std::mem::take(&mut *guard) {
                    Session::Active(active) => Some(active),
                    Session::NotStarted => None,
                }
            }
            _ => None,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.session
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.session
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
