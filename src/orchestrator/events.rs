//! Session started/stopped fan-out.
//!
//! [`SessionEventPublisher`] keeps a plain list of observers and invokes
//! them synchronously: [`publish`](SessionEventPublisher::publish) returns
//! only after every observer ran. Nothing is retained, so late subscribers
//! must read the current state from the
//! [`SessionStateHolder`](super::state::SessionStateHolder).
//!
//! An observer that returns an error or panics is logged and skipped; the
//! remaining observers are still invoked.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::session::SessionInfo;
use crate::process::ExitInfo;
use crate::{AppError, Result};

/// Session lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// An emulator session became active.
    Started(SessionInfo),
    /// The active session ended.
    Stopped {
        /// Session that ended.
        session_id: String,
        /// Why it ended.
        reason: StopReason,
    },
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `stop`, `clean`, or `shutdown` was called.
    Requested,
    /// The process exited on its own.
    ProcessExited(ExitInfo),
}

impl StopReason {
    /// The error a supervisor should exit with: `None` for a requested
    /// stop, a [`AppError::Process`] when the emulator went away by itself.
    #[must_use]
    pub fn crash_error(&self) -> Option<AppError> {
        match self {
            Self::Requested => None,
            Self::ProcessExited(exit) => {
                Some(AppError::Process(format!("emulator exited: {exit}")))
            }
        }
    }
}

/// Receiver of session events.
pub trait SessionObserver: Send + Sync {
    /// Handle one event. Runs on the publishing thread; keep it short.
    ///
    /// # Errors
    ///
    /// Errors are logged by the publisher and do not affect other observers.
    fn on_session_event(&self, event: &SessionEvent) -> Result<()>;

    /// Whether this observer will never accept events again. Closed
    /// observers are dropped after the next publish.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Identifies a subscription for [`SessionEventPublisher::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Synchronous observer list.
#[derive(Default)]
pub struct SessionEventPublisher {
    observers: Mutex<Vec<(SubscriptionId, Arc<dyn SessionObserver>)>>,
    next_id: AtomicU64,
}

impl SessionEventPublisher {
    /// Create a publisher with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, observer));
        id
    }

    /// Register a channel-backed observer and return its receiving end.
    ///
    /// The observer unsubscribes itself once the receiver is dropped.
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(ChannelObserver { tx }));
        rx
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Number of registered observers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `event` to every observer before returning.
    pub fn publish(&self, event: &SessionEvent) {
        // Snapshot so observers may (un)subscribe from inside a callback.
        let observers: Vec<_> = self.lock().clone();
        let mut closed = Vec::new();

        for (id, observer) in observers {
            if observer.is_closed() {
                closed.push(id);
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| observer.on_session_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(?id, %err, "session observer failed"),
                Err(_) => warn!(?id, "session observer panicked"),
            }
        }

        if !closed.is_empty() {
            debug!(count = closed.len(), "dropping closed channel subscribers");
            self.lock().retain(|(id, _)| !closed.contains(id));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Arc<dyn SessionObserver>)>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SessionEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventPublisher")
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

/// Forwards events into an unbounded channel.
struct ChannelObserver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionObserver for ChannelObserver {
    fn on_session_event(&self, event: &SessionEvent) -> Result<()> {
        // A receiver dropped mid-publish is pruned through `is_closed`.
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
