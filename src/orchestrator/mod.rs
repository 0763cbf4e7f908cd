//! Emulator session orchestration.
//!
//! Covers the session lifecycle manager, the shared state holder, the
//! started/stopped event publisher, and emulator feature detection.

pub mod events;
pub mod manager;
pub mod probe;
pub mod state;

pub use events::{
    SessionEvent, SessionEventPublisher, SessionObserver, StopReason, SubscriptionId,
};
pub use manager::{CleanOutcome, SessionManager, StartOutcome};
pub use probe::EmulatorFeatures;
pub use state::SessionStateHolder;
