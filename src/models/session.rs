//! Emulator session model.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::process::ProcessHandle;

/// Current emulator session, as held by the session manager.
#[derive(Debug, Default)]
pub enum Session {
    /// No emulator process is running.
    #[default]
    NotStarted,
    /// An emulator process is running.
    Active(ActiveSession),
}

impl Session {
    /// Whether the session is in the `Active` state.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// Observer view of this session.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        match self {
            Self::NotStarted => SessionSnapshot::NotStarted,
            Self::Active(active) => SessionSnapshot::Active(active.info()),
        }
    }
}

/// A running emulator session. Owns the process handle.
#[derive(Debug)]
pub struct ActiveSession {
    id: String,
    generation: u64,
    handle: ProcessHandle,
    workspace: PathBuf,
    started_at: DateTime<Utc>,
}

impl ActiveSession {
    /// Wrap a freshly spawned process into a session.
    #[must_use]
    pub fn new(generation: u64, handle: ProcessHandle, workspace: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            generation,
            handle,
            workspace,
            started_at: Utc::now(),
        }
    }

    /// Unique session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Manager-assigned sequence number, unique per manager.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The emulator process.
    #[must_use]
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Workspace directory the emulator was started with.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// When the process was spawned.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Give up the session, handing over its process handle.
    #[must_use]
    pub fn into_handle(self) -> ProcessHandle {
        self.handle
    }

    /// Read-only description for observers.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            pid: self.handle.pid(),
            workspace: self.workspace.clone(),
            started_at: self.started_at,
        }
    }
}

/// Read-only description of an active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: String,
    /// Emulator process id, when known.
    pub pid: Option<u32>,
    /// Workspace directory.
    pub workspace: PathBuf,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
}

/// Observer view of the session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionSnapshot {
    /// No emulator process is running.
    NotStarted,
    /// An emulator process is running.
    Active(SessionInfo),
}

impl SessionSnapshot {
    /// Whether the snapshot describes a running session.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// Workspace of the running session, if any.
    #[must_use]
    pub fn workspace(&self) -> Option<&Path> {
        match self {
            Self::NotStarted => None,
            Self::Active(info) => Some(&info.workspace),
        }
    }
}
