//! Integration tests for workspace cleanup.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use azurite_session::notify::NotificationLevel;
use azurite_session::orchestrator::{CleanOutcome, SessionEvent, SessionObserver};
use azurite_session::{Result, SessionManager};

use crate::support::{FakeLauncher, Fixture, RecordingNotifier};

/// Records, at the moment `Stopped` is delivered, whether a marker file
/// in the workspace still exists.
struct MarkerObserver {
    marker: PathBuf,
    marker_present_at_stop: Mutex<Vec<bool>>,
}

impl SessionObserver for MarkerObserver {
    fn on_session_event(&self, event: &SessionEvent) -> Result<()> {
        if matches!(event, SessionEvent::Stopped { .. }) {
            self.marker_present_at_stop
                .lock()
                .unwrap()
                .push(self.marker.exists());
        }
        Ok(())
    }
}

#[tokio::test]
async fn clean_idle_workspace_recreates_empty_directory() {
    let fixture = Fixture::new();
    let workspace = fixture.workspace();
    std::fs::write(workspace.join("__blobstorage__"), b"data").expect("write");
    std::fs::create_dir(workspace.join("nested")).expect("mkdir");

    let notifier = RecordingNotifier::new();
    let manager = SessionManager::new(FakeLauncher::with_table(), notifier.clone());

    assert_eq!(manager.clean(&workspace).await, CleanOutcome::Cleaned);

    assert!(workspace.is_dir());
    assert_eq!(std::fs::read_dir(&workspace).expect("read_dir").count(), 0);
    assert_eq!(notifier.count(NotificationLevel::Error), 0);
}

#[tokio::test]
async fn clean_missing_workspace_creates_it() {
    let fixture = Fixture::new();
    let workspace = fixture.dir.path().join("fresh");
    let manager = SessionManager::new(FakeLauncher::with_table(), RecordingNotifier::new());

    assert_eq!(manager.clean(&workspace).await, CleanOutcome::Cleaned);
    assert!(workspace.is_dir());
}

#[tokio::test]
async fn clean_stops_active_session_before_deleting() {
    let fixture = Fixture::new();
    let workspace = fixture.workspace();
    let marker = workspace.join("__azurite_db_blob__.json");
    std::fs::write(&marker, b"{}").expect("write marker");

    let launcher = FakeLauncher::with_table();
    let manager = SessionManager::new(launcher.clone(), RecordingNotifier::new());
    let observer = Arc::new(MarkerObserver {
        marker: marker.clone(),
        marker_present_at_stop: Mutex::new(Vec::new()),
    });
    manager.subscribe(observer.clone());

    assert!(manager.start(&fixture.config).await.is_started());
    assert_eq!(manager.clean(&workspace).await, CleanOutcome::Cleaned);

    assert!(!manager.is_running());
    assert_eq!(
        *observer.marker_present_at_stop.lock().unwrap(),
        vec![true],
        "session stopped before any deletion"
    );
    assert!(launcher.control(0).is_kill_requested(), "process released");
    assert!(!marker.exists());
    assert!(workspace.is_dir());
}

#[tokio::test]
async fn clean_failure_is_reported_not_raised() {
    let fixture = Fixture::new();
    let blocker = fixture.dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").expect("write");
    let workspace = blocker.join("workspace");

    let notifier = RecordingNotifier::new();
    let manager = SessionManager::new(FakeLauncher::with_table(), notifier.clone());

    let outcome = manager.clean(&workspace).await;

    assert!(matches!(outcome, CleanOutcome::Failed(_)), "got {outcome:?}");
    assert_eq!(notifier.count(NotificationLevel::Error), 1);
}
