//! Integration tests for the session lifecycle manager.
//!
//! Drives `start`, `stop`, external exits, and shutdown against the fake
//! launcher and checks state, events, and notifications.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use azurite_session::models::session::SessionSnapshot;
use azurite_session::notify::NotificationLevel;
use azurite_session::orchestrator::{
    SessionEvent, SessionObserver, SessionStateHolder, StartOutcome, StopReason,
};
use azurite_session::{Result, SessionManager};

use crate::support::{
    eventually, FakeLauncher, Fixture, ProbeBehavior, RecordingNotifier, RecordingObserver,
};

fn manager(launcher: &Arc<FakeLauncher>) -> (SessionManager, Arc<RecordingNotifier>) {
    let notifier = RecordingNotifier::new();
    let manager = SessionManager::new(launcher.clone(), notifier.clone());
    (manager, notifier)
}

// ── Start ────────────────────────────────────────────────────

#[tokio::test]
async fn start_activates_session_and_publishes_started_once() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    let outcome = manager.start(&fixture.config).await;

    let StartOutcome::Started(info) = outcome else {
        panic!("expected Started, got {outcome:?}");
    };
    assert!(manager.is_running());
    assert_eq!(info.workspace, fixture.workspace());
    assert_eq!(info.pid, Some(4000));
    assert_eq!(manager.snapshot(), SessionSnapshot::Active(info.clone()));
    assert_eq!(observer.events(), vec![SessionEvent::Started(info)]);
    assert_eq!(launcher.spawn_count(), 1);
}

#[tokio::test]
async fn start_while_active_is_a_warning_noop() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    let first = manager.start(&fixture.config).await;
    let before = manager.snapshot();

    for _ in 0..3 {
        assert_eq!(manager.start(&fixture.config).await, StartOutcome::AlreadyRunning);
    }

    assert!(first.is_started());
    assert_eq!(manager.snapshot(), before, "active session is never replaced");
    assert_eq!(launcher.spawn_count(), 1);
    assert_eq!(observer.started_count(), 1);
    assert_eq!(notifier.count(NotificationLevel::Warning), 3);
    assert!(!launcher.control(0).is_kill_requested(), "running session is not interrupted");
}

#[tokio::test]
async fn concurrent_starts_spawn_exactly_one_process() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    launcher.set_spawn_delay(Duration::from_millis(50));
    let (manager, _notifier) = manager(&launcher);

    let (a, b) = tokio::join!(manager.start(&fixture.config), manager.start(&fixture.config));

    let started = [&a, &b].iter().filter(|o| o.is_started()).count();
    assert_eq!(started, 1, "outcomes: {a:?}, {b:?}");
    assert!(a == StartOutcome::AlreadyRunning || b == StartOutcome::AlreadyRunning);
    assert_eq!(launcher.spawn_count(), 1);
}

#[tokio::test]
async fn concurrent_starts_from_separate_tasks_spawn_one_process() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    launcher.set_spawn_delay(Duration::from_millis(50));
    let (manager, _notifier) = manager(&launcher);

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            let config = fixture.config.clone();
            tokio::spawn(async move { manager.start(&config).await })
        })
        .collect();

    let mut started = 0;
    for task in tasks {
        if task.await.expect("start task").is_started() {
            started += 1;
        }
    }
    assert_eq!(started, 1);
    assert_eq!(launcher.spawn_count(), 1);
}

#[tokio::test]
async fn missing_executable_rejects_without_state_change() {
    let mut fixture = Fixture::new();
    fixture.config.executable_path = fixture.dir.path().join("no-such-azurite");
    let launcher = FakeLauncher::with_table();
    let (manager, notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    let outcome = manager.start(&fixture.config).await;

    let StartOutcome::Rejected(reason) = outcome else {
        panic!("expected Rejected, got {outcome:?}");
    };
    assert!(reason.contains("executable not found"), "reason: {reason}");
    assert!(!manager.is_running());
    assert_eq!(manager.snapshot(), SessionSnapshot::NotStarted);
    assert_eq!(notifier.count(NotificationLevel::Warning), 1);
    assert!(observer.events().is_empty());
    assert_eq!(launcher.probe_count(), 0);
    assert_eq!(launcher.spawn_count(), 0);
}

#[tokio::test]
async fn bare_command_name_is_not_resolved_on_path() {
    let mut fixture = Fixture::new();
    fixture.config.executable_path = "sh".into();
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);

    let outcome = manager.start(&fixture.config).await;

    assert!(
        matches!(outcome, StartOutcome::Rejected(ref reason) if reason.contains("executable not found")),
        "got {outcome:?}"
    );
    assert_eq!(launcher.spawn_count(), 0);
}

#[tokio::test]
async fn missing_workspace_rejects_without_state_change() {
    let mut fixture = Fixture::new();
    fixture.config.workspace_path = fixture.dir.path().join("no-such-workspace");
    let launcher = FakeLauncher::with_table();
    let (manager, notifier) = manager(&launcher);

    let outcome = manager.start(&fixture.config).await;

    assert!(matches!(outcome, StartOutcome::Rejected(ref r) if r.contains("workspace not found")));
    assert!(!manager.is_running());
    assert_eq!(notifier.count(NotificationLevel::Warning), 1);
    assert_eq!(launcher.spawn_count(), 0);
}

#[tokio::test]
async fn probe_timeout_starts_without_optional_flags() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::new(ProbeBehavior::Hang);
    let (manager, _notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    let outcome = manager.start(&fixture.config).await;

    assert!(outcome.is_started(), "got {outcome:?}");
    assert!(manager.is_running());
    let args = launcher.spec(0).args;
    assert!(!args.iter().any(|a| a == "--tableHost"), "args: {args:?}");
    assert!(args.iter().any(|a| a == "--blobPort"));

    let events = observer.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        SessionEvent::Started(info) => assert_eq!(info.workspace, fixture.workspace()),
        other => panic!("expected Started, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_probe_starts_without_optional_flags() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::new(ProbeBehavior::Fail);
    let (manager, _notifier) = manager(&launcher);

    assert!(manager.start(&fixture.config).await.is_started());
    assert!(!launcher.spec(0).args.iter().any(|a| a == "--tableHost"));
}

#[tokio::test]
async fn supported_table_storage_adds_table_flags() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);

    assert!(manager.start(&fixture.config).await.is_started());

    let spec = launcher.spec(0);
    assert!(spec.args.iter().any(|a| a == "--tableHost"));
    assert_eq!(spec.program, fixture.config.executable_path);
    assert_eq!(spec.working_dir, Some(fixture.workspace()));
}

#[tokio::test]
async fn spawn_failure_leaves_not_started() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    launcher.fail_spawns();
    let (manager, notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    let outcome = manager.start(&fixture.config).await;

    assert!(matches!(outcome, StartOutcome::SpawnFailed(ref r) if r.contains("permission denied")));
    assert!(!manager.is_running());
    assert!(observer.events().is_empty());
    assert_eq!(notifier.count(NotificationLevel::Error), 1);

    // The in-progress flag was released: a later start is attempted again.
    let again = manager.start(&fixture.config).await;
    assert!(matches!(again, StartOutcome::SpawnFailed(_)));
}

#[tokio::test]
async fn cancelled_start_changes_nothing() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = manager.start_with_cancel(&fixture.config, &cancel).await;

    assert_eq!(outcome, StartOutcome::Cancelled);
    assert!(!manager.is_running());
    assert!(observer.events().is_empty());
    assert_eq!(launcher.spawn_count(), 0);

    assert!(manager.start(&fixture.config).await.is_started());
}

#[tokio::test]
async fn cancellation_during_probe_aborts_before_spawn() {
    let mut fixture = Fixture::new();
    fixture.config.probe_timeout_ms = 200;
    let launcher = FakeLauncher::new(ProbeBehavior::Hang);
    let (manager, _notifier) = manager(&launcher);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let outcome = manager.start_with_cancel(&fixture.config, &cancel).await;

    assert_eq!(outcome, StartOutcome::Cancelled);
    assert_eq!(launcher.probe_count(), 1);
    assert_eq!(launcher.spawn_count(), 0);
    assert!(!manager.is_running());
}

// ── Stop ─────────────────────────────────────────────────────

#[tokio::test]
async fn stop_ends_session_and_publishes_stopped() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    let StartOutcome::Started(info) = manager.start(&fixture.config).await else {
        panic!("start failed");
    };
    assert!(manager.stop().await);

    assert!(!manager.is_running());
    assert_eq!(manager.snapshot(), SessionSnapshot::NotStarted);
    assert_eq!(
        observer.events().last(),
        Some(&SessionEvent::Stopped {
            session_id: info.id,
            reason: StopReason::Requested,
        })
    );
    assert_eq!(observer.stopped_count(), 1);

    // Give the exit watcher a chance to run; it must not publish again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(observer.stopped_count(), 1);
    assert!(!manager.is_running());
}

#[tokio::test]
async fn stop_when_idle_is_a_noop() {
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    assert!(!manager.stop().await);
    assert!(observer.events().is_empty());
}

#[tokio::test]
async fn start_after_stop_creates_new_session() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);

    let StartOutcome::Started(first) = manager.start(&fixture.config).await else {
        panic!("first start failed");
    };
    manager.stop().await;
    let StartOutcome::Started(second) = manager.start(&fixture.config).await else {
        panic!("second start failed");
    };

    assert_ne!(first.id, second.id);
    assert_eq!(launcher.spawn_count(), 2);
    assert!(manager.is_running());
}

#[tokio::test]
async fn start_is_refused_until_stopped_process_exits() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    launcher.ignore_terminate();
    let (manager, notifier) = manager(&launcher);

    assert!(manager.start(&fixture.config).await.is_started());

    let stopping = manager.clone();
    let stopper = tokio::spawn(async move { stopping.stop().await });
    assert!(
        eventually(Duration::from_secs(1), || !manager.snapshot().is_active()).await,
        "stop took the session"
    );

    // The first process is still inside its grace period.
    assert!(!launcher.control(0).is_kill_requested());
    assert_eq!(
        manager.start(&fixture.config).await,
        StartOutcome::AlreadyRunning
    );
    assert_eq!(launcher.spawn_count(), 1);
    assert_eq!(notifier.count(NotificationLevel::Warning), 1);

    assert!(stopper.await.unwrap());
    assert!(launcher.control(0).is_kill_requested());

    assert!(manager.start(&fixture.config).await.is_started());
    assert_eq!(launcher.spawn_count(), 2);
}

#[tokio::test]
async fn second_stop_waits_for_the_same_exit() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    launcher.ignore_terminate();
    let (manager, _notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    assert!(manager.start(&fixture.config).await.is_started());

    let stopping = manager.clone();
    let stopper = tokio::spawn(async move { stopping.stop().await });
    assert!(eventually(Duration::from_secs(1), || !manager.snapshot().is_active()).await);

    assert!(!manager.stop().await);
    assert!(
        launcher.control(0).is_kill_requested(),
        "returned only after the process was killed"
    );
    assert!(stopper.await.unwrap());
    assert_eq!(observer.stopped_count(), 1);
}

// ── External termination ─────────────────────────────────────

#[tokio::test]
async fn external_exit_stops_session_exactly_once() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());
    let mut events = manager.events().subscribe_channel();

    assert!(manager.start(&fixture.config).await.is_started());
    launcher.exit_process(0, 1);

    let stopped = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(SessionEvent::Stopped { reason, .. }) = events.recv().await {
                return reason;
            }
        }
    })
    .await
    .expect("stopped event within bounded time");

    match stopped {
        StopReason::ProcessExited(info) => assert_eq!(info.code, Some(1)),
        StopReason::Requested => panic!("exit was not requested"),
    }
    assert!(!manager.is_running());
    assert_eq!(manager.snapshot(), SessionSnapshot::NotStarted);
    assert_eq!(observer.stopped_count(), 1);
    assert!(notifier.messages().iter().any(|m| m.contains("exited with code 1")));

    // A later explicit stop finds nothing to do and publishes nothing.
    assert!(!manager.stop().await);
    assert_eq!(observer.stopped_count(), 1);
}

#[tokio::test]
async fn is_running_is_false_as_soon_as_process_exits() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);

    assert!(manager.start(&fixture.config).await.is_started());
    launcher.exit_process(0, 0);

    assert!(!manager.is_running(), "handle termination is visible immediately");
    assert!(
        eventually(Duration::from_secs(2), || manager.snapshot() == SessionSnapshot::NotStarted)
            .await
    );
}

#[tokio::test]
async fn start_after_external_exit_succeeds() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    assert!(manager.start(&fixture.config).await.is_started());
    launcher.exit_process(0, 1);

    // Restart immediately, possibly before the watcher has run.
    assert!(manager.start(&fixture.config).await.is_started());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(manager.is_running());
    assert_eq!(observer.stopped_count(), 1, "old session stopped exactly once");
    assert_eq!(observer.started_count(), 2);
    assert!(matches!(observer.events()[1], SessionEvent::Stopped { .. }));
}

// ── Observers ────────────────────────────────────────────────

/// Reads the shared state from inside its callback.
struct StateReadingObserver {
    state: Arc<SessionStateHolder>,
    seen: Mutex<Vec<bool>>,
}

impl SessionObserver for StateReadingObserver {
    fn on_session_event(&self, _event: &SessionEvent) -> Result<()> {
        self.seen.lock().unwrap().push(self.state.snapshot().is_active());
        Ok(())
    }
}

#[tokio::test]
async fn observers_see_state_consistent_with_event() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);
    let observer = Arc::new(StateReadingObserver {
        state: Arc::clone(manager.state()),
        seen: Mutex::new(Vec::new()),
    });
    manager.subscribe(observer.clone());

    manager.start(&fixture.config).await;
    manager.stop().await;

    assert_eq!(*observer.seen.lock().unwrap(), vec![true, false]);
}

struct PanickingObserver;

impl SessionObserver for PanickingObserver {
    fn on_session_event(&self, _event: &SessionEvent) -> Result<()> {
        panic!("view crashed");
    }
}

#[tokio::test]
async fn panicking_observer_does_not_corrupt_state() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);
    manager.subscribe(Arc::new(PanickingObserver));
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    assert!(manager.start(&fixture.config).await.is_started());
    assert!(manager.is_running());
    assert!(manager.stop().await);
    assert!(!manager.is_running());
    assert_eq!(observer.started_count(), 1);
    assert_eq!(observer.stopped_count(), 1);
}

// ── Teardown ─────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_stops_active_session() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    manager.start(&fixture.config).await;
    manager.shutdown().await;

    assert!(!manager.is_running());
    assert_eq!(observer.stopped_count(), 1);
    assert!(launcher.control(0).is_kill_requested());
}

#[tokio::test]
async fn start_after_shutdown_is_rejected() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, notifier) = manager(&launcher);

    manager.shutdown().await;
    let outcome = manager.start(&fixture.config).await;

    assert!(
        matches!(outcome, StartOutcome::Rejected(ref reason) if reason.contains("shut down")),
        "got {outcome:?}"
    );
    assert_eq!(launcher.spawn_count(), 0);
    assert_eq!(launcher.probe_count(), 0);
    assert_eq!(notifier.count(NotificationLevel::Warning), 1);
    assert_eq!(manager.snapshot(), SessionSnapshot::NotStarted);
}

#[tokio::test]
async fn shutdown_during_start_abandons_the_new_process() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    launcher.set_spawn_delay(Duration::from_millis(100));
    let (manager, _notifier) = manager(&launcher);
    let observer = RecordingObserver::new();
    manager.subscribe(observer.clone());

    let starting = manager.clone();
    let config = fixture.config.clone();
    let start = tokio::spawn(async move { starting.start(&config).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.shutdown().await;

    assert_eq!(start.await.unwrap(), StartOutcome::Cancelled);
    assert!(!manager.is_running());
    assert!(observer.events().is_empty());
    assert!(launcher.control(0).is_kill_requested());
}

#[tokio::test]
async fn dropping_manager_kills_process() {
    let fixture = Fixture::new();
    let launcher = FakeLauncher::with_table();
    let (manager, _notifier) = manager(&launcher);

    assert!(manager.start(&fixture.config).await.is_started());
    let control = launcher.control(0);
    assert!(!control.is_kill_requested());

    drop(manager);

    assert!(control.is_kill_requested());
}
