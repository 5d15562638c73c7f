//! Crash detection and takeover.
//!
//! Heartbeat timeouts are driven with an explicit clock; coordinator
//! crashes are simulated by dropping a running controller mid-level.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use crate::fixtures::{
    fast_config, hooks_with, id, two_level_graph, wait_until, ScriptedExecutor, Step, TestRepo,
};
use weir::config::{Config, GateConfig, RemediationConfig};
use weir::core::{Task, TaskGraph};
use weir::git::GitOps;
use weir::orchestration::{LevelController, RecoveryEngine, RunOutcome};
use weir::state::{
    EventKind, LevelState, RunState, RunStatus, StateStore, TaskState, TransitionMeta,
    WorkerStatus,
};
use weir::Error;

/// Given a worker holding an in-progress task
/// When its heartbeat is older than the timeout
/// Then the worker is declared crashed, the task is released without
/// consuming a retry, and the worker's late report is refused
#[test]
fn test_heartbeat_timeout_releases_task() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::open(dir.path()).unwrap());
    store
        .create(&RunState::new("r1", two_level_graph(), "main"))
        .unwrap();
    store.transition_level(1, LevelState::Running).unwrap();
    let w = store.register_worker("c1").unwrap().id;
    store.claim_task(&id("T1"), &w).unwrap();
    store
        .transition_task(&id("T1"), TaskState::InProgress, TransitionMeta::by(&w))
        .unwrap();

    let engine = RecoveryEngine::new(store.clone(), Duration::from_secs(60));
    assert!(engine.sweep_at(Utc::now()).unwrap().is_empty());

    let later = Utc::now() + chrono::Duration::seconds(120);
    let report = engine.sweep_at(later).unwrap();
    assert_eq!(report.crashed, vec![w.clone()]);
    assert_eq!(report.released, vec![id("T1")]);
    assert!(report
        .events
        .iter()
        .any(|e| e.kind == EventKind::WorkerCrashed));

    let state = store.load().unwrap();
    let t1 = state.task(&id("T1")).unwrap();
    assert_eq!(t1.state, TaskState::Pending);
    assert_eq!(t1.retry_count, 0);
    assert!(t1.worker.is_none());
    assert_eq!(state.workers[&w].status, WorkerStatus::Crashed);

    // The crashed worker's heartbeat and completion are both rejected.
    assert!(!store.heartbeat(&w).unwrap());
    let late = store.transition_task(
        &id("T1"),
        TaskState::Completed,
        TransitionMeta::by(&w),
    );
    assert!(matches!(late, Err(Error::InvalidTaskTransition { .. })));

    // A second sweep finds nothing left to do.
    assert!(engine.sweep_at(later).unwrap().is_empty());
}

/// Given a coordinator that dies with T1 completed and T2 in progress
/// When a new coordinator resumes the run
/// Then T2 is released and re-run, T1 is not repeated, the run completes
/// with nothing left in progress and no worker branch survives
#[tokio::test]
async fn test_crash_then_resume_completes() {
    let repo = TestRepo::new();
    let config = fast_config();
    let first = Arc::new(ScriptedExecutor::new().script("T2", vec![Step::Hang]));

    let mut controller = LevelController::start(
        &repo.path,
        config.clone(),
        two_level_graph(),
        hooks_with(&first),
    )
    .unwrap();
    let store = repo.store(&config);

    tokio::select! {
        outcome = controller.run() => panic!("run finished early: {:?}", outcome),
        _ = wait_until(&store, |s| {
            s.tasks[&id("T1")].state == TaskState::Completed
                && s.tasks[&id("T2")].state == TaskState::InProgress
        }) => {}
    }
    // Dropping the controller aborts its runners without any cleanup,
    // as a killed process would.
    drop(controller);

    let crashed = repo.state(&config);
    assert_eq!(crashed.status, RunStatus::Running);
    let old_coordinator = crashed.coordinator.clone().unwrap();
    let run_id = crashed.run_id.clone();
    let git = GitOps::new(&repo.path).unwrap();
    let prefix = format!("weir/{}/worker-", run_id);
    assert!(!git.branches_with_prefix(&prefix).unwrap().is_empty());

    let second = Arc::new(ScriptedExecutor::new());
    let mut resumed =
        LevelController::resume(&repo.path, config.clone(), hooks_with(&second)).unwrap();
    assert_ne!(resumed.context().coordinator, old_coordinator);

    let recovered = repo.state(&config);
    assert_eq!(recovered.tasks[&id("T2")].state, TaskState::Pending);
    assert!(recovered
        .workers
        .values()
        .filter(|w| w.coordinator == old_coordinator)
        .all(|w| w.status != WorkerStatus::Busy && w.status != WorkerStatus::Idle));

    assert_eq!(resumed.run().await.unwrap(), RunOutcome::Completed);

    assert_eq!(first.attempts_of("T1"), 1);
    assert_eq!(second.attempts_of("T1"), 0);
    assert_eq!(second.attempts_of("T2"), 1);

    let state = repo.state(&config);
    assert_eq!(state.status, RunStatus::Completed);
    assert!(state
        .tasks
        .values()
        .all(|t| t.state == TaskState::Completed));
    assert!(state.tasks.values().all(|t| t.retry_count == 0));
    assert_eq!(repo.read("a.txt").as_deref(), Some("T3\n"));
    assert_eq!(repo.read("b.txt").as_deref(), Some("T2\n"));

    // Branches of the dead coordinator's workers are gone too.
    assert!(git.branches_with_prefix(&prefix).unwrap().is_empty());
}

/// Given a coordinator that dies during the only allowed remediation pass
/// When a new coordinator resumes the run
/// Then the level is staged again with a fresh remediation budget, the
/// fix runs and the run completes
#[tokio::test]
async fn test_resume_during_remediation_gets_fresh_budget() {
    let repo = TestRepo::new();
    let config = Config {
        gates: vec![GateConfig::new("check", "test -f fixed.txt")],
        remediation: RemediationConfig {
            enabled: true,
            max_attempts: 1,
        },
        ..fast_config()
    };
    let graph = TaskGraph::new(
        "gated",
        vec![Task::new("T1", "Create a", 1)
            .creates("a.txt")
            .verified_by("test -f a.txt")],
    );
    let first = Arc::new(ScriptedExecutor::new().script("fix-L1-check-1", vec![Step::Hang]));

    let mut controller =
        LevelController::start(&repo.path, config.clone(), graph, hooks_with(&first)).unwrap();
    let store = repo.store(&config);

    tokio::select! {
        outcome = controller.run() => panic!("run finished early: {:?}", outcome),
        _ = wait_until(&store, |s| s.levels[&1].remediation_attempts == 1) => {}
    }
    drop(controller);
    assert_eq!(repo.state(&config).levels[&1].state, LevelState::Gating);

    let second = Arc::new(
        ScriptedExecutor::new().script("fix-L1-check-1", vec![Step::Write("fixed.txt", "ok\n")]),
    );
    let mut resumed =
        LevelController::resume(&repo.path, config.clone(), hooks_with(&second)).unwrap();
    assert_eq!(resumed.run().await.unwrap(), RunOutcome::Completed);

    assert_eq!(second.attempts_of("T1"), 0);
    assert_eq!(second.attempts_of("fix-L1-check-1"), 1);
    let state = repo.state(&config);
    assert_eq!(state.levels[&1].state, LevelState::Merged);
    assert_eq!(state.levels[&1].remediation_attempts, 1);
    assert_eq!(repo.read("fixed.txt").as_deref(), Some("ok\n"));
}
