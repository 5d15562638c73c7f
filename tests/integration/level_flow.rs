//! End-to-end level execution.
//!
//! Runs are started through `LevelController::start` exactly as the CLI
//! does, with the scripted executor registered as the launcher.

use std::sync::Arc;
use std::time::Duration;

use crate::fixtures::{
    fast_config, hooks_with, id, two_level_graph, wait_until, EventLog, ScriptedExecutor, Step,
    TestRepo,
};
use weir::config::{Config, GateConfig, RemediationConfig};
use weir::orchestration::{self, HookRegistry, LevelController, LifecycleObserver, RunOutcome};
use weir::state::{Event, EventKind, LevelState, RunState, RunStatus, TaskState};

fn event_seq(state: &RunState, kind: EventKind, task: Option<&str>, level: Option<u32>) -> u64 {
    state
        .events
        .iter()
        .find(|e| {
            e.kind == kind
                && task.map_or(true, |t| e.task.as_ref().map(|id| id.as_str()) == Some(t))
                && level.map_or(true, |n| e.level == Some(n))
        })
        .unwrap_or_else(|| panic!("no {} event for {:?} {:?}", kind, task, level))
        .seq
}

struct Panicker;

impl LifecycleObserver for Panicker {
    fn name(&self) -> &str {
        "panicker"
    }

    fn on_event(&self, _event: &Event, _state: &RunState) -> weir::Result<()> {
        panic!("observer bug");
    }
}

/// Given a two-level graph and two workers
/// When the run is driven to completion
/// Then level 1 runs in parallel, level 2 starts only after level 1 merged,
/// and the baseline holds every task's output
#[tokio::test]
async fn test_two_levels_with_two_workers() {
    let repo = TestRepo::new();
    let config = fast_config();
    let executor = Arc::new(
        ScriptedExecutor::new()
            .script("T1", vec![Step::Slow(Duration::from_millis(300))])
            .script("T2", vec![Step::Slow(Duration::from_millis(300))]),
    );

    let mut controller = LevelController::start(
        &repo.path,
        config.clone(),
        two_level_graph(),
        hooks_with(&executor),
    )
    .unwrap();
    assert_eq!(controller.run().await.unwrap(), RunOutcome::Completed);

    let state = repo.state(&config);
    assert_eq!(state.status, RunStatus::Completed);
    assert!(state.levels.values().all(|l| l.state == LevelState::Merged));
    assert!(state
        .tasks
        .values()
        .all(|t| t.state == TaskState::Completed));

    // Both level-1 tasks were claimed before either finished.
    let first_done = event_seq(&state, EventKind::TaskCompleted, None, None);
    assert!(event_seq(&state, EventKind::TaskClaimed, Some("T1"), None) < first_done);
    assert!(event_seq(&state, EventKind::TaskClaimed, Some("T2"), None) < first_done);

    let level1 = event_seq(&state, EventKind::LevelComplete, None, Some(1));
    assert!(event_seq(&state, EventKind::TaskClaimed, Some("T3"), None) > level1);
    assert!(event_seq(&state, EventKind::LevelStarted, None, Some(2)) > level1);

    assert_eq!(repo.read("a.txt").as_deref(), Some("T3\n"));
    assert_eq!(repo.read("b.txt").as_deref(), Some("T2\n"));
    assert!(executor.workers_used().len() <= 2);
    assert!(state.levels[&2].merge_commit.is_some());
}

/// Given a task that always fails and max_retries = 3
/// When the run is driven
/// Then the task is attempted exactly three times, blocks, and the level
/// blocks without touching the baseline
#[tokio::test]
async fn test_retry_exhaustion_blocks_after_three_attempts() {
    let repo = TestRepo::new();
    let config = fast_config();
    let executor = Arc::new(ScriptedExecutor::new().script("T2", vec![Step::Fail(1)]));

    let mut controller = LevelController::start(
        &repo.path,
        config.clone(),
        two_level_graph(),
        hooks_with(&executor),
    )
    .unwrap();
    let outcome = controller.run().await.unwrap();
    assert!(
        matches!(outcome, RunOutcome::Blocked { level: 1, .. }),
        "outcome: {:?}",
        outcome
    );

    assert_eq!(executor.attempts_of("T2"), 3);
    assert_eq!(executor.attempts_of("T3"), 0);

    let state = repo.state(&config);
    let t2 = state.task(&id("T2")).unwrap();
    assert_eq!(t2.state, TaskState::Blocked);
    assert_eq!(t2.retry_count, 3);
    assert_eq!(t2.attempts.len(), 3);
    assert!(t2.attempts.iter().all(|a| !a.success));
    assert_eq!(state.levels[&1].state, LevelState::Blocked);
    assert!(repo.read("a.txt").is_none());

    let report = orchestration::status(&repo.path, &config).unwrap();
    assert_eq!(report.status, RunStatus::Blocked);
    let text = report.to_string();
    assert!(text.contains("level 1 blocked"), "status:\n{}", text);
}

/// Given a gate that fails until a file exists and remediation enabled
/// When the level is gated
/// Then a fix task makes the gate pass and its output lands on the
/// baseline together with the level's work
#[tokio::test]
async fn test_remediation_fixes_failing_gate() {
    let repo = TestRepo::new();
    let config = Config {
        gates: vec![GateConfig::new("check", "test -f fixed.txt")],
        remediation: RemediationConfig {
            enabled: true,
            max_attempts: 2,
        },
        ..fast_config()
    };
    let executor = Arc::new(
        ScriptedExecutor::new().script("fix-L1-check-1", vec![Step::Write("fixed.txt", "ok\n")]),
    );

    let graph = weir::core::TaskGraph::new(
        "gated",
        vec![weir::core::Task::new("T1", "Create a", 1)
            .creates("a.txt")
            .verified_by("test -f a.txt")],
    );
    let mut controller =
        LevelController::start(&repo.path, config.clone(), graph, hooks_with(&executor)).unwrap();
    assert_eq!(controller.run().await.unwrap(), RunOutcome::Completed);

    assert_eq!(executor.attempts_of("fix-L1-check-1"), 1);
    let state = repo.state(&config);
    let level = &state.levels[&1];
    assert!(level.gates_passed);
    assert_eq!(level.remediation_attempts, 1);
    assert!(level.gate_results.iter().all(|g| g.passed));
    assert_eq!(repo.read("fixed.txt").as_deref(), Some("ok\n"));
    assert_eq!(repo.read("a.txt").as_deref(), Some("T1\n"));
}

/// Given a level whose gate runs for a long time
/// When a forced stop is requested while the gate is running
/// Then the gate is cancelled, the run pauses and the baseline is untouched
#[tokio::test]
async fn test_forced_stop_interrupts_gating() {
    let repo = TestRepo::new();
    let config = Config {
        gates: vec![GateConfig::new("slow", "sleep 30")],
        ..fast_config()
    };
    let executor = Arc::new(ScriptedExecutor::new());

    let mut controller = LevelController::start(
        &repo.path,
        config.clone(),
        two_level_graph(),
        hooks_with(&executor),
    )
    .unwrap();
    let store = repo.store(&config);

    let requested = tokio::spawn(async move {
        wait_until(&store, |s| s.levels[&1].state == LevelState::Gating).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        store.request_stop(true).unwrap();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(15), controller.run())
        .await
        .expect("forced stop did not interrupt the gate")
        .unwrap();
    assert_eq!(outcome, RunOutcome::Paused { force: true });
    requested.await.unwrap();

    let state = repo.state(&config);
    assert_eq!(state.status, RunStatus::Paused);
    assert_eq!(state.levels[&1].state, LevelState::Gating);
    assert!(!state.levels[&1].gates_passed);
    assert!(state.stop_request.is_none());
    assert!(repo.read("a.txt").is_none());
}

/// Given a recording observer and an observer that panics on every event
/// When the run is driven
/// Then the run still completes and the recorder saw the lifecycle
#[tokio::test]
async fn test_observers_see_events_and_panics_are_contained() {
    let repo = TestRepo::new();
    let config = fast_config();
    let executor = Arc::new(ScriptedExecutor::new());
    let log = Arc::new(EventLog::default());

    let mut hooks: HookRegistry = hooks_with(&executor);
    hooks.add_observer(Arc::new(Panicker));
    hooks.add_observer(log.clone());

    let mut controller =
        LevelController::start(&repo.path, config.clone(), two_level_graph(), hooks).unwrap();
    assert_eq!(controller.run().await.unwrap(), RunOutcome::Completed);

    let seen = log.seen.lock().unwrap().clone();
    let kinds: Vec<EventKind> = seen.iter().map(|(_, k)| *k).collect();
    assert!(kinds.contains(&EventKind::RunStarted));
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == EventKind::LevelComplete)
            .count(),
        2
    );
    assert_eq!(kinds.last(), Some(&EventKind::RunFinished));

    // Every delivered event was persisted under the same number.
    let state = repo.state(&config);
    for (seq, kind) in &seen {
        let persisted = state.events.iter().find(|e| e.seq == *seq).unwrap();
        assert_eq!(persisted.kind, *kind);
    }
}
