//! StateStore behaviour seen from several handles on the same directory.
//!
//! Each handle has its own in-process guard, so these tests exercise the
//! file lock and the atomic replace rather than the mutex.

use std::sync::{Arc, Barrier};
use std::thread;

use chrono::Utc;
use tempfile::TempDir;

use crate::fixtures::{id, two_level_graph};
use weir::state::{
    Attempt, Claim, LevelState, RunState, StateStore, TaskState, TransitionMeta, WorkerId,
};
use weir::Error;

fn running_run() -> (TempDir, StateStore) {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path()).unwrap();
    store
        .create(&RunState::new("r1", two_level_graph(), "main"))
        .unwrap();
    store.transition_level(1, LevelState::Running).unwrap();
    (dir, store)
}

fn failed_attempt(number: u32, worker: &WorkerId) -> Attempt {
    Attempt {
        number,
        worker: worker.clone(),
        started_at: Utc::now(),
        finished_at: Utc::now(),
        success: false,
        exit_code: Some(1),
        error: Some("verification failed".to_string()),
        output_tail: String::new(),
        artifacts: Vec::new(),
    }
}

/// Given two store handles in separate threads
/// When both claim the same task at once
/// Then exactly one claim is acquired and the loser sees the winner
#[test]
fn test_concurrent_claims_from_separate_handles() {
    let (dir, store) = running_run();
    let w1 = store.register_worker("c1").unwrap().id;
    let w2 = store.register_worker("c2").unwrap().id;

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [w1, w2]
        .into_iter()
        .map(|worker| {
            let barrier = barrier.clone();
            let path = dir.path().to_path_buf();
            thread::spawn(move || {
                let handle = StateStore::open(&path).unwrap();
                barrier.wait();
                let (claim, _) = handle.claim_task(&id("T1"), &worker).unwrap();
                (worker, claim)
            })
        })
        .collect();
    let results: Vec<(WorkerId, Claim)> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<&WorkerId> = results
        .iter()
        .filter(|(_, c)| c.is_acquired())
        .map(|(w, _)| w)
        .collect();
    assert_eq!(winners.len(), 1);
    let winner = winners[0].clone();

    let loser = results.iter().find(|(_, c)| !c.is_acquired()).unwrap();
    assert_eq!(
        loser.1,
        Claim::Conflict {
            holder: Some(winner.clone()),
            state: TaskState::Claimed,
        }
    );

    let exec = store.get_task(&id("T1")).unwrap();
    assert_eq!(exec.state, TaskState::Claimed);
    assert_eq!(exec.worker, Some(winner));
    let claimed = store
        .load()
        .unwrap()
        .events
        .iter()
        .filter(|e| e.kind == weir::state::EventKind::TaskClaimed)
        .count();
    assert_eq!(claimed, 1);
}

/// Given a level whose task is waiting for a retry
/// When the level is moved to gating
/// Then the transition is refused and nothing changes
#[test]
fn test_gating_refused_while_task_retries() {
    let (_dir, store) = running_run();
    let w = store.register_worker("c1").unwrap().id;
    store.claim_task(&id("T1"), &w).unwrap();
    store
        .transition_task(&id("T1"), TaskState::InProgress, TransitionMeta::by(&w))
        .unwrap();
    let (next, _) = store
        .record_failure(&id("T1"), &w, failed_attempt(1, &w), 3)
        .unwrap();
    assert_eq!(next, TaskState::RetryPending);

    match store.transition_level(1, LevelState::Gating) {
        Err(Error::InvalidLevelTransition { level, reason, .. }) => {
            assert_eq!(level, 1);
            assert!(reason.contains("T1 (retry_pending)"), "reason: {}", reason);
        }
        other => panic!("expected refusal, got {:?}", other),
    }
    assert_eq!(store.get_level(1).unwrap().state, LevelState::Running);
}

/// Given a level with a task blocked after exhausting its retries
/// When the level is merged without partial advance
/// Then the merge is refused; with partial advance it is allowed
#[test]
fn test_merged_refused_with_blocked_task() {
    let (_dir, store) = running_run();
    let w = store.register_worker("c1").unwrap().id;

    for attempt in 1..=3 {
        store.claim_task(&id("T1"), &w).unwrap();
        store
            .transition_task(&id("T1"), TaskState::InProgress, TransitionMeta::by(&w))
            .unwrap();
        store
            .record_failure(&id("T1"), &w, failed_attempt(attempt, &w), 3)
            .unwrap();
    }
    let t1 = store.get_task(&id("T1")).unwrap();
    assert_eq!(t1.state, TaskState::Blocked);
    assert_eq!(t1.attempts.len(), 3);

    store.claim_task(&id("T2"), &w).unwrap();
    store
        .transition_task(&id("T2"), TaskState::InProgress, TransitionMeta::by(&w))
        .unwrap();
    store
        .transition_task(
            &id("T2"),
            TaskState::Completed,
            TransitionMeta {
                worker: Some(w.clone()),
                branch: Some("weir/r1/w-1".to_string()),
                commit: Some("abc123".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    store.transition_level(1, LevelState::Gating).unwrap();
    store
        .update_level(1, |l| {
            l.gates_passed = true;
            l.merge_commit = Some("def456".to_string());
        })
        .unwrap();

    match store.transition_level(1, LevelState::Merged) {
        Err(Error::InvalidLevelTransition { reason, .. }) => {
            assert_eq!(reason, "blocked tasks: T1");
        }
        other => panic!("expected refusal, got {:?}", other),
    }

    store.update_level(1, |l| l.partial = true).unwrap();
    store.transition_level(1, LevelState::Merged).unwrap();
    assert_eq!(store.get_level(1).unwrap().state, LevelState::Merged);
}

/// Given a level that has not merged
/// When the next level is started
/// Then the transition is refused
#[test]
fn test_level_order_enforced() {
    let (_dir, store) = running_run();
    assert!(matches!(
        store.transition_level(2, LevelState::Running),
        Err(Error::InvalidLevelTransition { .. })
    ));
}

/// Given a sequence of updates through one handle
/// When the state is loaded through a fresh handle
/// Then it is identical and event numbering continues without gaps
#[test]
fn test_reload_is_equivalent() {
    let (dir, store) = running_run();
    let w = store.register_worker("c1").unwrap().id;
    store.claim_task(&id("T2"), &w).unwrap();
    store.request_stop(true).unwrap();

    let before = store.load().unwrap();
    let fresh = StateStore::open(dir.path()).unwrap();
    let after = fresh.load().unwrap();
    assert_eq!(before, after);
    assert!(after.stop_request.map(|s| s.force).unwrap_or(false));

    let seqs: Vec<u64> = after.events.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
    assert_eq!(seqs, expected);
}
