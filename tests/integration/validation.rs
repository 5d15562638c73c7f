//! Task graph validation through the public entry points.
//!
//! Graphs are written to disk as JSON, the way a planner would hand them
//! over, and must be rejected before any run state or worktree exists.

use crate::fixtures::{fast_config, two_level_graph, TestRepo};
use weir::core::{Task, TaskGraph};
use weir::orchestration::{HookRegistry, LevelController};
use weir::Error;

fn write_graph(repo: &TestRepo, json: &str) -> std::path::PathBuf {
    let path = repo.temp_dir.path().join("graph.json");
    std::fs::write(&path, json).unwrap();
    path
}

/// Given a graph file with two level-1 tasks that both create `shared.rs`
/// When the graph is loaded
/// Then loading fails naming both tasks and the file
#[test]
fn test_ownership_overlap_rejected_from_file() {
    let repo = TestRepo::new();
    let path = write_graph(
        &repo,
        r#"{
            "feature": "overlap",
            "tasks": [
                {"id": "T1", "title": "one", "level": 1,
                 "files": {"create": ["shared.rs"]},
                 "verification": {"command": "true"}},
                {"id": "T2", "title": "two", "level": 1,
                 "files": {"modify": ["shared.rs"]},
                 "verification": {"command": "true"}}
            ]
        }"#,
    );

    match TaskGraph::load(&path) {
        Err(Error::Graph(errors)) => {
            assert!(
                errors.contains(&"level 1: tasks T1 and T2 both own shared.rs".to_string()),
                "errors: {:?}",
                errors
            );
        }
        other => panic!("expected graph error, got {:?}", other),
    }
}

/// Given a three-task dependency cycle
/// When validated
/// Then the cycle is reported as a closed path
#[test]
fn test_three_task_cycle_reported_as_path() {
    let graph = TaskGraph::new(
        "cycle",
        vec![
            Task::new("T1", "a", 2)
                .with_dependencies(&["T3"])
                .verified_by("true"),
            Task::new("T2", "b", 2)
                .with_dependencies(&["T1"])
                .verified_by("true"),
            Task::new("T3", "c", 2)
                .with_dependencies(&["T2"])
                .verified_by("true"),
        ],
    );

    let report = graph.validate();
    assert!(!report.ok);
    let cycles: Vec<&String> = report
        .errors
        .iter()
        .filter(|e| e.starts_with("dependency cycle: "))
        .collect();
    assert_eq!(cycles.len(), 1, "errors: {:?}", report.errors);
    let path = cycles[0].trim_start_matches("dependency cycle: ");
    let nodes: Vec<&str> = path.split(" -> ").collect();
    assert_eq!(nodes.len(), 4);
    assert_eq!(nodes.first(), nodes.last());
    for id in ["T1", "T2", "T3"] {
        assert!(nodes.contains(&id), "{} missing from {}", id, path);
    }
}

/// Given tasks that reference a missing dependency and omit the
/// integration test for declared consumers
/// When validated
/// Then each problem is reported separately
#[test]
fn test_dangling_references_and_missing_integration_test() {
    let mut graph = two_level_graph();
    graph.tasks[2].dependencies.push("T9".into());
    graph.tasks[0].consumers.push("T3".into());

    let report = graph.validate();
    assert!(!report.ok);
    assert!(report
        .errors
        .contains(&"task T3: unknown dependency T9".to_string()));
    assert!(report
        .errors
        .contains(&"task T1: has consumers but no integration_test".to_string()));
}

/// Given a graph file with missing fields
/// When parsed
/// Then parsing succeeds and validation lists every schema problem
#[test]
fn test_missing_fields_reach_the_validator() {
    let repo = TestRepo::new();
    let path = write_graph(
        &repo,
        r#"{"feature": "sparse", "tasks": [{"id": "T1", "level": 0}]}"#,
    );

    let graph = TaskGraph::from_file(&path).unwrap();
    let report = graph.validate();
    assert!(!report.ok);
    assert!(report.errors.iter().any(|e| e.contains("missing title")));
    assert!(report
        .errors
        .iter()
        .any(|e| e.contains("missing verification command")));
}

/// Given an invalid graph
/// When a run is started
/// Then no state file is written
#[test]
fn test_invalid_graph_creates_no_run() {
    let repo = TestRepo::new();
    let config = fast_config();
    let mut graph = two_level_graph();
    graph.tasks[1].files.create.push("a.txt".into());

    let result = LevelController::start(&repo.path, config.clone(), graph, HookRegistry::new());
    assert!(matches!(result, Err(Error::Graph(_))));
    assert!(!config
        .state_dir(&repo.path)
        .join("state.json")
        .exists());
}
