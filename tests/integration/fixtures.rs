//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - A scripted task executor
//! - Predefined task graphs and fast configs

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use git2::{Repository, Signature};
use tempfile::TempDir;

use weir::config::Config;
use weir::core::{Task, TaskGraph, TaskId};
use weir::orchestration::{
    ExecutionResult, HookRegistry, LifecycleObserver, TaskExecutor, WorkerContext,
};
use weir::state::{Event, EventKind, RunState, StateStore, WorkerId};

/// A test repository on `main` with one commit.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        let repo = Repository::init(&path).expect("Failed to init git");
        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test User", "test@test.com").unwrap();
        let commit = repo
            .commit(None, &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();
        let commit = repo.find_commit(commit).unwrap();
        repo.branch("main", &commit, true).unwrap();
        repo.set_head("refs/heads/main").unwrap();

        Self { temp_dir, path }
    }

    pub fn read(&self, file: &str) -> Option<String> {
        std::fs::read_to_string(self.path.join(file)).ok()
    }

    /// Store over the repository's state directory.
    pub fn store(&self, config: &Config) -> StateStore {
        StateStore::open(&config.state_dir(&self.path)).unwrap()
    }

    pub fn state(&self, config: &Config) -> RunState {
        self.store(config).load().unwrap()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// What the scripted executor does on one attempt.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write every owned file, then succeed.
    Create,
    /// Write the given file, then succeed.
    Write(&'static str, &'static str),
    Fail(i32),
    /// Sleep, then behave like `Create`.
    Slow(Duration),
    /// Block until cancelled.
    Hang,
}

/// Executor driven by per-task scripts. Attempt `n` uses the `n`th step,
/// the last one once the script runs out, and `Create` when unscripted.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    calls: Mutex<Vec<(String, String, u32)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, task: &str, steps: Vec<Step>) -> Self {
        self.scripts.lock().unwrap().insert(task.to_string(), steps);
        self
    }

    pub fn attempts_of(&self, task: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == task)
            .count()
    }

    pub fn workers_used(&self) -> Vec<String> {
        let mut workers: Vec<String> = self
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, w, _)| w.clone())
            .collect();
        workers.sort();
        workers.dedup();
        workers
    }

    fn step(&self, task: &TaskId, attempt: u32) -> Step {
        let scripts = self.scripts.lock().unwrap();
        match scripts.get(task.as_str()) {
            Some(steps) if !steps.is_empty() => {
                let idx = (attempt as usize).saturating_sub(1).min(steps.len() - 1);
                steps[idx].clone()
            }
            _ => Step::Create,
        }
    }
}

fn write_owned(task: &Task, workdir: &Path) -> weir::Result<()> {
    for path in task.files.create.iter().chain(task.files.modify.iter()) {
        std::fs::write(workdir.join(path), format!("{}\n", task.id))?;
    }
    Ok(())
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, task: &Task, ctx: &WorkerContext) -> weir::Result<ExecutionResult> {
        self.calls.lock().unwrap().push((
            task.id.to_string(),
            ctx.worker.to_string(),
            ctx.attempt,
        ));
        match self.step(&task.id, ctx.attempt) {
            Step::Create => {
                write_owned(task, &ctx.workdir)?;
                Ok(ExecutionResult::success())
            }
            Step::Write(file, content) => {
                std::fs::write(ctx.workdir.join(file), content)?;
                Ok(ExecutionResult::success())
            }
            Step::Fail(code) => Ok(ExecutionResult::failure(code, "scripted failure")),
            Step::Slow(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancel.cancelled() => {
                        return Err(weir::Error::Executor("cancelled".to_string()));
                    }
                }
                write_owned(task, &ctx.workdir)?;
                Ok(ExecutionResult::success())
            }
            Step::Hang => {
                ctx.cancel.cancelled().await;
                Err(weir::Error::Executor("cancelled".to_string()))
            }
        }
    }
}

/// Records every event it sees, in order.
#[derive(Default)]
pub struct EventLog {
    pub seen: Mutex<Vec<(u64, EventKind)>>,
}

impl LifecycleObserver for EventLog {
    fn name(&self) -> &str {
        "event-log"
    }

    fn on_event(&self, event: &Event, _state: &RunState) -> weir::Result<()> {
        self.seen.lock().unwrap().push((event.seq, event.kind));
        Ok(())
    }
}

/// Hooks whose launcher is `executor`.
pub fn hooks_with(executor: &Arc<ScriptedExecutor>) -> HookRegistry {
    let mut hooks = HookRegistry::new();
    hooks.set_launcher(executor.clone());
    hooks
}

/// Short timings so tests finish quickly.
pub fn fast_config() -> Config {
    Config {
        max_workers: 2,
        heartbeat_interval_secs: 1,
        heartbeat_timeout_secs: 30,
        poll_interval_ms: 20,
        ..Default::default()
    }
}

/// Level 1: T1 creates `a.txt`, T2 creates `b.txt`.
/// Level 2: T3 modifies `a.txt` and depends on T1.
pub fn two_level_graph() -> TaskGraph {
    TaskGraph::new(
        "two-level",
        vec![
            Task::new("T1", "Create a", 1)
                .creates("a.txt")
                .verified_by("test -f a.txt"),
            Task::new("T2", "Create b", 1)
                .creates("b.txt")
                .verified_by("test -f b.txt"),
            Task::new("T3", "Extend a", 2)
                .with_dependencies(&["T1"])
                .modifies("a.txt")
                .verified_by("grep T3 a.txt"),
        ],
    )
}

pub fn id(s: &str) -> TaskId {
    TaskId::from(s)
}

pub fn worker(s: &str) -> WorkerId {
    WorkerId::from(s)
}

/// Poll the state file until `cond` holds, failing after ten seconds.
pub async fn wait_until(store: &StateStore, cond: impl Fn(&RunState) -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(state) = store.load() {
                if cond(&state) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within 10s");
}
