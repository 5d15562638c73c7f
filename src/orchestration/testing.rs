//! Fixtures for orchestration unit tests.

use crate::config::Config;
use crate::core::{Task, TaskGraph, TaskId};
use crate::error::{Error, Result};
use crate::git::GitOps;
use crate::orchestration::context::RunContext;
use crate::orchestration::executor::{ExecutionResult, TaskExecutor, WorkerContext};
use crate::orchestration::hooks::HookRegistry;
use crate::state::{RunState, StateStore, WorkerId};
use async_trait::async_trait;
use git2::{Repository, Signature};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Initialise a repository on `main` with one commit.
pub fn init_repo(path: &Path) -> GitOps {
    let repo = Repository::init(path).unwrap();
    fs::write(path.join("README.md"), "# test\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("Test", "test@test.com").unwrap();
    let commit = repo
        .commit(None, &sig, &sig, "Initial commit", &tree, &[])
        .unwrap();
    let commit = repo.find_commit(commit).unwrap();
    repo.branch("main", &commit, true).unwrap();
    repo.set_head("refs/heads/main").unwrap();
    GitOps::new(path).unwrap()
}

/// What the scripted executor does on one attempt.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Write every file the task creates or modifies, then succeed.
    Create,
    /// Write the given files, then succeed.
    Write(Vec<(String, String)>),
    Fail(i32),
    /// Behave like `Create` and declare the given artifacts.
    Declare(Vec<String>),
    /// Sleep, then behave like `Create`.
    Slow(Duration),
    /// Block until cancelled.
    Hang,
}

/// Executor driven by per-task scripts. Attempt `n` uses the `n`th
/// behaviour, the last one once the script runs out, and `Create` for
/// unscripted tasks.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<TaskId, Vec<Behaviour>>>,
    calls: Mutex<Vec<(TaskId, WorkerId, u32)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, task: &str, behaviours: Vec<Behaviour>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(TaskId::from(task), behaviours);
        self
    }

    pub fn calls(&self) -> Vec<(TaskId, WorkerId, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts_of(&self, task: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(id, _, _)| id.as_str() == task)
            .count()
    }

    fn behaviour(&self, task: &TaskId, attempt: u32) -> Behaviour {
        let scripts = self.scripts.lock().unwrap();
        match scripts.get(task) {
            Some(list) if !list.is_empty() => {
                let idx = (attempt as usize).saturating_sub(1).min(list.len() - 1);
                list[idx].clone()
            }
            _ => Behaviour::Create,
        }
    }
}

fn write_owned(task: &Task, workdir: &Path) -> Result<()> {
    for path in task.files.create.iter().chain(task.files.modify.iter()) {
        let full = workdir.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, format!("{}\n", task.id))?;
    }
    Ok(())
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, task: &Task, ctx: &WorkerContext) -> Result<ExecutionResult> {
        self.calls
            .lock()
            .unwrap()
            .push((task.id.clone(), ctx.worker.clone(), ctx.attempt));

        match self.behaviour(&task.id, ctx.attempt) {
            Behaviour::Create => {
                write_owned(task, &ctx.workdir)?;
                Ok(ExecutionResult::success())
            }
            Behaviour::Write(files) => {
                for (path, content) in files {
                    fs::write(ctx.workdir.join(path), content)?;
                }
                Ok(ExecutionResult::success())
            }
            Behaviour::Fail(code) => Ok(ExecutionResult::failure(code, "scripted failure")),
            Behaviour::Declare(artifacts) => {
                write_owned(task, &ctx.workdir)?;
                Ok(ExecutionResult {
                    artifacts: artifacts.into_iter().map(PathBuf::from).collect(),
                    ..ExecutionResult::success()
                })
            }
            Behaviour::Slow(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancel.cancelled() => {
                        return Err(Error::Executor("cancelled".to_string()));
                    }
                }
                write_owned(task, &ctx.workdir)?;
                Ok(ExecutionResult::success())
            }
            Behaviour::Hang => {
                ctx.cancel.cancelled().await;
                Err(Error::Executor("cancelled".to_string()))
            }
        }
    }
}

/// A repository with a created run, ready to dispatch.
pub struct TestRun {
    pub dir: TempDir,
    pub ctx: Arc<RunContext>,
    pub executor: Arc<ScriptedExecutor>,
}

impl TestRun {
    pub fn new(tasks: Vec<Task>, config: Config, executor: ScriptedExecutor) -> Self {
        Self::with_hooks(tasks, config, executor, HookRegistry::new())
    }

    pub fn with_hooks(
        tasks: Vec<Task>,
        config: Config,
        executor: ScriptedExecutor,
        hooks: HookRegistry,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let git = init_repo(dir.path());
        let store = Arc::new(StateStore::open(&config.state_dir(dir.path())).unwrap());
        let graph = TaskGraph::new("feature", tasks);
        store.create(&RunState::new("r1", graph, "main")).unwrap();

        let executor = Arc::new(executor);
        let ctx = Arc::new(RunContext {
            repo: dir.path().to_path_buf(),
            config,
            run_id: "r1".to_string(),
            coordinator: "coord-test".to_string(),
            store,
            git,
            hooks: Arc::new(hooks),
            executor: executor.clone(),
            cancel: CancellationToken::new(),
        });
        Self { dir, ctx, executor }
    }

    pub fn state(&self) -> RunState {
        self.ctx.store.load().unwrap()
    }
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
