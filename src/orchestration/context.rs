//! Shared handles for one coordinator driving one run.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::git::GitOps;
use crate::orchestration::executor::{CommandExecutor, TaskExecutor};
use crate::orchestration::hooks::HookRegistry;
use crate::state::{Event, StateStore, WorkerId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Everything the dispatcher, gates and merge steps share.
pub struct RunContext {
    pub repo: PathBuf,
    pub config: Config,
    pub run_id: String,
    /// Identifies this coordinator process in worker records.
    pub coordinator: String,
    pub store: Arc<StateStore>,
    pub git: GitOps,
    pub hooks: Arc<HookRegistry>,
    pub executor: Arc<dyn TaskExecutor>,
    /// Parent of every worker's cancellation token.
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Directory holding this run's worktrees.
    pub fn worktree_root(&self) -> PathBuf {
        self.config.worktree_dir(&self.repo).join(&self.run_id)
    }

    pub fn staging_workdir(&self) -> PathBuf {
        self.worktree_root().join("staging")
    }

    pub fn worker_branch(&self, worker: &WorkerId) -> String {
        format!("weir/{}/{}", self.run_id, worker)
    }

    /// Common prefix of every worker branch of this run, whichever
    /// coordinator created it.
    pub fn worker_branch_prefix(&self) -> String {
        format!("weir/{}/worker-", self.run_id)
    }

    /// Where task descriptions are written for the built-in launcher.
    pub fn task_dir(&self) -> PathBuf {
        self.config.state_dir(&self.repo).join("tasks")
    }

    /// Hand persisted events to the lifecycle observers.
    pub fn notify(&self, events: &[Event]) {
        if events.is_empty() || !self.hooks.has_observers() {
            return;
        }
        match self.store.load() {
            Ok(state) => {
                for event in events {
                    self.hooks.emit(event, &state);
                }
            }
            Err(e) => warn!(error = %e, "could not load state for observers"),
        }
    }
}

/// Pick the launcher: a registered hook wins over the configured command.
pub fn resolve_executor(
    config: &Config,
    hooks: &HookRegistry,
    task_dir: &Path,
) -> Result<Arc<dyn TaskExecutor>> {
    if let Some(launcher) = hooks.launcher() {
        return Ok(launcher);
    }
    match &config.executor.command {
        Some(command) => Ok(Arc::new(CommandExecutor::new(
            &config.executor.shell,
            command,
            task_dir,
        )?)),
        None => Err(Error::Config(
            "no executor configured: set executor.command in .weir/weir.toml".to_string(),
        )),
    }
}
