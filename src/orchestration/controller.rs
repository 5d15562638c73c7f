//! Level controller.
//!
//! Drives a run level by level: start the level, dispatch its tasks until
//! every one is completed or blocked, stage and gate the integrated output,
//! then merge it into the baseline before the next level may start. A
//! blocked level halts the run with the blocking tasks or gates recorded; a
//! stop request pauses it so `resume` can continue from the state file.
//!
//! The free functions at the bottom are the control operations used by the
//! CLI. They only touch the state file, so they work whether or not a
//! coordinator is running.

use crate::config::Config;
use crate::core::{TaskGraph, TaskId};
use crate::error::{Error, Result};
use crate::git::GitOps;
use crate::orchestration::context::{resolve_executor, RunContext};
use crate::orchestration::dispatcher::{DispatchOutcome, WorkerDispatcher};
use crate::orchestration::gates::{GateResult, GateRunner};
use crate::orchestration::hooks::HookRegistry;
use crate::orchestration::merge::MergeCoordinator;
use crate::orchestration::recovery::RecoveryEngine;
use crate::state::{
    Event, EventKind, LevelState, RunState, RunStatus, StateStore, TaskState, TransitionMeta,
    WorkerRecord, WorkerStatus,
};
use crate::util;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a call to [`LevelController::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every level merged.
    Completed,
    /// Stopped on request; resumable.
    Paused { force: bool },
    /// A level is blocked and needs manual intervention.
    Blocked { level: u32, reason: String },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "run completed"),
            RunOutcome::Paused { force: true } => write!(f, "run paused (forced)"),
            RunOutcome::Paused { force: false } => write!(f, "run paused"),
            RunOutcome::Blocked { level, reason } => {
                write!(f, "level {} blocked: {}", level, reason)
            }
        }
    }
}

enum LevelStep {
    Merged,
    Paused { force: bool },
    Blocked { reason: String },
}

pub struct LevelController {
    ctx: Arc<RunContext>,
    dispatcher: WorkerDispatcher,
    gates: GateRunner,
    merger: MergeCoordinator,
}

impl LevelController {
    /// Validate `graph` and create a new run over it.
    ///
    /// Refuses when an unfinished run already exists in the state directory.
    pub fn start(repo: &Path, config: Config, graph: TaskGraph, hooks: HookRegistry) -> Result<Self> {
        config.validate()?;
        graph.validate().into_result()?;

        let git = GitOps::new(repo)?;
        let baseline = match &config.baseline_branch {
            Some(branch) => branch.clone(),
            None => git.current_branch()?,
        };
        git.branch_head(&baseline)?;
        ignore_weir_dir(git.repo_path())?;

        let store = Arc::new(StateStore::open(&config.state_dir(git.repo_path()))?);
        let run_id = util::short_id();
        store.create(&RunState::new(&run_id, graph, &baseline))?;
        info!(run = %run_id, baseline = %baseline, "run created");

        let ctx = build_context(git, config, store, run_id, hooks)?;
        Ok(Self::from_context(ctx))
    }

    /// Take over the run recorded in the state directory.
    ///
    /// Claims held by workers of any previous coordinator are released and
    /// their leftover worktrees removed.
    pub fn resume(repo: &Path, config: Config, hooks: HookRegistry) -> Result<Self> {
        config.validate()?;
        let git = GitOps::new(repo)?;
        let store = Arc::new(StateStore::open(&config.state_dir(git.repo_path()))?);
        let state = store.load()?;
        // The state file may have been edited by hand.
        state.graph.validate().into_result()?;
        let run_id = state.run_id.clone();

        let ctx = build_context(git, config, store, run_id, hooks)?;
        let recovery = RecoveryEngine::new(ctx.store.clone(), ctx.config.heartbeat_timeout());
        let report = recovery.recover_orphans(&ctx.coordinator)?;
        ctx.notify(&report.events);
        ctx.store.update(|state| {
            state.stop_request = None;
            Ok(())
        })?;
        remove_stale_worktrees(&ctx, &state.workers.values().cloned().collect::<Vec<_>>());
        info!(
            run = %ctx.run_id,
            released = report.released.len(),
            "run resumed"
        );
        Ok(Self::from_context(ctx))
    }

    pub fn from_context(ctx: Arc<RunContext>) -> Self {
        Self {
            dispatcher: WorkerDispatcher::new(ctx.clone()),
            gates: GateRunner::new(ctx.clone()),
            merger: MergeCoordinator::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    /// Cancelling this token stops the run as if a forced stop was
    /// requested.
    pub fn cancel_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Drive the run until it completes, pauses or blocks.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let state = self.ctx.store.load()?;
        if state.status == RunStatus::Completed {
            return Ok(RunOutcome::Completed);
        }
        let coordinator = self.ctx.coordinator.clone();
        let event = self.ctx.store.update(|state| {
            state.status = RunStatus::Running;
            state.coordinator = Some(coordinator.clone());
            Ok(state.push_event(
                Event::new(EventKind::RunStarted).message(format!("coordinator {}", coordinator)),
            ))
        })?;
        self.ctx.notify(&[event]);
        info!(run = %self.ctx.run_id, levels = state.levels.len(), "run started");

        for level in state.graph.level_numbers() {
            match self.run_level(level).await? {
                LevelStep::Merged => {}
                LevelStep::Paused { force } => {
                    self.pause(force).await?;
                    return Ok(RunOutcome::Paused { force });
                }
                LevelStep::Blocked { reason } => {
                    self.halt().await?;
                    return Ok(RunOutcome::Blocked { level, reason });
                }
            }
        }

        self.finish().await?;
        Ok(RunOutcome::Completed)
    }

    async fn run_level(&mut self, level: u32) -> Result<LevelStep> {
        let record = self.ctx.store.get_level(level)?;
        match record.state {
            LevelState::Merged => return Ok(LevelStep::Merged),
            LevelState::Blocked => {
                let reason = record
                    .blocked_reason
                    .unwrap_or_else(|| "level blocked".to_string());
                return Ok(LevelStep::Blocked { reason });
            }
            LevelState::Pending | LevelState::Running => {
                if record.state == LevelState::Pending {
                    let event = self.ctx.store.transition_level(level, LevelState::Running)?;
                    self.ctx.notify(&[event]);
                }
                if let Some(step) = self.dispatch(level).await? {
                    return Ok(step);
                }
            }
            LevelState::Gating => {
                info!(level, "resuming level at gating");
            }
        }
        self.integrate(level).await
    }

    /// Run the level's tasks and move it to gating. Returns a step when the
    /// level cannot proceed to gating.
    async fn dispatch(&mut self, level: u32) -> Result<Option<LevelStep>> {
        let max_workers = self.ctx.config.max_workers;
        match self.dispatcher.dispatch_level(level, max_workers).await? {
            DispatchOutcome::Stopped { force } => return Ok(Some(LevelStep::Paused { force })),
            DispatchOutcome::Settled => {}
        }

        let state = self.ctx.store.load()?;
        let blocked = state.tasks_in_state(level, TaskState::Blocked);
        let partial = !blocked.is_empty() && self.ctx.config.allow_partial_advance;
        if partial {
            warn!(level, blocked = blocked.len(), "advancing level with blocked tasks");
            self.ctx.store.update_level(level, |record| record.partial = true)?;
        }
        let event = self.ctx.store.transition_level(level, LevelState::Gating)?;
        self.ctx.notify(&[event]);

        if !blocked.is_empty() && !partial {
            let reason = describe_blocked_tasks(&state, &blocked);
            return self.block_level(level, reason).map(Some);
        }
        Ok(None)
    }

    /// Stage, gate and merge a level in `gating`.
    async fn integrate(&mut self, level: u32) -> Result<LevelStep> {
        if let Some(stop) = self.ctx.store.stop_request()? {
            return Ok(LevelStep::Paused { force: stop.force });
        }

        let staged = self.merger.stage_level(level).await?;
        if !staged.success {
            let offending = staged.offending.clone();
            let events = self.ctx.store.update(|state| {
                let mut events = Vec::new();
                for id in &offending {
                    events.push(state.transition_task(
                        id,
                        TaskState::Pending,
                        TransitionMeta::reason("merge conflict; re-scope and re-run"),
                    )?);
                }
                Ok(events)
            })?;
            self.ctx.notify(&events);
            let reason = format!(
                "{}; offending tasks: {}",
                staged.anomaly(level),
                join_ids(&staged.offending)
            );
            return self.block_level(level, reason);
        }

        let workdir = self.ctx.staging_workdir();
        let gates = self.gates.gate_level(level, &workdir).await?;
        if gates.interrupted || self.ctx.cancel.is_cancelled() {
            return Ok(LevelStep::Paused { force: true });
        }
        if !gates.passed {
            return self.block_level(level, describe_gate_failures(&gates));
        }

        let merged = self.merger.merge_level(level).await?;
        if !merged.success {
            return self.block_level(level, merged.anomaly(level).to_string());
        }

        let event = self.ctx.store.transition_level(level, LevelState::Merged)?;
        self.ctx.notify(&[event]);
        let baseline = self.ctx.store.load()?.baseline_branch;
        self.dispatcher.pool().reset_all(&baseline).await?;
        info!(level, commit = ?merged.commit, "level complete");
        Ok(LevelStep::Merged)
    }

    fn block_level(&self, level: u32, reason: String) -> Result<LevelStep> {
        let recorded = reason.clone();
        self.ctx
            .store
            .update_level(level, |record| record.blocked_reason = Some(recorded))?;
        let event = self.ctx.store.transition_level(level, LevelState::Blocked)?;
        self.ctx.notify(&[event]);
        error!(level, reason = %reason, "level blocked");
        Ok(LevelStep::Blocked { reason })
    }

    async fn pause(&mut self, force: bool) -> Result<()> {
        let event = self.ctx.store.update(|state| {
            state.status = RunStatus::Paused;
            state.stop_request = None;
            let message = if force { "forced stop" } else { "stop requested" };
            Ok(state.push_event(Event::new(EventKind::RunPaused).message(message)))
        })?;
        self.ctx.notify(&[event]);
        // Completed but unmerged work lives on the worker branches.
        self.dispatcher.pool_mut().shutdown(false).await?;
        self.remove_staging(false).await;
        info!(run = %self.ctx.run_id, force, "run paused");
        Ok(())
    }

    /// A level blocked. Workers go away; their branches and the staging
    /// worktree stay for inspection.
    async fn halt(&mut self) -> Result<()> {
        self.ctx.store.update(|state| {
            state.status = RunStatus::Blocked;
            state.stop_request = None;
            Ok(())
        })?;
        self.dispatcher.pool_mut().shutdown(false).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let event = self.ctx.store.update(|state| {
            state.status = RunStatus::Completed;
            state.stop_request = None;
            let message = format!("{} levels merged", state.levels.len());
            Ok(state.push_event(Event::new(EventKind::RunFinished).message(message)))
        })?;
        self.ctx.notify(&[event]);
        self.dispatcher.pool_mut().shutdown(true).await?;
        self.remove_staging(true).await;
        info!(run = %self.ctx.run_id, "run completed");
        Ok(())
    }

    async fn remove_staging(&self, delete_branch: bool) {
        let git = self.ctx.git.clone();
        let workdir = self.ctx.staging_workdir();
        let branch = match self.ctx.store.load() {
            Ok(state) => state.staging_branch,
            Err(e) => {
                warn!(error = %e, "could not load state to clean up staging");
                return;
            }
        };
        let removed = util::blocking(move || {
            git.remove_worktree(&workdir)?;
            if delete_branch {
                git.delete_branch(&branch)?;
            }
            Ok(())
        })
        .await;
        if let Err(e) = removed {
            warn!(error = %e, "failed to remove staging worktree");
        }
    }
}

fn coordinator_id() -> String {
    format!("{}-{}", std::process::id(), util::short_id())
}

fn build_context(
    git: GitOps,
    config: Config,
    store: Arc<StateStore>,
    run_id: String,
    hooks: HookRegistry,
) -> Result<Arc<RunContext>> {
    let repo = git.repo_path().to_path_buf();
    let task_dir = config.state_dir(&repo).join("tasks");
    let executor = resolve_executor(&config, &hooks, &task_dir)?;
    Ok(Arc::new(RunContext {
        repo,
        config,
        run_id,
        coordinator: coordinator_id(),
        store,
        git,
        hooks: Arc::new(hooks),
        executor,
        cancel: CancellationToken::new(),
    }))
}

/// Keep orchestrator files out of the repository's status.
fn ignore_weir_dir(repo: &Path) -> Result<()> {
    let dir = Config::weir_dir(repo);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(".gitignore");
    if !path.exists() {
        std::fs::write(&path, "*\n")?;
    }
    Ok(())
}

/// Remove worktrees left by workers that are no longer running.
fn remove_stale_worktrees(ctx: &RunContext, workers: &[WorkerRecord]) {
    for record in workers {
        if record.coordinator == ctx.coordinator {
            continue;
        }
        let Some(workdir) = &record.workdir else {
            continue;
        };
        if !workdir.exists() {
            continue;
        }
        match ctx.git.remove_worktree(workdir) {
            Ok(()) => info!(worker = %record.id, "removed stale worktree"),
            Err(e) => warn!(worker = %record.id, error = %e, "failed to remove stale worktree"),
        }
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_blocked_tasks(state: &RunState, blocked: &[TaskId]) -> String {
    let details: Vec<String> = blocked
        .iter()
        .map(|id| match state.tasks.get(id) {
            Some(exec) => format!(
                "{} after {} attempts: {}",
                id,
                exec.attempts.len(),
                exec.last_error.as_deref().unwrap_or("unknown error")
            ),
            None => id.to_string(),
        })
        .collect();
    format!("blocked tasks: {}", details.join("; "))
}

fn describe_gate_failures(result: &GateResult) -> String {
    let details: Vec<String> = result
        .blocking()
        .iter()
        .map(|check| {
            let status = if check.timed_out {
                "timed out".to_string()
            } else {
                match check.exit_code {
                    Some(code) => format!("exit code {}", code),
                    None => "failed".to_string(),
                }
            };
            match check.output.lines().last() {
                Some(line) if !line.trim().is_empty() => {
                    format!("{} ({}): {}", check.name, status, line.trim())
                }
                _ => format!("{} ({})", check.name, status),
            }
        })
        .collect();
    format!("gates failed: {}", details.join("; "))
}

// ========== Control operations ==========

fn open_store(repo: &Path, config: &Config) -> Result<StateStore> {
    StateStore::open(&config.state_dir(repo))
}

/// Ask the running coordinator to pause.
pub fn request_stop(repo: &Path, config: &Config, force: bool) -> Result<()> {
    let store = open_store(repo, config)?;
    let status = store.load()?.status;
    if status != RunStatus::Running {
        warn!(status = %status, "stop requested while no coordinator is running");
    }
    store.request_stop(force)?;
    info!(force, "stop requested");
    Ok(())
}

/// Reset a blocked task to `pending`, reopening its level if that level is
/// blocked. The run continues on the next `resume`.
pub fn retry_task(repo: &Path, config: &Config, id: &TaskId) -> Result<Vec<Event>> {
    let store = open_store(repo, config)?;
    let events = store.update(|state| {
        let level = state
            .graph
            .get(id)
            .map(|t| t.level)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let current = state.task(id)?.state;
        if current != TaskState::Blocked {
            return Err(Error::InvalidTaskTransition {
                task: id.clone(),
                from: current.to_string(),
                to: TaskState::Pending.to_string(),
            });
        }
        let mut events = vec![state.transition_task(
            id,
            TaskState::Pending,
            TransitionMeta::reason("manual retry"),
        )?];
        if state.level(level)?.state == LevelState::Blocked {
            events.push(reopen_level(state, level)?);
        }
        if state.status == RunStatus::Blocked {
            state.status = RunStatus::Paused;
        }
        Ok(events)
    })?;
    info!(task = %id, "task reset for retry");
    Ok(events)
}

/// Reopen a blocked level: its blocked tasks go back to `pending` and gates
/// and remediation start over.
pub fn retry_level(repo: &Path, config: &Config, level: u32) -> Result<Vec<Event>> {
    let store = open_store(repo, config)?;
    let events = store.update(|state| {
        let current = state.level(level)?.state;
        if current != LevelState::Blocked {
            return Err(Error::InvalidLevelTransition {
                level,
                from: current.to_string(),
                to: LevelState::Running.to_string(),
                reason: "only blocked levels can be retried".to_string(),
            });
        }
        let mut events = Vec::new();
        for id in state.tasks_in_state(level, TaskState::Blocked) {
            events.push(state.transition_task(
                &id,
                TaskState::Pending,
                TransitionMeta::reason("manual level retry"),
            )?);
        }
        events.push(reopen_level(state, level)?);
        if state.status == RunStatus::Blocked {
            state.status = RunStatus::Paused;
        }
        Ok(events)
    })?;
    info!(level, "level reopened for retry");
    Ok(events)
}

fn reopen_level(state: &mut RunState, level: u32) -> Result<Event> {
    let record = state.level_mut(level)?;
    record.gate_results.clear();
    record.gates_passed = false;
    record.remediation_attempts = 0;
    record.partial = false;
    record.conflicts.clear();
    record.merge_commit = None;
    state.transition_level(level, LevelState::Running)
}

/// Read-only summary of the recorded run.
pub fn status(repo: &Path, config: &Config) -> Result<StatusReport> {
    let store = open_store(repo, config)?;
    Ok(StatusReport::from_state(&store.load()?, 10))
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub run_id: String,
    pub feature: String,
    pub status: RunStatus,
    pub current_level: u32,
    pub baseline_branch: String,
    pub stop_requested: Option<bool>,
    pub levels: Vec<LevelStatus>,
    pub workers: Vec<WorkerStatusLine>,
    pub recent_events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelStatus {
    pub level: u32,
    pub state: LevelState,
    pub completed: usize,
    pub total: usize,
    pub gates_passed: bool,
    pub remediation_attempts: u32,
    pub merge_commit: Option<String>,
    pub blocked_reason: Option<String>,
    pub tasks: Vec<TaskStatusLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusLine {
    pub id: TaskId,
    pub title: String,
    pub state: TaskState,
    pub worker: Option<String>,
    pub attempts: usize,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatusLine {
    pub id: String,
    pub status: WorkerStatus,
    pub task: Option<TaskId>,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
}

impl StatusReport {
    pub fn from_state(state: &RunState, recent: usize) -> Self {
        let levels = state
            .levels
            .values()
            .map(|record| {
                let tasks: Vec<TaskStatusLine> = record
                    .tasks
                    .iter()
                    .map(|id| {
                        let exec = state.tasks.get(id).cloned().unwrap_or_default();
                        TaskStatusLine {
                            id: id.clone(),
                            title: state
                                .graph
                                .get(id)
                                .map(|t| t.title.clone())
                                .unwrap_or_default(),
                            state: exec.state,
                            worker: exec.worker.map(|w| w.to_string()),
                            attempts: exec.attempts.len(),
                            last_error: exec.last_error,
                        }
                    })
                    .collect();
                LevelStatus {
                    level: record.level,
                    state: record.state,
                    completed: tasks
                        .iter()
                        .filter(|t| t.state == TaskState::Completed)
                        .count(),
                    total: tasks.len(),
                    gates_passed: record.gates_passed,
                    remediation_attempts: record.remediation_attempts,
                    merge_commit: record.merge_commit.clone(),
                    blocked_reason: record.blocked_reason.clone(),
                    tasks,
                }
            })
            .collect();
        let workers = state
            .workers
            .values()
            .map(|w| WorkerStatusLine {
                id: w.id.to_string(),
                status: w.status,
                task: w.task.clone(),
                last_heartbeat: w.last_heartbeat,
            })
            .collect();
        let skip = state.events.len().saturating_sub(recent);

        Self {
            run_id: state.run_id.clone(),
            feature: state.feature.clone(),
            status: state.status,
            current_level: state.current_level,
            baseline_branch: state.baseline_branch.clone(),
            stop_requested: state.stop_request.map(|s| s.force),
            levels,
            workers,
            recent_events: state.events[skip..].to_vec(),
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "run {} ({}) {} on {}, level {}",
            self.run_id, self.feature, self.status, self.baseline_branch, self.current_level
        )?;
        if let Some(force) = self.stop_requested {
            writeln!(f, "stop requested{}", if force { " (force)" } else { "" })?;
        }
        for level in &self.levels {
            write!(
                f,
                "level {} {} {}/{} completed",
                level.level, level.state, level.completed, level.total
            )?;
            if let Some(commit) = &level.merge_commit {
                write!(f, " merge {}", &commit[..commit.len().min(8)])?;
            }
            writeln!(f)?;
            if let Some(reason) = &level.blocked_reason {
                writeln!(f, "  blocked: {}", reason)?;
            }
            for task in &level.tasks {
                write!(f, "  {} {}", task.id, task.state)?;
                if let Some(worker) = &task.worker {
                    write!(f, " on {}", worker)?;
                }
                if task.attempts > 0 {
                    write!(f, " attempts={}", task.attempts)?;
                }
                if let Some(error) = &task.last_error {
                    write!(f, " error: {}", error)?;
                }
                writeln!(f)?;
            }
        }
        if !self.workers.is_empty() {
            writeln!(f, "workers:")?;
            for worker in &self.workers {
                match &worker.task {
                    Some(task) => writeln!(f, "  {} {} {}", worker.id, worker.status, task)?,
                    None => writeln!(f, "  {} {}", worker.id, worker.status)?,
                }
            }
        }
        if !self.recent_events.is_empty() {
            writeln!(f, "recent events:")?;
            for event in &self.recent_events {
                writeln!(f, "  {}", event)?;
            }
        }
        Ok(())
    }
}
