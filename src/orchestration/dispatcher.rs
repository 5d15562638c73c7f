//! Worker dispatch for one level.
//!
//! The dispatcher keeps up to `max_workers` tasks of the running level in
//! flight. Each task runs in its own tokio task (a "runner") that:
//!
//! 1. marks the claim `in_progress`,
//! 2. runs the executor under the task timeout while heartbeating,
//! 3. runs the task's verification command,
//! 4. rejects changes outside the task's file ownership,
//! 5. commits the worktree on success or discards it on failure,
//! 6. records the outcome in the state store.
//!
//! Between completions the dispatcher runs the heartbeat sweep and watches
//! for stop requests.

use crate::core::{Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::context::RunContext;
use crate::orchestration::executor::{run_command, WorkerContext, OUTPUT_TAIL_LINES};
use crate::orchestration::pool::{WorkerPool, WorkerSlot};
use crate::orchestration::recovery::RecoveryEngine;
use crate::state::{Attempt, StateStore, TaskState, TransitionMeta, WorkerId};
use crate::util;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How a level's dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every task of the level is completed or blocked.
    Settled,
    /// A stop was requested; no runner is left in flight.
    Stopped { force: bool },
}

/// What happened to one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { commit: String },
    Failed { next: TaskState, error: String },
    /// Interrupted by a stop; the task is runnable again.
    Released,
    /// The claim was taken away (worker declared crashed).
    Lost,
}

#[derive(Debug, Clone)]
pub struct RunnerReport {
    pub task: TaskId,
    pub worker: WorkerId,
    pub outcome: TaskOutcome,
}

pub struct WorkerDispatcher {
    ctx: Arc<RunContext>,
    pool: WorkerPool,
    recovery: RecoveryEngine,
}

impl WorkerDispatcher {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        let pool = WorkerPool::new(ctx.clone(), ctx.config.max_workers);
        let recovery = RecoveryEngine::new(ctx.store.clone(), ctx.config.heartbeat_timeout());
        Self {
            ctx,
            pool,
            recovery,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut WorkerPool {
        &mut self.pool
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    /// Run the level's tasks until all are completed or blocked, or until a
    /// stop is requested.
    pub async fn dispatch_level(&mut self, level: u32, max_workers: usize) -> Result<DispatchOutcome> {
        let limit = max_workers.clamp(1, self.pool.max_workers());
        let baseline = self.ctx.store.load()?.baseline_branch;
        info!(level, limit, "dispatching level");

        let mut running: JoinSet<RunnerReport> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, (WorkerId, TaskId)> = HashMap::new();
        let mut stopping: Option<bool> = None;
        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let state = with_store(&self.ctx, |store| store.load()).await?;

            // Stop requests: graceful drains, force cancels. Graceful can be
            // upgraded to force while draining.
            let force_now = state.stop_request.map(|s| s.force).unwrap_or(false)
                || self.ctx.cancel.is_cancelled();
            if state.stop_request.is_some() || self.ctx.cancel.is_cancelled() {
                if stopping != Some(true) && force_now {
                    warn!(level, running = running.len(), "forced stop, cancelling workers");
                    self.pool.cancel_all();
                    stopping = Some(true);
                } else if stopping.is_none() {
                    info!(level, running = running.len(), "stop requested, draining workers");
                    stopping = Some(false);
                }
            }

            if stopping.is_none() {
                for id in state.runnable_tasks(level) {
                    if running.len() >= limit || !self.pool.has_capacity() {
                        break;
                    }
                    let slot = self.pool.acquire(&baseline).await?;
                    let (claim, event) = {
                        let (task, worker) = (id.clone(), slot.id.clone());
                        with_store(&self.ctx, move |store| store.claim_task(&task, &worker)).await?
                    };
                    if !claim.is_acquired() {
                        debug!(task = %id, ?claim, "claim lost");
                        continue;
                    }
                    self.ctx.notify(&event.into_iter().collect::<Vec<_>>());
                    self.pool.assign(&slot.id, &id)?;

                    let task = state
                        .graph
                        .get(&id)
                        .cloned()
                        .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
                    let attempt = state.task(&id)?.attempts.len() as u32 + 1;
                    info!(task = %id, worker = %slot.id, attempt, "task dispatched");

                    let handle = running.spawn(run_task(self.ctx.clone(), task, slot.clone(), attempt));
                    in_flight.insert(handle.id(), (slot.id, id));
                }
            }

            if running.is_empty() {
                if let Some(force) = stopping {
                    info!(level, force, "dispatch stopped");
                    return Ok(DispatchOutcome::Stopped { force });
                }
                if with_store(&self.ctx, |store| store.load()).await?.level_is_terminal(level) {
                    info!(level, "level settled");
                    return Ok(DispatchOutcome::Settled);
                }
            }

            tokio::select! {
                Some(joined) = running.join_next_with_id(), if !running.is_empty() => {
                    match joined {
                        Ok((id, report)) => {
                            in_flight.remove(&id);
                            self.finish(report);
                        }
                        Err(join_err) => {
                            let entry = in_flight.remove(&join_err.id());
                            self.runner_died(entry, join_err.to_string()).await;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.sweep()?;
                }
            }
        }
    }

    fn finish(&mut self, report: RunnerReport) {
        self.pool.release(&report.worker);
        match &report.outcome {
            TaskOutcome::Completed { commit } => {
                debug!(task = %report.task, worker = %report.worker, commit = %commit, "runner finished")
            }
            TaskOutcome::Failed { next, error } => {
                debug!(task = %report.task, next = %next, error = %error, "runner failed")
            }
            TaskOutcome::Released => debug!(task = %report.task, "runner released task"),
            TaskOutcome::Lost => debug!(task = %report.task, "runner lost its claim"),
        }
    }

    /// A runner panicked or was aborted. Count it as a failed attempt so a
    /// reproducible crash cannot loop forever.
    async fn runner_died(&mut self, entry: Option<(WorkerId, TaskId)>, reason: String) {
        let Some((worker, task)) = entry else {
            error!(reason = %reason, "unknown runner died");
            return;
        };
        error!(task = %task, worker = %worker, reason = %reason, "runner died");
        self.pool.release(&worker);
        if let Some(slot) = self.pool.get(&worker) {
            discard(&self.ctx, slot.workdir.clone()).await;
        }
        let now = Utc::now();
        let attempt = Attempt {
            number: 0,
            worker: worker.clone(),
            started_at: now,
            finished_at: now,
            success: false,
            exit_code: None,
            error: Some(format!("runner died: {}", reason)),
            output_tail: String::new(),
            artifacts: Vec::new(),
        };
        let max_retries = self.ctx.config.max_retries;
        let (id, owner) = (task.clone(), worker.clone());
        let recorded = with_store(&self.ctx, move |store| {
            store.record_failure(&id, &owner, attempt, max_retries)
        })
        .await;
        match recorded {
            Ok((_, events)) => self.ctx.notify(&events),
            Err(e) => warn!(task = %task, error = %e, "could not record runner death"),
        }
    }

    /// Heartbeat sweep; retire any of our slots that were declared crashed.
    fn sweep(&mut self) -> Result<()> {
        let report = self.recovery.sweep()?;
        self.ctx.notify(&report.events);
        for worker in &report.crashed {
            if self.pool.contains(worker) {
                self.pool.retire(worker);
            }
        }
        Ok(())
    }
}

/// Result of the work phase of an attempt, before it is recorded.
enum Work {
    Done {
        commit: String,
        output: String,
        artifacts: Vec<PathBuf>,
    },
    Failed {
        exit_code: Option<i32>,
        error: String,
        output: String,
    },
    Interrupted,
}

async fn run_task(ctx: Arc<RunContext>, task: Task, slot: WorkerSlot, attempt: u32) -> RunnerReport {
    let outcome = match attempt_task(&ctx, &task, &slot, attempt).await {
        Ok(outcome) => outcome,
        Err(Error::StaleClaim { .. }) => {
            warn!(task = %task.id, worker = %slot.id, "claim no longer held, dropping work");
            discard(&ctx, slot.workdir.clone()).await;
            TaskOutcome::Lost
        }
        Err(e) => {
            error!(task = %task.id, worker = %slot.id, error = %e, "runner error");
            discard(&ctx, slot.workdir.clone()).await;
            fail(&ctx, &task, &slot, attempt, Utc::now(), None, e.to_string(), String::new())
                .await
                .unwrap_or_else(|e| {
                    warn!(task = %task.id, error = %e, "could not record failed attempt");
                    TaskOutcome::Lost
                })
        }
    };
    RunnerReport {
        task: task.id,
        worker: slot.id,
        outcome,
    }
}

async fn attempt_task(
    ctx: &Arc<RunContext>,
    task: &Task,
    slot: &WorkerSlot,
    attempt: u32,
) -> Result<TaskOutcome> {
    let started_at = Utc::now();
    let (id, worker) = (task.id.clone(), slot.id.clone());
    let event = with_store(ctx, move |store| {
        store.transition_task(&id, TaskState::InProgress, TransitionMeta::by(&worker))
    })
    .await?;
    ctx.notify(&[event]);

    let heartbeat = util::AbortOnDrop(spawn_heartbeat(ctx.clone(), slot.clone()));
    let work = do_work(ctx, task, slot, attempt).await;
    drop(heartbeat);

    match work? {
        Work::Done {
            commit,
            output,
            artifacts,
        } => {
            let record = Attempt {
                number: attempt,
                worker: slot.id.clone(),
                started_at,
                finished_at: Utc::now(),
                success: true,
                exit_code: Some(0),
                error: None,
                output_tail: output,
                artifacts,
            };
            let meta = TransitionMeta {
                worker: Some(slot.id.clone()),
                attempt: Some(record),
                branch: Some(slot.branch.clone()),
                commit: Some(commit.clone()),
                ..Default::default()
            };
            let id = task.id.clone();
            let event = with_store(ctx, move |store| {
                store.transition_task(&id, TaskState::Completed, meta)
            })
            .await?;
            ctx.notify(&[event]);
            info!(task = %task.id, worker = %slot.id, commit = %commit, "task completed");
            Ok(TaskOutcome::Completed { commit })
        }
        Work::Failed {
            exit_code,
            error,
            output,
        } => {
            discard(ctx, slot.workdir.clone()).await;
            fail(ctx, task, slot, attempt, started_at, exit_code, error, output).await
        }
        Work::Interrupted => {
            discard(ctx, slot.workdir.clone()).await;
            let id = task.id.clone();
            let worker = slot.id.clone();
            let event = with_store(ctx, move |store| {
                store.update(|state| {
                    // Only release a claim we still hold.
                    if state.task(&id)?.worker.as_ref() != Some(&worker) {
                        return Ok(None);
                    }
                    state.release(&id, "interrupted by stop")
                })
            })
            .await?;
            match event {
                Some(event) => {
                    ctx.notify(&[event]);
                    info!(task = %task.id, worker = %slot.id, "task released after interrupt");
                    Ok(TaskOutcome::Released)
                }
                None => Ok(TaskOutcome::Lost),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn fail(
    ctx: &RunContext,
    task: &Task,
    slot: &WorkerSlot,
    attempt: u32,
    started_at: DateTime<Utc>,
    exit_code: Option<i32>,
    error: String,
    output: String,
) -> Result<TaskOutcome> {
    let record = Attempt {
        number: attempt,
        worker: slot.id.clone(),
        started_at,
        finished_at: Utc::now(),
        success: false,
        exit_code,
        error: Some(error.clone()),
        output_tail: output,
        artifacts: Vec::new(),
    };
    let (id, worker, max_retries) = (task.id.clone(), slot.id.clone(), ctx.config.max_retries);
    let (next, events) = with_store(ctx, move |store| {
        store.record_failure(&id, &worker, record, max_retries)
    })
    .await?;
    ctx.notify(&events);
    warn!(task = %task.id, worker = %slot.id, attempt, next = %next, error = %error, "task attempt failed");
    Ok(TaskOutcome::Failed { next, error })
}

/// Execute, verify, check ownership and commit.
async fn do_work(ctx: &Arc<RunContext>, task: &Task, slot: &WorkerSlot, attempt: u32) -> Result<Work> {
    let wctx = WorkerContext {
        worker: slot.id.clone(),
        workdir: slot.workdir.clone(),
        level: task.level,
        attempt,
        cancel: slot.cancel.clone(),
    };

    let timeout = ctx.config.task_timeout();
    let executed = tokio::time::timeout(
        timeout,
        AssertUnwindSafe(ctx.executor.execute(task, &wctx)).catch_unwind(),
    )
    .await;
    if slot.cancel.is_cancelled() {
        return Ok(Work::Interrupted);
    }
    let result = match executed {
        Err(_) => {
            return Ok(Work::Failed {
                exit_code: None,
                error: format!("executor timed out after {:?}", timeout),
                output: String::new(),
            })
        }
        Ok(Err(_)) => {
            return Ok(Work::Failed {
                exit_code: None,
                error: "executor panicked".to_string(),
                output: String::new(),
            })
        }
        Ok(Ok(Err(e))) => {
            return Ok(Work::Failed {
                exit_code: None,
                error: e.to_string(),
                output: String::new(),
            })
        }
        Ok(Ok(Ok(result))) => result,
    };
    if !result.is_success() {
        return Ok(Work::Failed {
            exit_code: Some(result.exit_code),
            error: format!("executor exited with code {}", result.exit_code),
            output: result.output,
        });
    }

    let envs = vec![
        ("WEIR_TASK_ID".to_string(), task.id.to_string()),
        ("WEIR_WORKER_ID".to_string(), slot.id.to_string()),
    ];
    let verify = run_command(
        &ctx.config.executor.shell,
        &task.verification.command,
        &slot.workdir,
        &envs,
        Some(std::time::Duration::from_secs(task.verification.timeout_secs)),
        &slot.cancel,
    )
    .await?;
    if verify.cancelled {
        return Ok(Work::Interrupted);
    }
    let output = util::tail(
        &format!("{}\n{}", result.output, verify.output),
        OUTPUT_TAIL_LINES,
    );
    if !verify.success() {
        return Ok(Work::Failed {
            exit_code: verify.exit_code,
            error: verify.describe("verification"),
            output,
        });
    }

    let git = ctx.git.clone();
    let workdir = slot.workdir.clone();
    let changed = util::blocking(move || git.changed_files(&workdir)).await?;
    if ctx.config.enforce_ownership {
        let outside: Vec<String> = changed
            .iter()
            .filter(|path| !task.files.owns(path))
            .map(|path| path.display().to_string())
            .collect();
        if !outside.is_empty() {
            return Ok(Work::Failed {
                exit_code: Some(0),
                error: format!("modified files it does not own: {}", outside.join(", ")),
                output,
            });
        }
    }

    let git = ctx.git.clone();
    let workdir = slot.workdir.clone();
    let message = format!("weir({}): {}", task.id, task.title);
    let commit = util::blocking(move || git.commit_all(&workdir, &message)).await?;
    debug!(task = %task.id, files = changed.len(), commit = %commit, "work committed");
    Ok(Work::Done {
        commit,
        output,
        artifacts: result.artifacts,
    })
}

/// Run a state-store operation on the blocking pool; every store call
/// takes a file lock and rewrites the state file.
async fn with_store<T, F>(ctx: &RunContext, f: F) -> Result<T>
where
    F: FnOnce(&StateStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = ctx.store.clone();
    util::blocking(move || f(&store)).await
}

/// Refresh the worker's heartbeat until aborted. Cancels the slot when the
/// worker has been declared crashed.
fn spawn_heartbeat(ctx: Arc<RunContext>, slot: WorkerSlot) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ctx.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let store = ctx.store.clone();
            let worker = slot.id.clone();
            match util::blocking(move || store.heartbeat(&worker)).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(worker = %slot.id, "worker declared crashed, abandoning task");
                    slot.cancel.cancel();
                    break;
                }
                Err(e) => warn!(worker = %slot.id, error = %e, "heartbeat failed"),
            }
        }
    })
}

async fn discard(ctx: &RunContext, workdir: PathBuf) {
    let git = ctx.git.clone();
    let path = workdir.clone();
    if let Err(e) = util::blocking(move || git.discard_changes(&path)).await {
        warn!(workdir = %workdir.display(), error = %e, "failed to discard worktree changes");
    }
}
