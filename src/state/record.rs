//! Persisted records: task executions, levels, workers and the run itself.
//!
//! `RunState` is the single aggregate written to `state.json`. Every guard on
//! task and level transitions lives here so that the store, the recovery
//! engine and tests all enforce the same rules.

use crate::core::{TaskGraph, TaskId};
use crate::error::{Error, Result};
use crate::state::event::{Event, EventKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Identifier of a worker slot, unique within a run (`worker-<n>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(n: u32) -> Self {
        Self(format!("worker-{}", n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Execution state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
    RetryPending,
    Blocked,
}

impl TaskState {
    /// Completed and blocked tasks no longer hold up their level.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Blocked)
    }

    /// Eligible for a claim.
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::RetryPending)
    }

    /// Held by a worker.
    pub fn is_active(self) -> bool {
        matches!(self, TaskState::Claimed | TaskState::InProgress)
    }

    /// Whether `self → to` is a legal transition outside of a claim.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Claimed, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, RetryPending)
                | (Failed, Blocked)
                | (Claimed, Pending)
                | (Claimed, RetryPending)
                | (InProgress, Pending)
                | (InProgress, RetryPending)
                | (Blocked, Pending)
                | (Completed, Pending)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Claimed => "claimed",
            TaskState::InProgress => "in_progress",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::RetryPending => "retry_pending",
            TaskState::Blocked => "blocked",
        };
        write!(f, "{}", name)
    }
}

/// One executor run of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub worker: WorkerId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// Last lines of executor and verification output.
    #[serde(default)]
    pub output_tail: String,
    /// Output files the executor declared on success.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

/// Persisted status of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskExecution {
    pub state: TaskState,
    pub worker: Option<WorkerId>,
    pub retry_count: u32,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Worker branch holding the committed output.
    pub branch: Option<String>,
    pub commit: Option<String>,
}

/// State of a level (wave).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LevelState {
    #[default]
    Pending,
    Running,
    Gating,
    Merged,
    Blocked,
}

impl LevelState {
    pub fn is_final(self) -> bool {
        matches!(self, LevelState::Merged | LevelState::Blocked)
    }
}

impl std::fmt::Display for LevelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LevelState::Pending => "pending",
            LevelState::Running => "running",
            LevelState::Gating => "gating",
            LevelState::Merged => "merged",
            LevelState::Blocked => "blocked",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of a single gate command or gate extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCheck {
    pub name: String,
    pub command: String,
    pub required: bool,
    pub passed: bool,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Tail of combined stdout/stderr.
    #[serde(default)]
    pub output: String,
}

impl GateCheck {
    /// A required check that failed.
    pub fn is_blocking(&self) -> bool {
        self.required && !self.passed
    }
}

/// Persisted status of one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRecord {
    pub level: u32,
    pub state: LevelState,
    pub tasks: Vec<TaskId>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub gate_results: Vec<GateCheck>,
    #[serde(default)]
    pub gates_passed: bool,
    #[serde(default)]
    pub remediation_attempts: u32,
    /// Entered gating with blocked tasks under the partial-advance policy.
    #[serde(default)]
    pub partial: bool,
    pub merge_commit: Option<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    pub blocked_reason: Option<String>,
}

impl LevelRecord {
    pub fn new(level: u32, tasks: Vec<TaskId>) -> Self {
        Self {
            level,
            state: LevelState::Pending,
            tasks,
            started_at: None,
            finished_at: None,
            gate_results: Vec::new(),
            gates_passed: false,
            remediation_attempts: 0,
            partial: false,
            merge_commit: None,
            conflicts: Vec::new(),
            blocked_reason: None,
        }
    }
}

/// Worker slot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Crashed,
    Stopped,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Crashed => "crashed",
            WorkerStatus::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Registry entry for a worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    /// Coordinator process that owns this slot.
    pub coordinator: String,
    pub status: WorkerStatus,
    pub task: Option<TaskId>,
    pub last_heartbeat: DateTime<Utc>,
    pub branch: Option<String>,
    pub workdir: Option<PathBuf>,
    pub spawned_at: DateTime<Utc>,
}

/// Top-level run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Blocked,
}

impl RunStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Blocked => "blocked",
        };
        write!(f, "{}", name)
    }
}

/// A stop requested through the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    /// Terminate running tasks instead of letting them finish.
    pub force: bool,
    pub requested_at: DateTime<Utc>,
}

/// Result of a claim attempt. Losing a race is an expected outcome, not an
/// error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Acquired,
    Conflict {
        holder: Option<WorkerId>,
        state: TaskState,
    },
    LevelNotRunning {
        level: u32,
        state: LevelState,
    },
}

impl Claim {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Claim::Acquired)
    }
}

/// Extra data attached to a task transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionMeta {
    /// Worker reporting the transition; must still own the claim.
    pub worker: Option<WorkerId>,
    pub attempt: Option<Attempt>,
    pub error: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    /// Message for the emitted event when there is no error.
    pub reason: Option<String>,
}

impl TransitionMeta {
    pub fn by(worker: &WorkerId) -> Self {
        Self {
            worker: Some(worker.clone()),
            ..Default::default()
        }
    }

    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// The whole persisted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub feature: String,
    pub status: RunStatus,
    pub stop_request: Option<StopRequest>,
    /// Coordinator currently driving the run.
    pub coordinator: Option<String>,
    pub baseline_branch: String,
    pub staging_branch: String,
    pub current_level: u32,
    pub graph: TaskGraph,
    pub tasks: BTreeMap<TaskId, TaskExecution>,
    pub levels: BTreeMap<u32, LevelRecord>,
    pub workers: BTreeMap<WorkerId, WorkerRecord>,
    pub events: Vec<Event>,
    pub next_seq: u64,
    pub next_worker: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Fresh run over a validated graph; every task and level starts
    /// pending.
    pub fn new(run_id: &str, graph: TaskGraph, baseline_branch: &str) -> Self {
        let now = Utc::now();
        let tasks = graph
            .tasks
            .iter()
            .map(|t| (t.id.clone(), TaskExecution::default()))
            .collect();
        let levels = graph
            .levels()
            .into_iter()
            .map(|(n, ids)| (n, LevelRecord::new(n, ids)))
            .collect();
        let current_level = graph.level_numbers().first().copied().unwrap_or(0);

        Self {
            run_id: run_id.to_string(),
            feature: graph.feature.clone(),
            status: RunStatus::Pending,
            stop_request: None,
            coordinator: None,
            baseline_branch: baseline_branch.to_string(),
            staging_branch: format!("weir/{}/staging", run_id),
            current_level,
            graph,
            tasks,
            levels,
            workers: BTreeMap::new(),
            events: Vec::new(),
            next_seq: 1,
            next_worker: 1,
            created_at: now,
            updated_at: now,
        }
    }

    // ========== Lookups ==========

    pub fn task(&self, id: &TaskId) -> Result<&TaskExecution> {
        self.tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut TaskExecution> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn level(&self, n: u32) -> Result<&LevelRecord> {
        self.levels.get(&n).ok_or(Error::LevelNotFound(n))
    }

    pub fn level_mut(&mut self, n: u32) -> Result<&mut LevelRecord> {
        self.levels.get_mut(&n).ok_or(Error::LevelNotFound(n))
    }

    pub fn worker(&self, id: &WorkerId) -> Result<&WorkerRecord> {
        self.workers
            .get(id)
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))
    }

    pub fn worker_mut(&mut self, id: &WorkerId) -> Result<&mut WorkerRecord> {
        self.workers
            .get_mut(id)
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))
    }

    /// Task ids of level `n` paired with their state.
    pub fn level_task_states(&self, n: u32) -> Vec<(TaskId, TaskState)> {
        self.levels
            .get(&n)
            .map(|l| {
                l.tasks
                    .iter()
                    .map(|id| {
                        let state = self.tasks.get(id).map(|t| t.state).unwrap_or_default();
                        (id.clone(), state)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn level_is_terminal(&self, n: u32) -> bool {
        self.level_task_states(n)
            .iter()
            .all(|(_, state)| state.is_terminal())
    }

    pub fn tasks_in_state(&self, n: u32, wanted: TaskState) -> Vec<TaskId> {
        self.level_task_states(n)
            .into_iter()
            .filter(|(_, state)| *state == wanted)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn runnable_tasks(&self, n: u32) -> Vec<TaskId> {
        self.level_task_states(n)
            .into_iter()
            .filter(|(_, state)| state.is_runnable())
            .map(|(id, _)| id)
            .collect()
    }

    /// Tasks in `claimed` or `in_progress` anywhere in the run.
    pub fn active_tasks(&self) -> Vec<(TaskId, Option<WorkerId>)> {
        self.tasks
            .iter()
            .filter(|(_, t)| t.state.is_active())
            .map(|(id, t)| (id.clone(), t.worker.clone()))
            .collect()
    }

    /// Distinct branches of the level's completed tasks, in completion order.
    pub fn completed_branches(&self, n: u32) -> Vec<(String, Vec<TaskId>)> {
        let mut done: Vec<(&TaskId, &TaskExecution)> = self
            .levels
            .get(&n)
            .map(|l| {
                l.tasks
                    .iter()
                    .filter_map(|id| self.tasks.get(id).map(|t| (id, t)))
                    .filter(|(_, t)| t.state == TaskState::Completed)
                    .collect()
            })
            .unwrap_or_default();
        done.sort_by_key(|(_, t)| t.finished_at);

        let mut branches: Vec<(String, Vec<TaskId>)> = Vec::new();
        for (id, exec) in done {
            let Some(branch) = &exec.branch else {
                continue;
            };
            match branches.iter_mut().find(|(b, _)| b == branch) {
                Some((_, ids)) => ids.push(id.clone()),
                None => branches.push((branch.clone(), vec![id.clone()])),
            }
        }
        branches
    }

    // ========== Events ==========

    /// Append an event, assigning the next sequence number.
    pub fn push_event(&mut self, mut event: Event) -> Event {
        event.seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(event.clone());
        event
    }

    // ========== Task transitions ==========

    /// Claim `id` for `worker`. The level must be running and the task
    /// runnable; anything else is reported as a lost race.
    pub fn claim(&mut self, id: &TaskId, worker: &WorkerId) -> Result<(Claim, Option<Event>)> {
        let level = self
            .graph
            .get(id)
            .map(|t| t.level)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let level_state = self.level(level)?.state;
        if level_state != LevelState::Running {
            return Ok((
                Claim::LevelNotRunning {
                    level,
                    state: level_state,
                },
                None,
            ));
        }

        let exec = self.task(id)?;
        if !exec.state.is_runnable() {
            return Ok((
                Claim::Conflict {
                    holder: exec.worker.clone(),
                    state: exec.state,
                },
                None,
            ));
        }

        let now = Utc::now();
        {
            let record = self.worker_mut(worker)?;
            record.status = WorkerStatus::Busy;
            record.task = Some(id.clone());
            record.last_heartbeat = now;
        }
        let exec = self.task_mut(id)?;
        exec.state = TaskState::Claimed;
        exec.worker = Some(worker.clone());
        exec.claimed_at = Some(now);
        exec.started_at = None;
        exec.finished_at = None;

        let event = self.push_event(
            Event::new(EventKind::TaskClaimed)
                .task(id)
                .worker(worker)
                .level(level),
        );
        Ok((Claim::Acquired, Some(event)))
    }

    /// Apply a guarded transition. Claims go through [`RunState::claim`].
    pub fn transition_task(
        &mut self,
        id: &TaskId,
        to: TaskState,
        meta: TransitionMeta,
    ) -> Result<Event> {
        let level = self.graph.get(id).map(|t| t.level).unwrap_or(0);
        let exec = self.task(id)?;
        let from = exec.state;

        if !from.can_transition_to(to) {
            return Err(Error::InvalidTaskTransition {
                task: id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if let Some(worker) = &meta.worker {
            if from.is_active() && exec.worker.as_ref() != Some(worker) {
                return Err(Error::StaleClaim {
                    task: id.clone(),
                    worker: worker.clone(),
                });
            }
        }

        let now = Utc::now();
        let holder = exec.worker.clone();
        let exec = self.task_mut(id)?;
        exec.state = to;
        match to {
            TaskState::InProgress => {
                exec.started_at = Some(now);
            }
            TaskState::Completed => {
                exec.finished_at = Some(now);
                exec.last_error = None;
                exec.branch = meta.branch.clone();
                exec.commit = meta.commit.clone();
            }
            TaskState::Failed => {
                exec.finished_at = Some(now);
                exec.retry_count += 1;
                exec.last_error = meta.error.clone();
            }
            TaskState::Pending | TaskState::RetryPending => {
                exec.worker = None;
                exec.claimed_at = None;
                if from == TaskState::Blocked || from == TaskState::Completed {
                    exec.retry_count = 0;
                    exec.branch = None;
                    exec.commit = None;
                }
            }
            TaskState::Blocked | TaskState::Claimed => {}
        }
        if let Some(attempt) = meta.attempt {
            exec.attempts.push(attempt);
        }

        // The worker slot is free once the task leaves it.
        if matches!(
            to,
            TaskState::Completed
                | TaskState::Failed
                | TaskState::Pending
                | TaskState::RetryPending
        ) {
            if let Some(record) = holder.as_ref().and_then(|h| self.workers.get_mut(h)) {
                if record.task.as_ref() == Some(id) {
                    record.task = None;
                    if record.status == WorkerStatus::Busy {
                        record.status = WorkerStatus::Idle;
                    }
                }
            }
        }

        let kind = match to {
            TaskState::InProgress => EventKind::TaskStarted,
            TaskState::Completed => EventKind::TaskCompleted,
            TaskState::Failed => EventKind::TaskFailed,
            TaskState::Blocked => EventKind::TaskBlocked,
            _ => EventKind::TaskReleased,
        };
        let mut event = Event::new(kind).task(id).level(level);
        if let Some(worker) = meta.worker.as_ref().or(holder.as_ref()) {
            event = event.worker(worker);
        }
        if let Some(message) = meta.error.or(meta.reason) {
            event = event.message(message);
        } else if kind == EventKind::TaskReleased {
            event = event.message(format!("{} -> {}", from, to));
        }
        Ok(self.push_event(event))
    }

    /// Record a failed attempt and route the task to `retry_pending` or,
    /// once `max_retries` failures are recorded, to `blocked`.
    pub fn record_failure(
        &mut self,
        id: &TaskId,
        worker: &WorkerId,
        attempt: Attempt,
        max_retries: u32,
    ) -> Result<(TaskState, Vec<Event>)> {
        let error = attempt.error.clone();
        let failed = self.transition_task(
            id,
            TaskState::Failed,
            TransitionMeta {
                worker: Some(worker.clone()),
                attempt: Some(attempt),
                error,
                ..Default::default()
            },
        )?;

        let retries = self.task(id)?.retry_count;
        let next = if retries < max_retries {
            TaskState::RetryPending
        } else {
            TaskState::Blocked
        };
        let meta = if next == TaskState::Blocked {
            TransitionMeta::reason(format!("blocked after {} failed attempts", retries))
        } else {
            TransitionMeta::reason(format!("attempt {} of {} failed", retries, max_retries))
        };
        let routed = self.transition_task(id, next, meta)?;
        Ok((next, vec![failed, routed]))
    }

    /// Return an active task to `pending` (no failures yet) or
    /// `retry_pending`. Inactive tasks are left alone.
    pub fn release(&mut self, id: &TaskId, reason: &str) -> Result<Option<Event>> {
        let exec = self.task(id)?;
        if !exec.state.is_active() {
            return Ok(None);
        }
        let to = if exec.retry_count == 0 {
            TaskState::Pending
        } else {
            TaskState::RetryPending
        };
        let event = self.transition_task(id, to, TransitionMeta::reason(reason))?;
        Ok(Some(event))
    }

    // ========== Level transitions ==========

    /// Check the guards for moving level `n` to `to`.
    pub fn check_level_transition(&self, n: u32, to: LevelState) -> Result<()> {
        let record = self.level(n)?;
        let from = record.state;
        let refuse = |reason: String| Error::InvalidLevelTransition {
            level: n,
            from: from.to_string(),
            to: to.to_string(),
            reason,
        };

        match (from, to) {
            (LevelState::Pending, LevelState::Running) => {
                let unmerged: Vec<String> = self
                    .levels
                    .range(..n)
                    .filter(|(_, l)| l.state != LevelState::Merged)
                    .map(|(k, _)| k.to_string())
                    .collect();
                if !unmerged.is_empty() {
                    return Err(refuse(format!(
                        "lower levels not merged: {}",
                        unmerged.join(", ")
                    )));
                }
            }
            (LevelState::Running, LevelState::Gating) => {
                self.require_terminal(n).map_err(refuse)?;
            }
            (LevelState::Gating, LevelState::Merged) => {
                self.require_terminal(n).map_err(refuse)?;
                if !record.gates_passed {
                    return Err(refuse("gates have not passed".to_string()));
                }
                if record.merge_commit.is_none() {
                    return Err(refuse("no merge commit recorded".to_string()));
                }
                let blocked = self.tasks_in_state(n, TaskState::Blocked);
                if !blocked.is_empty() && !record.partial {
                    return Err(refuse(format!(
                        "blocked tasks: {}",
                        join_ids(&blocked)
                    )));
                }
            }
            (LevelState::Gating, LevelState::Blocked) => {}
            (LevelState::Blocked, LevelState::Running) => {}
            _ => return Err(refuse("not a legal level transition".to_string())),
        }
        Ok(())
    }

    fn require_terminal(&self, n: u32) -> std::result::Result<(), String> {
        let open: Vec<String> = self
            .level_task_states(n)
            .into_iter()
            .filter(|(_, state)| !state.is_terminal())
            .map(|(id, state)| format!("{} ({})", id, state))
            .collect();
        if open.is_empty() {
            Ok(())
        } else {
            Err(format!("tasks not terminal: {}", open.join(", ")))
        }
    }

    /// Apply a guarded level transition.
    pub fn transition_level(&mut self, n: u32, to: LevelState) -> Result<Event> {
        self.check_level_transition(n, to)?;
        let now = Utc::now();
        let record = self.level_mut(n)?;
        let from = record.state;
        record.state = to;
        let kind = match to {
            LevelState::Running => {
                if record.started_at.is_none() {
                    record.started_at = Some(now);
                }
                record.finished_at = None;
                record.blocked_reason = None;
                EventKind::LevelStarted
            }
            LevelState::Gating => EventKind::LevelGating,
            LevelState::Merged => {
                record.finished_at = Some(now);
                EventKind::LevelComplete
            }
            LevelState::Blocked => {
                record.finished_at = Some(now);
                EventKind::LevelBlocked
            }
            LevelState::Pending => {
                record.state = from;
                return Err(Error::InvalidLevelTransition {
                    level: n,
                    from: from.to_string(),
                    to: to.to_string(),
                    reason: "levels never return to pending".to_string(),
                });
            }
        };
        let reason = record.blocked_reason.clone();

        if to == LevelState::Running {
            self.current_level = n;
        }

        let mut event = Event::new(kind).level(n);
        if let Some(reason) = reason.filter(|_| to == LevelState::Blocked) {
            event = event.message(reason);
        }
        Ok(self.push_event(event))
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
