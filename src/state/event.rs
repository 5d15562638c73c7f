//! Lifecycle events.
//!
//! Every state change worth observing is appended to the run's event log
//! and handed to registered lifecycle observers.

use crate::core::TaskId;
use crate::state::record::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    WorkerSpawned,
    WorkerCrashed,
    TaskClaimed,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskBlocked,
    TaskReleased,
    LevelStarted,
    LevelGating,
    GatesFinished,
    LevelComplete,
    LevelBlocked,
    MergeComplete,
    RunPaused,
    RunFinished,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::RunStarted => "run_started",
            EventKind::WorkerSpawned => "worker_spawned",
            EventKind::WorkerCrashed => "worker_crashed",
            EventKind::TaskClaimed => "task_claimed",
            EventKind::TaskStarted => "task_started",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskBlocked => "task_blocked",
            EventKind::TaskReleased => "task_released",
            EventKind::LevelStarted => "level_started",
            EventKind::LevelGating => "level_gating",
            EventKind::GatesFinished => "gates_finished",
            EventKind::LevelComplete => "level_complete",
            EventKind::LevelBlocked => "level_blocked",
            EventKind::MergeComplete => "merge_complete",
            EventKind::RunPaused => "run_paused",
            EventKind::RunFinished => "run_finished",
        };
        write!(f, "{}", name)
    }
}

/// A timestamped, typed entry in the run's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the log, starting at 1.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Event {
    /// An event with no sequence number yet; the store assigns one when
    /// appending.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: 0,
            at: Utc::now(),
            kind,
            task: None,
            worker: None,
            level: None,
            message: None,
        }
    }

    pub fn task(mut self, task: &TaskId) -> Self {
        self.task = Some(task.clone());
        self
    }

    pub fn worker(mut self, worker: &WorkerId) -> Self {
        self.worker = Some(worker.clone());
        self
    }

    pub fn level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {} {}", self.seq, self.at.format("%H:%M:%S"), self.kind)?;
        if let Some(level) = self.level {
            write!(f, " level={}", level)?;
        }
        if let Some(task) = &self.task {
            write!(f, " task={}", task)?;
        }
        if let Some(worker) = &self.worker {
            write!(f, " worker={}", worker)?;
        }
        if let Some(message) = &self.message {
            write!(f, " ({})", message)?;
        }
        Ok(())
    }
}
