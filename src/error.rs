use thiserror::Error;

use crate::core::TaskId;
use crate::state::WorkerId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid task graph: {}", .0.join("; "))]
    Graph(Vec<String>),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Level not found: {0}")]
    LevelNotFound(u32),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Invalid transition for task {task} from {from} to {to}")]
    InvalidTaskTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Invalid transition for level {level} from {from} to {to}: {reason}")]
    InvalidLevelTransition {
        level: u32,
        from: String,
        to: String,
        reason: String,
    },

    #[error("Task {task} is no longer claimed by worker {worker}")]
    StaleClaim { task: TaskId, worker: WorkerId },

    #[error("Merge anomaly at level {level}: conflicting files {}", .conflicts.join(", "))]
    MergeAnomaly { level: u32, conflicts: Vec<String> },

    #[error("Worker pool is full (max: {max})")]
    WorkerPoolFull { max: usize },

    #[error("State lock error: {0}")]
    StateLock(String),

    #[error("No run state found in {0}")]
    NoRunState(std::path::PathBuf),

    #[error("A run is already in progress: {0}")]
    RunExists(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
