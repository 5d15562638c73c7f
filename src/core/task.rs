//! Task data model for the level-gated task graph.
//!
//! Tasks are the atomic units of work handed to workers. A task declares
//! the wave (level) it runs in, the tasks it depends on, the files it owns
//! exclusively and the command that verifies its output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

/// Identifier of a task within a graph, as written in the graph file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Files a task touches.
///
/// `create` and `modify` are exclusive within a level; `read` may overlap
/// freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileOwnership {
    #[serde(default)]
    pub create: Vec<PathBuf>,
    #[serde(default)]
    pub modify: Vec<PathBuf>,
    #[serde(default)]
    pub read: Vec<PathBuf>,
}

impl FileOwnership {
    /// The exclusive set: `create ∪ modify`, in normalized form.
    ///
    /// Paths that cannot be normalized are kept as written; validation
    /// rejects them before a run starts.
    pub fn owned(&self) -> BTreeSet<PathBuf> {
        self.create
            .iter()
            .chain(self.modify.iter())
            .map(|p| normalize_path(p).unwrap_or_else(|| p.clone()))
            .collect()
    }

    /// Whether `path` (relative to the repository root) is owned.
    pub fn owns(&self, path: &Path) -> bool {
        match normalize_path(path) {
            Some(path) => self.owned().contains(&path),
            None => false,
        }
    }

    /// Every declared path that is not a plain repository-relative path.
    pub fn invalid_paths(&self) -> Vec<&PathBuf> {
        self.create
            .iter()
            .chain(self.modify.iter())
            .chain(self.read.iter())
            .filter(|p| normalize_path(p).is_none())
            .collect()
    }
}

/// Repository-relative form of `path` with `.` segments dropped.
///
/// Returns `None` for absolute paths, paths containing `..` and paths that
/// name nothing.
pub fn normalize_path(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Command that checks a task's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(default)]
    pub command: String,
    #[serde(default = "default_verification_timeout")]
    pub timeout_secs: u64,
}

fn default_verification_timeout() -> u64 {
    120
}

impl Default for Verification {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout_secs: default_verification_timeout(),
        }
    }
}

impl Verification {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

/// A single task in the graph.
///
/// Missing fields deserialize to empty defaults so that the validator can
/// report them instead of the parser rejecting the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Task {
    #[serde(default)]
    pub id: TaskId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Execution wave, starting at 1.
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub files: FileOwnership,
    #[serde(default)]
    pub verification: Verification,
    /// Later tasks that import this task's output.
    #[serde(default)]
    pub consumers: Vec<TaskId>,
    /// Cross-task test exercising this task together with its consumers.
    #[serde(default)]
    pub integration_test: Option<String>,
    /// Marks a task as intentionally not reachable from level 1.
    #[serde(default)]
    pub terminal: bool,
}

impl Task {
    /// Create a task with the given id, title and level and an empty
    /// ownership set.
    pub fn new(id: &str, title: &str, level: u32) -> Self {
        Self {
            id: TaskId::new(id),
            title: title.to_string(),
            level,
            ..Default::default()
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| TaskId::new(*d)).collect();
        self
    }

    pub fn creates(mut self, path: &str) -> Self {
        self.files.create.push(PathBuf::from(path));
        self
    }

    pub fn modifies(mut self, path: &str) -> Self {
        self.files.modify.push(PathBuf::from(path));
        self
    }

    pub fn reads(mut self, path: &str) -> Self {
        self.files.read.push(PathBuf::from(path));
        self
    }

    pub fn verified_by(mut self, command: &str) -> Self {
        self.verification = Verification::new(command);
        self
    }

    pub fn with_consumers(mut self, consumers: &[&str], integration_test: Option<&str>) -> Self {
        self.consumers = consumers.iter().map(|c| TaskId::new(*c)).collect();
        self.integration_test = integration_test.map(String::from);
        self
    }

    /// Short label used in commit messages and logs.
    pub fn label(&self) -> String {
        format!("{}: {}", self.id, self.title)
    }
}
