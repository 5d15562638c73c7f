use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Directory under the repository root holding config, state and worktrees.
pub const WEIR_DIR: &str = ".weir";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_workers: usize,
    /// Failed attempts before a task is blocked.
    pub max_retries: u32,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub task_timeout_secs: u64,
    pub allow_partial_advance: bool,
    pub enforce_ownership: bool,
    /// Defaults to the branch checked out when the run starts.
    pub baseline_branch: Option<String>,
    pub state_dir: PathBuf,
    pub worktree_dir: PathBuf,
    pub executor: ExecutorConfig,
    pub gates: Vec<GateConfig>,
    pub remediation: RemediationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_retries: 3,
            heartbeat_interval_secs: 5,
            heartbeat_timeout_secs: 60,
            poll_interval_ms: 500,
            task_timeout_secs: 3600,
            allow_partial_advance: false,
            enforce_ownership: true,
            baseline_branch: None,
            state_dir: PathBuf::from(".weir/state"),
            worktree_dir: PathBuf::from(".weir/worktrees"),
            executor: ExecutorConfig::default(),
            gates: Vec::new(),
            remediation: RemediationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Command the built-in launcher runs for every task.
    pub command: Option<String>,
    pub shell: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: None,
            shell: "sh".to_string(),
        }
    }
}

/// A verification command run against a level's integrated output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    pub command: String,
    #[serde(default = "default_gate_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_gate_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl GateConfig {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            timeout_secs: default_gate_timeout(),
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    pub enabled: bool,
    /// Fix passes per gating before the level is blocked.
    pub max_attempts: u32,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 1,
        }
    }
}

impl Config {
    pub fn weir_dir(repo: &Path) -> PathBuf {
        repo.join(WEIR_DIR)
    }

    pub fn config_path(repo: &Path) -> PathBuf {
        Self::weir_dir(repo).join("weir.toml")
    }

    /// Load `<repo>/.weir/weir.toml`, falling back to defaults when absent.
    pub fn load(repo: &Path) -> Result<Self> {
        let path = Self::config_path(repo);
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        debug!(
            max_workers = config.max_workers,
            max_retries = config.max_retries,
            gates = config.gates.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self, repo: &Path) -> Result<()> {
        let dir = Self::weir_dir(repo);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path(repo);
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".to_string()));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        if self.poll_interval() * 2 >= self.heartbeat_timeout() {
            return Err(Error::Config(format!(
                "poll_interval_ms ({}) must stay well under heartbeat_timeout_secs ({})",
                self.poll_interval_ms, self.heartbeat_timeout_secs
            )));
        }
        if self.heartbeat_interval_secs >= self.heartbeat_timeout_secs {
            return Err(Error::Config(format!(
                "heartbeat_interval_secs ({}) must be below heartbeat_timeout_secs ({})",
                self.heartbeat_interval_secs, self.heartbeat_timeout_secs
            )));
        }
        if let Some(gate) = self.gates.iter().find(|g| g.command.trim().is_empty()) {
            return Err(Error::Config(format!("gate '{}' has no command", gate.name)));
        }
        Ok(())
    }

    /// Resolve a configured directory against the repository root.
    pub fn resolve(&self, repo: &Path, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            repo.join(dir)
        }
    }

    pub fn state_dir(&self, repo: &Path) -> PathBuf {
        self.resolve(repo, &self.state_dir)
    }

    pub fn worktree_dir(&self, repo: &Path) -> PathBuf {
        self.resolve(repo, &self.worktree_dir)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}
