//! Task execution.
//!
//! The orchestrator treats the unit of work as an opaque `TaskExecutor`:
//! it hands over a task and an isolated working directory and only looks at
//! the exit status. `CommandExecutor` is the built-in launcher that runs a
//! configured shell command in the worker's worktree.

use crate::core::Task;
use crate::error::{Error, Result};
use crate::state::WorkerId;
use crate::util;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lines of output kept for attempts and gate results.
pub const OUTPUT_TAIL_LINES: usize = 40;

/// Everything an executor needs to know about where it runs.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub worker: WorkerId,
    /// Isolated worktree the executor must confine its changes to.
    pub workdir: PathBuf,
    pub level: u32,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled on forced stop or when the worker is declared crashed.
    pub cancel: CancellationToken,
}

/// What an executor reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    /// Files the executor declares as its output.
    pub artifacts: Vec<PathBuf>,
    /// Tail of the executor's output, kept for diagnostics.
    pub output: String,
}

impl ExecutionResult {
    pub fn success() -> Self {
        Self {
            exit_code: 0,
            artifacts: Vec::new(),
            output: String::new(),
        }
    }

    pub fn failure(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            artifacts: Vec::new(),
            output: output.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Performs the work of a single task inside a worker's worktree.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "executor"
    }

    async fn execute(&self, task: &Task, ctx: &WorkerContext) -> Result<ExecutionResult>;
}

/// Outcome of running an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when the process was killed or terminated by a signal.
    pub exit_code: Option<i32>,
    /// Tail of combined stdout and stderr.
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// One-line description of a failure.
    pub fn describe(&self, what: &str) -> String {
        if self.cancelled {
            format!("{} cancelled", what)
        } else if self.timed_out {
            format!("{} timed out after {:?}", what, self.duration)
        } else {
            match self.exit_code {
                Some(code) => format!("{} exited with code {}", what, code),
                None => format!("{} terminated by signal", what),
            }
        }
    }
}

/// Run `<shell> -c <command>` in `cwd`, bounded by `timeout` and `cancel`.
///
/// The child is killed when the timeout expires or the token is cancelled.
pub async fn run_command(
    shell: &str,
    command: &str,
    cwd: &Path,
    envs: &[(String, String)],
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<CommandOutcome> {
    debug!(command, cwd = %cwd.display(), "run_command");
    let started = Instant::now();

    let mut cmd = Command::new(shell);
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let child = cmd
        .spawn()
        .map_err(|e| Error::Executor(format!("failed to spawn '{}': {}", command, e)))?;

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    // Dropping the pending future drops the child, which kills it.
    let outcome = tokio::select! {
        output = child.wait_with_output() => {
            let output = output?;
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.is_empty() {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&stderr);
            }
            CommandOutcome {
                exit_code: output.status.code(),
                output: util::tail(&text, OUTPUT_TAIL_LINES),
                timed_out: false,
                cancelled: false,
                duration: started.elapsed(),
            }
        }
        _ = deadline => CommandOutcome {
            exit_code: None,
            output: String::new(),
            timed_out: true,
            cancelled: false,
            duration: started.elapsed(),
        },
        _ = cancel.cancelled() => CommandOutcome {
            exit_code: None,
            output: String::new(),
            timed_out: false,
            cancelled: true,
            duration: started.elapsed(),
        },
    };

    debug!(
        command,
        exit_code = ?outcome.exit_code,
        timed_out = outcome.timed_out,
        cancelled = outcome.cancelled,
        "command finished"
    );
    Ok(outcome)
}

/// Built-in launcher: runs one shell command per task in the worktree.
///
/// The task is described to the command through environment variables and
/// a JSON copy of the task at `WEIR_TASK_FILE`.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
    command: String,
    task_dir: PathBuf,
}

impl CommandExecutor {
    /// `task_dir` receives `<id>.json` task files.
    pub fn new(shell: &str, command: &str, task_dir: &Path) -> Result<Self> {
        if command.trim().is_empty() {
            return Err(Error::Config("executor.command is empty".to_string()));
        }
        which::which(shell)
            .map_err(|e| Error::Executor(format!("shell '{}' not found: {}", shell, e)))?;
        Ok(Self {
            shell: shell.to_string(),
            command: command.to_string(),
            task_dir: task_dir.to_path_buf(),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn write_task_file(&self, task: &Task) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.task_dir)?;
        let path = self.task_dir.join(format!("{}.json", task.id));
        std::fs::write(&path, serde_json::to_vec_pretty(task)?)?;
        Ok(path)
    }

    fn env(task: &Task, ctx: &WorkerContext, task_file: &Path) -> Vec<(String, String)> {
        vec![
            ("WEIR_TASK_ID".to_string(), task.id.to_string()),
            ("WEIR_TASK_TITLE".to_string(), task.title.clone()),
            ("WEIR_TASK_LEVEL".to_string(), task.level.to_string()),
            ("WEIR_WORKER_ID".to_string(), ctx.worker.to_string()),
            ("WEIR_ATTEMPT".to_string(), ctx.attempt.to_string()),
            (
                "WEIR_TASK_FILE".to_string(),
                task_file.display().to_string(),
            ),
            ("WEIR_VERIFY".to_string(), task.verification.command.clone()),
        ]
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute(&self, task: &Task, ctx: &WorkerContext) -> Result<ExecutionResult> {
        let task_file = self.write_task_file(task)?;
        let envs = Self::env(task, ctx, &task_file);
        // The per-attempt timeout is applied by the dispatcher.
        let outcome = run_command(
            &self.shell,
            &self.command,
            &ctx.workdir,
            &envs,
            None,
            &ctx.cancel,
        )
        .await?;

        if outcome.cancelled {
            return Err(Error::Executor(outcome.describe("executor")));
        }
        Ok(ExecutionResult {
            exit_code: outcome.exit_code.unwrap_or(-1),
            artifacts: Vec::new(),
            output: outcome.output,
        })
    }
}
