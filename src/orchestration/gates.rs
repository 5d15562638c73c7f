//! Quality gates.
//!
//! Gates run against a level's integrated output in the staging worktree.
//! Configured gates run first, in order, then hook gate extensions. When a
//! required gate fails, a narrow fix task is synthesized and handed to the
//! executor in the staging worktree, and all gates run again, up to
//! `remediation.max_attempts` times. A forced stop recorded while gating
//! cancels the running gate or fix task.

use crate::core::{Task, TaskId, Verification};
use crate::error::Result;
use crate::orchestration::context::RunContext;
use crate::orchestration::executor::{run_command, WorkerContext};
use crate::state::{EventKind, GateCheck, WorkerId};
use crate::util;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one gating round.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GateResult {
    /// No required gate failed.
    pub passed: bool,
    pub details: Vec<GateCheck>,
    /// Gating was cut short by a forced stop; `passed` is meaningless.
    pub interrupted: bool,
}

impl GateResult {
    pub fn from_checks(details: Vec<GateCheck>) -> Self {
        Self {
            passed: !details.iter().any(|c| c.is_blocking()),
            details,
            interrupted: false,
        }
    }

    /// Required gates that failed.
    pub fn blocking(&self) -> Vec<&GateCheck> {
        self.details.iter().filter(|c| c.is_blocking()).collect()
    }

    /// One-line summary such as `2/3 gates passed; failed: test`.
    pub fn summary(&self) -> String {
        let passed = self.details.iter().filter(|c| c.passed).count();
        let failed: Vec<&str> = self
            .details
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        if failed.is_empty() {
            format!("{}/{} gates passed", passed, self.details.len())
        } else {
            format!(
                "{}/{} gates passed; failed: {}",
                passed,
                self.details.len(),
                failed.join(", ")
            )
        }
    }
}

pub struct GateRunner {
    ctx: Arc<RunContext>,
}

impl GateRunner {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// Run every configured gate and gate extension once.
    pub async fn run_gates(&self, level: u32, workdir: &Path) -> Result<GateResult> {
        self.check(level, workdir, &self.ctx.cancel).await
    }

    async fn check(&self, level: u32, workdir: &Path, cancel: &CancellationToken) -> Result<GateResult> {
        let mut details = Vec::new();
        let envs = vec![("WEIR_LEVEL".to_string(), level.to_string())];
        for gate in &self.ctx.config.gates {
            debug!(gate = %gate.name, level, "running gate");
            let outcome = run_command(
                &self.ctx.config.executor.shell,
                &gate.command,
                workdir,
                &envs,
                Some(gate.timeout()),
                cancel,
            )
            .await?;
            if outcome.cancelled {
                return Ok(GateResult {
                    interrupted: true,
                    ..GateResult::from_checks(details)
                });
            }
            let passed = outcome.success();
            if !passed {
                let what = format!("gate '{}'", gate.name);
                if gate.required {
                    warn!(gate = %gate.name, level, "{}", outcome.describe(&what));
                } else {
                    info!(gate = %gate.name, level, "optional {}", outcome.describe(&what));
                }
            }
            details.push(GateCheck {
                name: gate.name.clone(),
                command: gate.command.clone(),
                required: gate.required,
                passed,
                exit_code: outcome.exit_code,
                timed_out: outcome.timed_out,
                duration_ms: outcome.duration.as_millis() as u64,
                output: outcome.output,
            });
        }
        details.extend(self.ctx.hooks.run_gates(level, workdir).await);
        Ok(GateResult::from_checks(details))
    }

    /// Gate a level with remediation, recording the final results on the
    /// level record.
    pub async fn gate_level(&self, level: u32, workdir: &Path) -> Result<GateResult> {
        let remediation = &self.ctx.config.remediation;
        let cancel = self.ctx.cancel.child_token();
        let _watch = util::AbortOnDrop(watch_forced_stop(self.ctx.clone(), cancel.clone()));

        // The staging worktree is rebuilt for every gating round, so the
        // remediation budget starts over with it.
        let mut attempts = 0;
        self.ctx
            .store
            .update_level(level, |record| record.remediation_attempts = 0)?;

        let mut result = self.check(level, workdir, &cancel).await?;
        while !result.passed && remediation.enabled && attempts < remediation.max_attempts {
            if cancel.is_cancelled() {
                break;
            }
            attempts += 1;
            self.ctx
                .store
                .update_level(level, |record| record.remediation_attempts = attempts)?;
            let failing: Vec<GateCheck> = result.blocking().into_iter().cloned().collect();
            for check in &failing {
                self.remediate(level, workdir, check, attempts, &cancel).await?;
            }
            result = self.check(level, workdir, &cancel).await?;
        }

        if cancel.is_cancelled() {
            warn!(level, attempts, "gating interrupted by forced stop");
            result.interrupted = true;
            return Ok(result);
        }

        let (details, passed) = (result.details.clone(), result.passed);
        self.ctx.store.update_level(level, |record| {
            record.gate_results = details;
            record.gates_passed = passed;
        })?;
        let summary = result.summary();
        let event = self
            .ctx
            .store
            .emit(EventKind::GatesFinished, |e| e.level(level).message(&summary))?;
        self.ctx.notify(&[event]);
        info!(level, passed, attempts, "{}", summary);
        Ok(result)
    }

    /// One fix pass for a failing gate. Changes are committed to the
    /// staging branch; a failed pass leaves staging untouched.
    async fn remediate(
        &self,
        level: u32,
        workdir: &Path,
        check: &GateCheck,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let task = fix_task(level, check, attempt);
        info!(task = %task.id, gate = %check.name, level, "running remediation");

        let wctx = WorkerContext {
            worker: WorkerId("remediation".to_string()),
            workdir: workdir.to_path_buf(),
            level,
            attempt,
            cancel: cancel.child_token(),
        };
        let executed = tokio::time::timeout(
            self.ctx.config.task_timeout(),
            AssertUnwindSafe(self.ctx.executor.execute(&task, &wctx)).catch_unwind(),
        )
        .await;
        let succeeded = matches!(&executed, Ok(Ok(Ok(result))) if result.is_success());

        let git = self.ctx.git.clone();
        let path = workdir.to_path_buf();
        if succeeded {
            let message = format!("weir({}): {}", task.id, task.title);
            let commit = util::blocking(move || git.commit_all(&path, &message)).await?;
            debug!(task = %task.id, commit = %commit, "remediation committed");
        } else {
            warn!(task = %task.id, "remediation attempt failed");
            util::blocking(move || git.discard_changes(&path)).await?;
        }
        Ok(())
    }
}

/// Poll the state store and cancel `token` once a forced stop is recorded.
fn watch_forced_stop(ctx: Arc<RunContext>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ctx.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let store = ctx.store.clone();
            match util::blocking(move || store.stop_request()).await {
                Ok(Some(stop)) if stop.force => {
                    info!("forced stop requested, cancelling gates");
                    token.cancel();
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "could not read stop request"),
            }
        }
    })
}

/// `fix-L<n>-<gate>-<attempt>`, verified by the failing gate's command.
fn fix_task(level: u32, check: &GateCheck, attempt: u32) -> Task {
    let gate: String = check
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let command = if check.command.is_empty() {
        "true".to_string()
    } else {
        check.command.clone()
    };
    Task {
        id: TaskId::new(format!("fix-L{}-{}-{}", level, gate, attempt)),
        title: format!("Fix failing gate '{}' at level {}", check.name, level),
        description: format!(
            "The gate '{}' failed on the integrated output of level {}.\n\n{}",
            check.name, level, check.output
        ),
        level,
        verification: Verification::new(command),
        ..Default::default()
    }
}
