//! Level integration.
//!
//! Completed work is integrated in two steps. `stage_level` rebuilds the
//! run's staging branch from the baseline plus every worker branch of the
//! level, and syncs the staging worktree so gates can run against it.
//! `merge_level` then moves the baseline onto staging. Worker branches are
//! never merged into the baseline directly.
//!
//! Exclusive file ownership makes conflicts impossible for a valid graph, so
//! any conflict is reported as an anomaly together with the tasks whose
//! output could not be integrated.

use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::git::MergeOutcome;
use crate::orchestration::context::RunContext;
use crate::state::EventKind;
use crate::util;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of integrating a level.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeResult {
    pub success: bool,
    /// Head of the target branch after integration.
    pub commit: Option<String>,
    pub conflicts: Vec<String>,
    /// Tasks whose branches conflicted.
    pub offending: Vec<TaskId>,
}

impl MergeResult {
    fn clean(commit: String) -> Self {
        Self {
            success: true,
            commit: Some(commit),
            ..Default::default()
        }
    }

    /// The anomaly error for a failed integration.
    pub fn anomaly(&self, level: u32) -> Error {
        Error::MergeAnomaly {
            level,
            conflicts: self.conflicts.clone(),
        }
    }
}

pub struct MergeCoordinator {
    ctx: Arc<RunContext>,
}

impl MergeCoordinator {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// Rebuild staging as baseline plus the level's completed branches.
    ///
    /// Each branch is merged at the commit recorded by its last completed
    /// task, so unrecorded commits on a worker branch never reach staging.
    pub async fn stage_level(&self, level: u32) -> Result<MergeResult> {
        let state = self.ctx.store.load()?;
        let baseline = state.baseline_branch.clone();
        let staging = state.staging_branch.clone();

        let mut sources: Vec<(String, String, Vec<TaskId>)> = Vec::new();
        for (branch, tasks) in state.completed_branches(level) {
            let commit = tasks
                .last()
                .and_then(|id| state.tasks.get(id))
                .and_then(|exec| exec.commit.clone());
            match commit {
                Some(commit) => sources.push((branch, commit, tasks)),
                None => warn!(branch = %branch, level, "completed branch has no recorded commit"),
            }
        }

        let git = self.ctx.git.clone();
        let workdir = self.ctx.staging_workdir();
        let result = util::blocking(move || {
            git.set_branch(&staging, &baseline)?;
            let mut result = MergeResult::default();
            for (branch, commit, tasks) in sources {
                let message = format!("weir: merge {} (level {})", branch, level);
                match git.merge_branch(&staging, &commit, &message)? {
                    MergeOutcome::Conflicts { files } => {
                        error!(branch = %branch, level, ?files, "conflict while staging level");
                        result.conflicts.extend(files);
                        result.offending.extend(tasks);
                    }
                    outcome => {
                        debug!(branch = %branch, commit = ?outcome.commit(), "branch staged");
                    }
                }
            }
            git.create_worktree(&staging, &workdir, &baseline)?;
            let head = git.reset_worktree_to(&workdir, &staging)?;
            result.conflicts.sort();
            result.conflicts.dedup();
            result.success = result.conflicts.is_empty();
            result.commit = Some(head);
            Ok(result)
        })
        .await?;

        if !result.success {
            let conflicts = result.conflicts.clone();
            self.ctx
                .store
                .update_level(level, |record| record.conflicts = conflicts)?;
        }
        info!(
            level,
            success = result.success,
            commit = ?result.commit,
            "level staged"
        );
        Ok(result)
    }

    /// Move the baseline onto staging and record the merge commit.
    ///
    /// The main checkout is refreshed when it was on the baseline with no
    /// local changes before the merge.
    pub async fn merge_level(&self, level: u32) -> Result<MergeResult> {
        let state = self.ctx.store.load()?;
        let baseline = state.baseline_branch.clone();
        let staging = state.staging_branch.clone();

        let git = self.ctx.git.clone();
        let outcome = util::blocking(move || {
            let clean = git.main_worktree_clean_on(&baseline)?;
            let message = format!("weir: integrate level {}", level);
            let outcome = git.merge_branch(&baseline, &staging, &message)?;
            let moved = matches!(
                outcome,
                MergeOutcome::FastForward { .. } | MergeOutcome::Merged { .. }
            );
            if clean && moved {
                git.refresh_checkout()?;
            } else if moved {
                warn!(branch = %baseline, "main checkout not refreshed: not clean on the baseline");
            }
            Ok(outcome)
        })
        .await?;

        let commit = match outcome {
            MergeOutcome::Conflicts { files } => {
                error!(level, ?files, "conflict merging staging into baseline");
                let conflicts = files.clone();
                self.ctx
                    .store
                    .update_level(level, |record| record.conflicts = conflicts)?;
                return Ok(MergeResult {
                    success: false,
                    commit: None,
                    conflicts: files,
                    offending: Vec::new(),
                });
            }
            MergeOutcome::UpToDate { commit }
            | MergeOutcome::FastForward { commit }
            | MergeOutcome::Merged { commit } => commit,
        };
        let result = MergeResult::clean(commit);

        let commit = result.commit.clone();
        self.ctx.store.update_level(level, |record| {
            record.merge_commit = commit;
            record.conflicts.clear();
        })?;
        let message = result.commit.clone().unwrap_or_default();
        let event = self
            .ctx
            .store
            .emit(EventKind::MergeComplete, |e| e.level(level).message(message))?;
        self.ctx.notify(&[event]);
        info!(level, commit = ?result.commit, "level merged into baseline");
        Ok(result)
    }
}
