//! Worker pool.
//!
//! The `WorkerPool` owns this coordinator's worker slots. Each slot is an
//! isolated git worktree on its own branch (`weir/<run>/worker-<n>`) and a
//! cancellation token. Slots are reused across tasks and levels; a slot
//! whose worker was declared crashed is retired and never reused.

use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::orchestration::context::RunContext;
use crate::state::{EventKind, WorkerId, WorkerStatus};
use crate::util;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A worker slot owned by this coordinator.
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub id: WorkerId,
    pub branch: String,
    pub workdir: PathBuf,
    /// Task currently running in the slot.
    pub task: Option<TaskId>,
    pub cancel: CancellationToken,
}

impl WorkerSlot {
    pub fn is_idle(&self) -> bool {
        self.task.is_none()
    }
}

/// Bounded set of worker slots.
pub struct WorkerPool {
    ctx: Arc<RunContext>,
    slots: BTreeMap<WorkerId, WorkerSlot>,
    /// Slots dropped after a crash; their worktrees are removed on shutdown.
    retired: Vec<WorkerSlot>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(ctx: Arc<RunContext>, max_workers: usize) -> Self {
        Self {
            ctx,
            slots: BTreeMap::new(),
            retired: Vec::new(),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn busy_count(&self) -> usize {
        self.slots.values().filter(|s| !s.is_idle()).count()
    }

    /// Whether another task can start now.
    pub fn has_capacity(&self) -> bool {
        self.busy_count() < self.max_workers
    }

    pub fn get(&self, id: &WorkerId) -> Option<&WorkerSlot> {
        self.slots.get(id)
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.slots.contains_key(id)
    }

    /// An idle slot, spawning a new worker when none is free.
    ///
    /// New worktrees start from `baseline`.
    pub async fn acquire(&mut self, baseline: &str) -> Result<WorkerSlot> {
        if let Some(slot) = self.slots.values().find(|s| s.is_idle()) {
            return Ok(slot.clone());
        }
        if self.slots.len() >= self.max_workers {
            return Err(Error::WorkerPoolFull {
                max: self.max_workers,
            });
        }
        self.spawn(baseline).await
    }

    async fn spawn(&mut self, baseline: &str) -> Result<WorkerSlot> {
        let record = self.ctx.store.register_worker(&self.ctx.coordinator)?;
        let id = record.id;
        let branch = self.ctx.worker_branch(&id);
        let workdir = self.ctx.worktree_root().join(id.as_str());

        let git = self.ctx.git.clone();
        let (b, w, start) = (branch.clone(), workdir.clone(), baseline.to_string());
        util::blocking(move || git.create_worktree(&b, &w, &start)).await?;

        let (b, w) = (branch.clone(), workdir.clone());
        self.ctx.store.update_worker(&id, |record| {
            record.branch = Some(b);
            record.workdir = Some(w);
        })?;
        let event = self
            .ctx
            .store
            .emit(EventKind::WorkerSpawned, |e| e.worker(&id).message(&branch))?;
        self.ctx.notify(&[event]);
        info!(worker = %id, branch = %branch, "worker spawned");

        let slot = WorkerSlot {
            id: id.clone(),
            branch,
            workdir,
            task: None,
            cancel: self.ctx.cancel.child_token(),
        };
        self.slots.insert(id, slot.clone());
        Ok(slot)
    }

    /// Mark a slot as running `task`.
    pub fn assign(&mut self, id: &WorkerId, task: &TaskId) -> Result<()> {
        let slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))?;
        slot.task = Some(task.clone());
        Ok(())
    }

    /// Return a slot to the idle set. Unknown (retired) ids are ignored.
    pub fn release(&mut self, id: &WorkerId) {
        if let Some(slot) = self.slots.get_mut(id) {
            slot.task = None;
        }
    }

    /// Drop a slot whose worker was declared crashed and cancel its work.
    pub fn retire(&mut self, id: &WorkerId) -> Option<WorkerSlot> {
        let slot = self.slots.remove(id)?;
        slot.cancel.cancel();
        warn!(worker = %id, task = ?slot.task, "worker retired");
        self.retired.push(slot.clone());
        Some(slot)
    }

    /// Cancel every running task (forced stop).
    pub fn cancel_all(&self) {
        for slot in self.slots.values() {
            slot.cancel.cancel();
        }
    }

    /// Move every live worker onto `target` (after a level merge).
    pub async fn reset_all(&self, target: &str) -> Result<()> {
        for slot in self.slots.values() {
            let git = self.ctx.git.clone();
            let (workdir, target_ref) = (slot.workdir.clone(), target.to_string());
            let commit =
                util::blocking(move || git.reset_worktree_to(&workdir, &target_ref)).await?;
            debug!(worker = %slot.id, commit = %commit, "worker reset onto baseline");
        }
        Ok(())
    }

    /// Remove every worktree this pool created.
    ///
    /// With `delete_branches` every worker branch of the run goes as well,
    /// including those left by earlier coordinators; keep them when pausing,
    /// since completed but unmerged work lives on them.
    pub async fn shutdown(&mut self, delete_branches: bool) -> Result<()> {
        let slots: Vec<WorkerSlot> = std::mem::take(&mut self.slots)
            .into_values()
            .chain(self.retired.drain(..))
            .collect();
        for slot in slots {
            slot.cancel.cancel();
            let git = self.ctx.git.clone();
            let (workdir, branch) = (slot.workdir.clone(), slot.branch.clone());
            let removed = util::blocking(move || {
                git.remove_worktree(&workdir)?;
                if delete_branches {
                    git.delete_branch(&branch)?;
                }
                Ok(())
            })
            .await;
            if let Err(e) = removed {
                warn!(worker = %slot.id, error = %e, "failed to remove worker worktree");
            }
            // Crashed stays crashed; everything else is stopped.
            self.ctx.store.update_worker(&slot.id, |record| {
                if record.status != WorkerStatus::Crashed {
                    record.status = WorkerStatus::Stopped;
                }
                record.task = None;
            })?;
        }
        if delete_branches {
            let git = self.ctx.git.clone();
            let prefix = self.ctx.worker_branch_prefix();
            let swept = util::blocking(move || {
                git.prune_worktrees()?;
                let branches = git.branches_with_prefix(&prefix)?;
                for branch in &branches {
                    git.delete_branch(branch)?;
                }
                Ok(branches.len())
            })
            .await;
            match swept {
                Ok(count) => debug!(run = %self.ctx.run_id, count, "worker branches deleted"),
                Err(e) => warn!(run = %self.ctx.run_id, error = %e, "failed to delete worker branches"),
            }
        }
        info!(run = %self.ctx.run_id, "worker pool shut down");
        Ok(())
    }
}
