//! Crash detection and recovery.
//!
//! The `RecoveryEngine` finds claimed or in-progress tasks whose worker has
//! stopped heartbeating (or whose coordinator is gone) and returns them to
//! the runnable pool. A release after a crash does not consume a retry.

use crate::core::TaskId;
use crate::error::Result;
use crate::state::{Event, EventKind, RunState, StateStore, WorkerId, WorkerStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What a sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Workers newly declared crashed.
    pub crashed: Vec<WorkerId>,
    /// Tasks returned to `pending` or `retry_pending`.
    pub released: Vec<TaskId>,
    pub events: Vec<Event>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.crashed.is_empty() && self.released.is_empty()
    }
}

pub struct RecoveryEngine {
    store: Arc<StateStore>,
    timeout: Duration,
}

impl RecoveryEngine {
    pub fn new(store: Arc<StateStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Release tasks held by workers silent for longer than the timeout.
    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now())
    }

    /// [`RecoveryEngine::sweep`] with an explicit clock.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let timeout = chrono::Duration::from_std(self.timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let stale = move |state: &RunState, worker: &WorkerId| match state.workers.get(worker) {
            Some(record) => {
                record.status == WorkerStatus::Crashed
                    || now.signed_duration_since(record.last_heartbeat) > timeout
            }
            None => true,
        };

        // Lock-free check first; most sweeps find nothing to do.
        let snapshot = self.store.load()?;
        let any_stale = snapshot
            .active_tasks()
            .iter()
            .any(|(_, holder)| holder.as_ref().map_or(true, |w| stale(&snapshot, w)));
        if !any_stale {
            return Ok(SweepReport::default());
        }

        let report = self
            .store
            .update(|state| Ok(release_where(state, "heartbeat timeout", stale)))?;
        log_report(&report, "heartbeat sweep");
        Ok(report)
    }

    /// Release everything held by workers of other coordinators.
    ///
    /// Run when a coordinator takes over a run: the previous owner is gone,
    /// so its workers are dead regardless of their last heartbeat.
    pub fn recover_orphans(&self, coordinator: &str) -> Result<SweepReport> {
        let report = self.store.update(|state| {
            // Idle workers of the previous coordinator hold nothing; stop them.
            let mut idle_orphans = Vec::new();
            for record in state.workers.values_mut() {
                if record.coordinator != coordinator
                    && matches!(record.status, WorkerStatus::Idle)
                {
                    record.status = WorkerStatus::Stopped;
                    idle_orphans.push(record.id.clone());
                }
            }
            let orphaned = |state: &RunState, worker: &WorkerId| {
                state
                    .workers
                    .get(worker)
                    .map_or(true, |r| r.coordinator != coordinator)
            };
            let mut report = release_where(state, "coordinator restarted", orphaned);
            // Busy orphans without a task record (crash between claim and
            // bookkeeping) are crashed as well.
            for record in state.workers.values_mut() {
                if record.coordinator != coordinator && record.status == WorkerStatus::Busy {
                    record.status = WorkerStatus::Crashed;
                    record.task = None;
                    report.crashed.push(record.id.clone());
                }
            }
            if !idle_orphans.is_empty() {
                info!(workers = ?idle_orphans, "stopped idle workers of previous coordinator");
            }
            Ok(report)
        })?;
        log_report(&report, "orphan recovery");
        Ok(report)
    }
}

/// Mark the holders of active tasks matching `dead` as crashed and release
/// their tasks.
fn release_where(
    state: &mut RunState,
    reason: &str,
    dead: impl Fn(&RunState, &WorkerId) -> bool,
) -> SweepReport {
    let mut report = SweepReport::default();
    for (task, holder) in state.active_tasks() {
        let is_dead = match &holder {
            Some(worker) => dead(state, worker),
            None => true,
        };
        if !is_dead {
            continue;
        }

        if let Some(worker) = &holder {
            if let Some(record) = state.workers.get_mut(worker) {
                if record.status != WorkerStatus::Crashed {
                    record.status = WorkerStatus::Crashed;
                    report.crashed.push(worker.clone());
                    let event = state.push_event(
                        Event::new(EventKind::WorkerCrashed)
                            .worker(worker)
                            .task(&task)
                            .message(reason),
                    );
                    report.events.push(event);
                }
            }
        }
        match state.release(&task, reason) {
            Ok(Some(event)) => {
                report.released.push(task.clone());
                report.events.push(event);
            }
            Ok(None) => {}
            Err(e) => warn!(task = %task, error = %e, "could not release task"),
        }
    }
    report
}

fn log_report(report: &SweepReport, what: &str) {
    if report.is_empty() {
        return;
    }
    warn!(
        crashed = ?report.crashed,
        released = ?report.released,
        "{} recovered work",
        what
    );
}
