//! Orchestration layer for weir.
//!
//! The `LevelController` drives a run level by level. For each level the
//! `WorkerDispatcher` keeps a bounded pool of git-isolated workers busy, the
//! `RecoveryEngine` releases claims of silent workers, the
//! `MergeCoordinator` stages the level's branches, the `GateRunner` checks
//! the staged result, and the baseline only moves once gates pass.
//! Extensions plug in through the `HookRegistry`.

mod context;
mod controller;
mod dispatcher;
mod executor;
mod gates;
mod hooks;
mod merge;
mod pool;
mod recovery;

#[cfg(test)]
mod testing;

pub use context::{resolve_executor, RunContext};
pub use controller::{
    request_stop, retry_level, retry_task, status, LevelController, LevelStatus, RunOutcome,
    StatusReport, TaskStatusLine, WorkerStatusLine,
};
pub use dispatcher::{DispatchOutcome, RunnerReport, TaskOutcome, WorkerDispatcher};
pub use executor::{
    run_command, CommandExecutor, CommandOutcome, ExecutionResult, TaskExecutor, WorkerContext,
    OUTPUT_TAIL_LINES,
};
pub use gates::{GateResult, GateRunner};
pub use hooks::{GateExtension, GateOutcome, HookRegistry, LifecycleObserver};
pub use merge::{MergeCoordinator, MergeResult};
pub use pool::{WorkerPool, WorkerSlot};
pub use recovery::{RecoveryEngine, SweepReport};
