//! Persistent run state.
//!
//! `record` holds the persisted types and their transition guards,
//! `event` the lifecycle event log, and `store` the locked, atomically
//! replaced state file every component mutates through.

pub mod event;
pub mod record;
pub mod store;

pub use event::{Event, EventKind};
pub use record::{
    Attempt, Claim, GateCheck, LevelRecord, LevelState, RunState, RunStatus, StopRequest,
    TaskExecution, TaskState, TransitionMeta, WorkerId, WorkerRecord, WorkerStatus,
};
pub use store::StateStore;
