//! Core domain models for weir.
//!
//! This module contains the task model, the task graph with its derived
//! levels, and the structural validator that runs before any dispatch.

pub mod graph;
pub mod task;
pub mod validate;

pub use graph::{format_cycle, DependencyGraph, TaskGraph};
pub use task::{normalize_path, FileOwnership, Task, TaskId, Verification};
pub use validate::{validate, ValidationReport};
