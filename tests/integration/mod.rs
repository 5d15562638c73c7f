//! Integration test suite for weir.
//!
//! These tests drive the public API against real git repositories in
//! temporary directories, with a scripted executor standing in for the
//! external task launcher.
//!
//! # Test Categories
//!
//! - `validation`: task graph validation before any dispatch
//! - `state_store`: atomic claims and guarded transitions
//! - `level_flow`: end-to-end level execution, gating and merging
//! - `recovery`: heartbeat timeouts and crash-then-resume
//!
//! # CI Compatibility
//!
//! No external tools are required: repositories are created through git2
//! and task commands are plain `sh` builtins.

mod fixtures;

mod level_flow;
mod recovery;
mod state_store;
mod validation;
