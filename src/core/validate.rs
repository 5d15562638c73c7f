//! Structural validation of a task graph.
//!
//! Checks run in a fixed order: schema, per-level file ownership, cycles,
//! reference resolution, reachability and integration-test coverage.
//! Reachability only produces warnings; everything else is fatal.

use crate::core::graph::{format_cycle, TaskGraph};
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use tracing::warn;

/// Outcome of validating a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ValidationReport {
    pub ok: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Log warnings and turn errors into [`Error::Graph`].
    pub fn into_result(self) -> Result<Vec<String>> {
        for warning in &self.warnings {
            warn!(warning = %warning, "task graph warning");
        }
        if self.ok {
            Ok(self.warnings)
        } else {
            Err(Error::Graph(self.errors))
        }
    }
}

/// Validate `graph`, collecting every problem rather than stopping at the
/// first.
pub fn validate(graph: &TaskGraph) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    check_schema(graph, &mut errors);
    check_ownership(graph, &mut errors);
    check_cycles(graph, &mut errors);
    check_references(graph, &mut errors);
    check_reachability(graph, &mut warnings);
    check_integration_tests(graph, &mut errors);

    ValidationReport::from_parts(errors, warnings)
}

fn check_schema(graph: &TaskGraph, errors: &mut Vec<String>) {
    if graph.tasks.is_empty() {
        errors.push("graph has no tasks".to_string());
        return;
    }

    let mut seen: HashSet<&TaskId> = HashSet::new();
    for (index, task) in graph.tasks.iter().enumerate() {
        if task.id.is_empty() {
            errors.push(format!("task #{}: missing id", index + 1));
            continue;
        }
        if !seen.insert(&task.id) {
            errors.push(format!("duplicate task id {}", task.id));
        }
        if task.title.trim().is_empty() {
            errors.push(format!("task {}: missing title", task.id));
        }
        if task.level == 0 {
            errors.push(format!(
                "task {}: level must be a positive integer",
                task.id
            ));
        }
        if task.verification.command.trim().is_empty() {
            errors.push(format!("task {}: missing verification command", task.id));
        }
        for path in task.files.invalid_paths() {
            errors.push(format!(
                "task {}: path {} must be relative to the repository root",
                task.id,
                path.display()
            ));
        }
    }
}

fn check_ownership(graph: &TaskGraph, errors: &mut Vec<String>) {
    let mut by_level: BTreeMap<u32, HashMap<PathBuf, &TaskId>> = BTreeMap::new();

    for task in &graph.tasks {
        let owners = by_level.entry(task.level).or_default();
        for path in task.files.owned() {
            match owners.get(&path) {
                Some(owner) if *owner != &task.id => {
                    errors.push(format!(
                        "level {}: tasks {} and {} both own {}",
                        task.level,
                        owner,
                        task.id,
                        path.display()
                    ));
                }
                Some(_) => {}
                None => {
                    owners.insert(path, &task.id);
                }
            }
        }
    }
}

fn check_cycles(graph: &TaskGraph, errors: &mut Vec<String>) {
    for cycle in graph.dependency_graph().find_cycles() {
        errors.push(format!("dependency cycle: {}", format_cycle(&cycle)));
    }
}

fn check_references(graph: &TaskGraph, errors: &mut Vec<String>) {
    let levels: HashMap<&TaskId, u32> = graph.tasks.iter().map(|t| (&t.id, t.level)).collect();

    for task in &graph.tasks {
        for dep in &task.dependencies {
            match levels.get(dep) {
                None => errors.push(format!("task {}: unknown dependency {}", task.id, dep)),
                Some(&dep_level) if dep_level >= task.level && dep != &task.id => {
                    errors.push(format!(
                        "task {}: dependency {} is at level {}, not below level {}",
                        task.id, dep, dep_level, task.level
                    ));
                }
                Some(_) => {}
            }
        }
        for consumer in &task.consumers {
            if !levels.contains_key(consumer) {
                errors.push(format!("task {}: unknown consumer {}", task.id, consumer));
            }
        }
    }
}

fn check_reachability(graph: &TaskGraph, warnings: &mut Vec<String>) {
    let roots: Vec<TaskId> = graph
        .tasks
        .iter()
        .filter(|t| t.level == 1)
        .map(|t| t.id.clone())
        .collect();
    let reached = graph.dependency_graph().dependents_closure(&roots);

    for task in &graph.tasks {
        if task.level > 1 && !task.terminal && !reached.contains(&task.id) {
            warnings.push(format!(
                "task {} (level {}) is not reachable from any level-1 task",
                task.id, task.level
            ));
        }
    }
}

fn check_integration_tests(graph: &TaskGraph, errors: &mut Vec<String>) {
    for task in &graph.tasks {
        let missing = task
            .integration_test
            .as_deref()
            .map(|t| t.trim().is_empty())
            .unwrap_or(true);
        if !task.consumers.is_empty() && missing {
            errors.push(format!(
                "task {}: has consumers but no integration_test",
                task.id
            ));
        }
    }
}
