//! Task graph: the full set of tasks plus the derived levels.
//!
//! The graph is parsed from JSON, validated once, and then treated as
//! read-only for the remainder of a run. Dependency analysis (cycles,
//! reachability) runs over a petgraph `DiGraph` built on demand.

use crate::core::task::{Task, TaskId};
use crate::core::validate::{self, ValidationReport};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// A feature decomposed into tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskGraph {
    #[serde(default)]
    pub feature: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn new(feature: &str, tasks: Vec<Task>) -> Self {
        Self {
            feature: feature.to_string(),
            tasks,
        }
    }

    /// Parse a graph document without validating it.
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a graph file without validating it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Read, parse and validate a graph file.
    ///
    /// Warnings are logged; errors make the whole load fail with
    /// [`Error::Graph`].
    pub fn load(path: &Path) -> Result<Self> {
        let graph = Self::from_file(path)?;
        graph.validate().into_result()?;
        Ok(graph)
    }

    pub fn validate(&self) -> ValidationReport {
        validate::validate(self)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// `level → task ids`, each level in file order.
    pub fn levels(&self) -> BTreeMap<u32, Vec<TaskId>> {
        let mut levels: BTreeMap<u32, Vec<TaskId>> = BTreeMap::new();
        for task in &self.tasks {
            levels.entry(task.level).or_default().push(task.id.clone());
        }
        levels
    }

    /// Level numbers in ascending order.
    pub fn level_numbers(&self) -> Vec<u32> {
        self.levels().into_keys().collect()
    }

    pub fn tasks_in_level(&self, level: u32) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.level == level).collect()
    }

    pub fn max_level(&self) -> u32 {
        self.tasks.iter().map(|t| t.level).max().unwrap_or(0)
    }

    /// Build the dependency graph. Dangling references are skipped; the
    /// validator reports them separately.
    pub fn dependency_graph(&self) -> DependencyGraph {
        DependencyGraph::build(self)
    }
}

/// Dependency relation over task ids.
///
/// An edge `a → b` means "a depends on b", so a cycle reads in the same
/// direction the graph file declares it.
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    fn build(tasks: &TaskGraph) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for task in &tasks.tasks {
            if !index.contains_key(&task.id) {
                let node = graph.add_node(task.id.clone());
                index.insert(task.id.clone(), node);
            }
        }

        for task in &tasks.tasks {
            let from = index[&task.id];
            for dep in &task.dependencies {
                if let Some(&to) = index.get(dep) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        Self { graph, index }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Dependencies of `node` in declaration order.
    fn dependencies_of(&self, node: NodeIndex) -> Vec<NodeIndex> {
        // petgraph yields neighbours newest-first
        let mut deps: Vec<NodeIndex> = self.graph.neighbors(node).collect();
        deps.reverse();
        deps
    }

    /// Every distinct cycle in the relation, each as the exact path with
    /// the first node repeated at the end (`T1 -> T2 -> T1`).
    ///
    /// Depth-first traversal with an explicit recursion stack; a back edge
    /// to a node on the stack closes a cycle.
    pub fn find_cycles(&self) -> Vec<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut seen: HashSet<Vec<TaskId>> = HashSet::new();
        let mut cycles = Vec::new();

        for start in self.graph.node_indices() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }

            // (node, dependencies, next dependency to visit)
            let mut frames: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();
            let mut path: Vec<NodeIndex> = Vec::new();

            marks[start.index()] = Mark::OnStack;
            frames.push((start, self.dependencies_of(start), 0));
            path.push(start);

            while let Some(frame) = frames.last_mut() {
                if frame.2 >= frame.1.len() {
                    marks[frame.0.index()] = Mark::Done;
                    frames.pop();
                    path.pop();
                    continue;
                }

                let next = frame.1[frame.2];
                frame.2 += 1;

                match marks[next.index()] {
                    Mark::Unvisited => {
                        marks[next.index()] = Mark::OnStack;
                        let deps = self.dependencies_of(next);
                        frames.push((next, deps, 0));
                        path.push(next);
                    }
                    Mark::OnStack => {
                        let Some(pos) = path.iter().position(|&n| n == next) else {
                            continue;
                        };
                        let mut cycle: Vec<TaskId> =
                            path[pos..].iter().map(|&n| self.graph[n].clone()).collect();
                        if seen.insert(canonical_rotation(&cycle)) {
                            cycle.push(self.graph[next].clone());
                            cycles.push(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
        }

        cycles
    }

    /// Every task from which `roots` can be reached by following
    /// dependencies, roots included.
    pub fn dependents_closure(&self, roots: &[TaskId]) -> HashSet<TaskId> {
        let reversed = Reversed(&self.graph);
        let mut reached = HashSet::new();

        for root in roots {
            let Some(&start) = self.index.get(root) else {
                continue;
            };
            let mut dfs = Dfs::new(reversed, start);
            while let Some(node) = dfs.next(reversed) {
                reached.insert(self.graph[node].clone());
            }
        }

        reached
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.node_count())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}

/// Rotate a cycle so its smallest id comes first, for deduplication.
fn canonical_rotation(cycle: &[TaskId]) -> Vec<TaskId> {
    let Some(min_pos) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    else {
        return Vec::new();
    };
    cycle[min_pos..]
        .iter()
        .chain(cycle[..min_pos].iter())
        .cloned()
        .collect()
}

/// Render a cycle as `T1 -> T2 -> T1`.
pub fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}
