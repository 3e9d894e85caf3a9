//! Dependency / blocker gating, and the dependency graph built from a ledger.
//!
//! Design:
//! - `resolve` answers "may this task be claimed, as far as prerequisites go?"
//! - `DependencyGraph` keeps forward and reverse edges for the whole ledger
//! - Invariant: edges and reverse_edges must be kept in sync

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::task::{Task, TaskSet, TaskStatus};

/// A dependency that is not yet completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmetDependency {
    pub id: TaskId,
    /// Current status, or `None` when the id is not in the ledger.
    pub status: Option<TaskStatus>,
}

impl fmt::Display for UnmetDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({})", self.id, status),
            None => write!(f, "{} (not found)", self.id),
        }
    }
}

/// Result of gating a task on its blockers and dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Open,
    /// Blockers are opaque; their presence alone closes the gate.
    Blocked(Vec<String>),
    /// Every unmet dependency, not just the first.
    Unmet(Vec<UnmetDependency>),
}

impl Gate {
    pub fn is_open(&self) -> bool {
        matches!(self, Gate::Open)
    }
}

/// Decide whether `task`'s prerequisites are satisfied within `tasks`.
pub fn resolve(task: &Task, tasks: &TaskSet) -> Gate {
    if !task.blockers.is_empty() {
        return Gate::Blocked(task.blockers.clone());
    }

    let unmet: Vec<UnmetDependency> = task
        .dependencies
        .iter()
        .filter_map(|dep_id| match tasks.get(dep_id.as_str()) {
            None => Some(UnmetDependency {
                id: dep_id.clone(),
                status: None,
            }),
            Some(dep) if dep.status != TaskStatus::Completed => Some(UnmetDependency {
                id: dep_id.clone(),
                status: Some(dep.status),
            }),
            Some(_) => None,
        })
        .collect();

    if unmet.is_empty() {
        Gate::Open
    } else {
        Gate::Unmet(unmet)
    }
}

/// Dependency graph for a whole ledger.
///
/// - `edges`: TaskId -> Set of TaskIds it depends on
/// - `reverse_edges`: TaskId -> Set of TaskIds waiting for it
///
/// Dependency ids that do not resolve to a task still get edges, so callers
/// can report them as dangling.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: HashMap<TaskId, HashSet<TaskId>>,
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,
    /// Ledger order, for deterministic traversal.
    order: Vec<TaskId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_task_set(tasks: &TaskSet) -> Self {
        let mut graph = Self::new();
        for task in &tasks.tasks {
            graph.add_node(task.id.clone());
            for dep in &task.dependencies {
                graph.add_dependency(task.id.clone(), dep.clone());
            }
        }
        graph
    }

    fn add_node(&mut self, task: TaskId) {
        if !self.order.contains(&task) {
            self.order.push(task);
        }
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Example: add_dependency(task_b, task_a) means "B waits for A".
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.add_node(task.clone());
        self.reverse_edges
            .entry(depends_on.clone())
            .or_default()
            .insert(task.clone());
        self.edges.entry(task).or_default().insert(depends_on);
    }

    /// Tasks that list `task` as a dependency.
    pub fn dependents_of(&self, task: &str) -> Vec<TaskId> {
        let mut waiting: Vec<TaskId> = self
            .reverse_edges
            .get(task)
            .map(|waiting| waiting.iter().cloned().collect())
            .unwrap_or_default();
        waiting.sort();
        waiting
    }

    /// Dependents of `completed` whose gate is now open in `tasks`.
    ///
    /// Only pending, unclaimed tasks are reported: those are the ones an
    /// idle agent could pick up next.
    pub fn newly_unblocked(&self, completed: &str, tasks: &TaskSet) -> Vec<TaskId> {
        self.dependents_of(completed)
            .into_iter()
            .filter(|id| {
                tasks.get(id.as_str()).is_some_and(|task| {
                    task.status == TaskStatus::Pending
                        && !task.is_claimed()
                        && resolve(task, tasks).is_open()
                })
            })
            .collect()
    }

    /// Detect a dependency cycle.
    ///
    /// Returns the first cycle found (in ledger order) as a closed path, e.g.
    /// `[A, B, A]`, or `None` if the graph is a DAG.
    ///
    /// Depth-first search with white/gray/black coloring: reaching a gray node
    /// means it is on the current path.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut colors: HashMap<&TaskId, Color> = HashMap::new();
        for start in &self.order {
            if colors.contains_key(start) {
                continue;
            }
            let mut path: Vec<&TaskId> = Vec::new();
            if let Some(cycle) = self.visit(start, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a TaskId,
        colors: &mut HashMap<&'a TaskId, Color>,
        path: &mut Vec<&'a TaskId>,
    ) -> Option<Vec<TaskId>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        if let Some(deps) = self.edges.get(node) {
            let mut deps: Vec<&TaskId> = deps.iter().collect();
            deps.sort();
            for dep in deps {
                match colors.get(dep) {
                    Some(Color::Gray) => {
                        let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                        let mut cycle: Vec<TaskId> =
                            path[start..].iter().map(|n| (*n).clone()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(Color::Black) => {}
                    None => {
                        if let Some(cycle) = self.visit(dep, colors, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        path.pop();
        colors.insert(node, Color::Black);
        None
    }
}
