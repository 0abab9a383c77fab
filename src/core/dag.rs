//! Task plan as a directed acyclic graph.
//!
//! `TaskPlan` holds the planner's decomposition: nodes are tasks, an edge
//! `a -> b` means `b` needs the output of `a`. The plan is validated as a DAG
//! when it is built, so the supervisor and integrator can rely on a
//! topological order existing.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::PlanningError;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// The task dependency graph.
///
/// Uses petgraph's DiGraph; `task_index` maps ids to nodes for fast lookups.
#[derive(Clone)]
pub struct TaskPlan {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskPlan {
    /// Create a new empty plan.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a validated plan from tasks and `(dependency, dependent)` edges.
    ///
    /// All edges are inserted first and the result is checked with a
    /// topological sort, so a cycle anywhere in the planner output is reported
    /// as `CyclicPlan` rather than silently dropped edge by edge.
    ///
    /// # Errors
    /// - `EmptyPlan` if `tasks` is empty
    /// - `MalformedPlan` on duplicate task ids or edges naming unknown tasks
    /// - `CyclicPlan` if the edges form a cycle
    pub fn from_parts(
        tasks: Vec<Task>,
        edges: Vec<(TaskId, TaskId)>,
    ) -> std::result::Result<Self, PlanningError> {
        if tasks.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }

        let mut plan = Self::new();
        for task in tasks {
            if plan.contains_task(&task.id) {
                return Err(PlanningError::MalformedPlan(format!(
                    "duplicate task id {}",
                    task.id
                )));
            }
            plan.add_task(task);
        }

        for (from, to) in edges {
            let (from_idx, to_idx) = plan.edge_indices(&from, &to)?;
            if plan.graph.find_edge(from_idx, to_idx).is_none() {
                plan.graph.add_edge(from_idx, to_idx, ());
            }
        }

        plan.validate()?;
        Ok(plan)
    }

    fn edge_indices(
        &self,
        from: &TaskId,
        to: &TaskId,
    ) -> std::result::Result<(NodeIndex, NodeIndex), PlanningError> {
        let from_idx = self.get_node_index(from).ok_or_else(|| {
            PlanningError::MalformedPlan(format!("task {} not found in plan", from))
        })?;
        let to_idx = self.get_node_index(to).ok_or_else(|| {
            PlanningError::MalformedPlan(format!("task {} not found in plan", to))
        })?;
        Ok((from_idx, to_idx))
    }

    /// Add a task to the plan.
    ///
    /// If the task already exists (same TaskId), returns the existing NodeIndex.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Declare that `to` depends on `from`.
    ///
    /// # Errors
    /// Returns `MalformedPlan` if either task is missing, `CyclicPlan` if the
    /// edge would close a cycle. The plan is unchanged on error.
    pub fn add_dependency(
        &mut self,
        from: &TaskId,
        to: &TaskId,
    ) -> std::result::Result<(), PlanningError> {
        let (from_idx, to_idx) = self.edge_indices(from, to)?;

        if from_idx == to_idx || has_path_connecting(&self.graph, to_idx, from_idx, None) {
            return Err(PlanningError::CyclicPlan {
                task: self.graph[to_idx].name.clone(),
            });
        }

        if self.graph.find_edge(from_idx, to_idx).is_none() {
            self.graph.add_edge(from_idx, to_idx, ());
        }
        Ok(())
    }

    /// Check the emptiness and acyclicity invariants.
    pub fn validate(&self) -> std::result::Result<(), PlanningError> {
        if self.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }
        toposort(&self.graph, None).map_err(|cycle| PlanningError::CyclicPlan {
            task: self.graph[cycle.node_id()].name.clone(),
        })?;
        Ok(())
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph.node_weight_mut(index)
        } else {
            None
        }
    }

    /// Get the NodeIndex for a task by its ID.
    pub fn get_node_index(&self, id: &TaskId) -> Option<NodeIndex> {
        self.task_index.get(id).copied()
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if `to` directly depends on `from`.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        if let (Some(&from_idx), Some(&to_idx)) =
            (self.task_index.get(from), self.task_index.get(to))
        {
            self.graph.find_edge(from_idx, to_idx).is_some()
        } else {
            false
        }
    }

    /// Direct dependencies of a task.
    pub fn dependencies(&self, id: &TaskId) -> HashSet<TaskId> {
        self.neighbor_ids(id, Direction::Incoming)
    }

    /// Tasks that directly depend on the given task.
    pub fn dependents(&self, id: &TaskId) -> HashSet<TaskId> {
        self.neighbor_ids(id, Direction::Outgoing)
    }

    fn neighbor_ids(&self, id: &TaskId, direction: Direction) -> HashSet<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|n| self.graph[n].id)
                .collect(),
            None => HashSet::new(),
        }
    }

    /// Every task reachable downstream of `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut out = Vec::new();
        while let Some(index) = dfs.next(&self.graph) {
            if index != start {
                out.push(self.graph[index].id);
            }
        }
        out
    }

    /// Every task upstream of `id`, in topological order, excluding `id`.
    pub fn transitive_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut upstream = HashSet::new();
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            for dep in self.graph.neighbors_directed(index, Direction::Incoming) {
                if upstream.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        self.topological_indices()
            .into_iter()
            .filter(|index| upstream.contains(index))
            .map(|index| self.graph[index].id)
            .collect()
    }

    /// Get all tasks in the plan, in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    // ========== Scheduling Operations ==========

    /// Pending tasks whose dependencies have all succeeded, in topological order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.topological_indices()
            .into_iter()
            .filter(|&index| {
                self.graph[index].can_start()
                    && self
                        .graph
                        .neighbors_directed(index, Direction::Incoming)
                        .all(|dep| self.graph[dep].status == TaskStatus::Succeeded)
            })
            .map(|index| self.graph[index].id)
            .collect()
    }

    /// Check if every task reached succeeded, failed, or skipped.
    pub fn all_terminal(&self) -> bool {
        self.graph.node_weights().all(Task::is_terminal)
    }

    /// Tasks in topological order (each task after all of its dependencies).
    pub fn topological_order(&self) -> Vec<&Task> {
        self.topological_indices()
            .into_iter()
            .map(|index| &self.graph[index])
            .collect()
    }

    fn topological_indices(&self) -> Vec<NodeIndex> {
        // Construction guarantees acyclicity, so the sort cannot fail.
        toposort(&self.graph, None).unwrap_or_default()
    }

    /// Count of tasks not yet in a terminal state.
    pub fn pending_count(&self) -> usize {
        self.graph
            .node_weights()
            .filter(|task| !task.is_terminal())
            .count()
    }
}

impl Default for TaskPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPlan")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
