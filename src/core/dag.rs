//! Task dependency graph.
//!
//! [`TaskGraph`] stores every submitted task as a node and every dependency
//! as an edge `dependency -> dependent`. It uses a `StableDiGraph` so node
//! indices survive the removal of cancelled tasks.

use crate::core::task::{Task, TaskId, TaskNode};
use crate::error::{Error, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::Bfs;
use petgraph::Direction;
use std::collections::HashMap;

/// The task dependency graph.
pub struct TaskGraph {
    graph: StableDiGraph<TaskNode, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Insert a validated task and its dependency edges.
    ///
    /// # Errors
    /// Returns a validation error if the id is already present, a
    /// dependency is unknown, or the edges would close a cycle. On error
    /// the graph is left unchanged.
    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.id) {
            return Err(Error::Validation(format!("task id {} already exists", task.id)));
        }

        let mut dep_indices = Vec::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            let idx = self.index.get(dep).ok_or_else(|| {
                Error::Validation(format!("task {} depends on unknown task {}", task.id, dep))
            })?;
            dep_indices.push(*idx);
        }

        let id = task.id.clone();
        let node = self.graph.add_node(TaskNode::new(task));
        for dep in dep_indices {
            self.graph.add_edge(dep, node, ());
        }

        if is_cyclic_directed(&self.graph) {
            self.graph.remove_node(node);
            return Err(Error::Validation(format!(
                "dependencies of task {} would create a cycle",
                id
            )));
        }

        self.index.insert(id, node);
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.index
            .get(id)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut TaskNode> {
        match self.index.get(id) {
            Some(&idx) => self.graph.node_weight_mut(idx),
            None => None,
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All nodes in submission order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> + '_ {
        self.graph
            .node_indices()
            .filter_map(move |idx| self.graph.node_weight(idx))
    }

    /// Whether every dependency of `id` is completed.
    ///
    /// Unknown ids report `false`.
    pub fn dependencies_satisfied(&self, id: &TaskId) -> bool {
        let Some(&idx) = self.index.get(id) else {
            return false;
        };
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .all(|dep| {
                self.graph
                    .node_weight(dep)
                    .map(TaskNode::is_completed)
                    .unwrap_or(false)
            })
    }

    /// Direct dependents of `id`, in submission order.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut indices: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        indices.sort();
        self.ids_of(indices)
    }

    /// Every task reachable through dependent edges from `id`, excluding
    /// `id` itself, in submission order.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut indices = Vec::new();
        while let Some(idx) = bfs.next(&self.graph) {
            if idx != start {
                indices.push(idx);
            }
        }
        indices.sort();
        self.ids_of(indices)
    }

    /// Whether any direct dependent of `id` has not finished.
    pub fn has_live_dependents(&self, id: &TaskId) -> bool {
        self.dependents(id)
            .iter()
            .filter_map(|dep| self.get(dep))
            .any(|node| !node.is_finished())
    }

    /// Remove a task and its edges.
    pub fn remove(&mut self, id: &TaskId) -> Option<TaskNode> {
        let idx = self.index.remove(id)?;
        self.graph.remove_node(idx)
    }

    fn ids_of(&self, indices: Vec<NodeIndex>) -> Vec<TaskId> {
        indices
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx))
            .map(|node| node.id().clone())
            .collect()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
