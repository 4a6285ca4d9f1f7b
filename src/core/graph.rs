//! Task graph for batching.
//!
//! `TaskGraph` is an arena of task nodes keyed by stable ids, backed by
//! petgraph's `StableDiGraph` so node indices survive removals. An edge
//! `u -> v` means `u` must complete before `v`.
//!
//! A [`GraphView`] is a filtered set of node ids over a graph. It never
//! copies nodes: edits made through the owning graph (including removals)
//! are visible through every view of it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::algo::{has_path_connecting, is_cyclic_directed};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;

use crate::core::sample::{Sample, SampleId};
use crate::core::task::{TaskId, TaskNode, TaskSpec};
use crate::{Error, Result};

/// The task dependency graph.
pub struct TaskGraph {
    graph: StableDiGraph<TaskNode, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    index: HashMap<TaskId, NodeIndex>,
    /// Node ids in insertion order. Used to make every traversal deterministic.
    order: Vec<TaskId>,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            order: Vec::new(),
        }
    }

    // ========== Builder ==========

    /// Build the chain graph of one sample: one node per step, each step
    /// depending on the one before it.
    pub fn from_sample(sample: &Sample) -> Result<Self> {
        let mut graph = Self::new();
        let mut previous: Option<TaskId> = None;

        for spec in &sample.tasks {
            check_capacity(spec)?;
            let node = TaskNode::with_samples(
                spec.id,
                &spec.task_type,
                spec.parameters.clone(),
                spec.capacity,
                vec![sample.id],
            );
            graph.add_node(node);
            if let Some(prev) = previous {
                graph.add_edge(&prev, &spec.id)?;
            }
            previous = Some(spec.id);
        }

        Ok(graph)
    }

    /// Build a graph from a serialized task list with explicit predecessor
    /// references and pre-populated sample lists.
    ///
    /// # Errors
    /// Returns `TaskNotFound` if a predecessor is not part of the list, and
    /// `CycleDetected` if the references form a cycle.
    pub fn from_task_list(tasks: &[TaskSpec]) -> Result<Self> {
        let mut graph = Self::new();
        for spec in tasks {
            check_capacity(spec)?;
            graph.add_node(TaskNode::from_spec(spec));
        }
        for spec in tasks {
            for prev in &spec.prev_tasks {
                graph.add_edge(prev, &spec.id)?;
            }
        }
        Ok(graph)
    }

    /// Union several graphs into one. Nodes and edges are taken as-is.
    pub fn compose<I>(graphs: I) -> Self
    where
        I: IntoIterator<Item = TaskGraph>,
    {
        let mut total = Self::new();
        for graph in graphs {
            total.absorb_graph(graph);
        }
        total
    }

    /// Move all nodes and edges of `other` into this graph.
    ///
    /// A node whose id is already present keeps its existing contents;
    /// its edges from `other` are still added.
    pub fn absorb_graph(&mut self, mut other: TaskGraph) {
        let edges = other.edges();
        for id in std::mem::take(&mut other.order) {
            if let Some(index) = other.index.remove(&id) {
                if let Some(node) = other.graph.remove_node(index) {
                    self.add_node(node);
                }
            }
        }
        for (from, to) in edges {
            if let (Some(&a), Some(&b)) = (self.index.get(&from), self.index.get(&to)) {
                self.graph.update_edge(a, b, ());
            }
        }
    }

    // ========== Mutation ==========

    /// Add a node to the graph.
    ///
    /// If a node with the same id already exists, returns its index and
    /// leaves the graph untouched.
    pub fn add_node(&mut self, node: TaskNode) -> NodeIndex {
        if let Some(&index) = self.index.get(&node.id) {
            return index;
        }
        let id = node.id;
        let index = self.graph.add_node(node);
        self.index.insert(id, index);
        self.order.push(id);
        index
    }

    /// Add a dependency `from -> to`, rejecting edges that would close a cycle.
    pub fn add_edge(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let a = self.index_of(from)?;
        let b = self.index_of(to)?;

        if a == b || has_path_connecting(&self.graph, b, a, None) {
            return Err(Error::CycleDetected(format!(
                "{} -> {} would close a cycle",
                from.short(),
                to.short()
            )));
        }

        self.graph.update_edge(a, b, ());
        Ok(())
    }

    /// Add `from -> to` without a cycle check. Callers must guarantee that
    /// no path `to ~> from` exists.
    pub(crate) fn connect_unchecked(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let a = self.index_of(from)?;
        let b = self.index_of(to)?;
        if a != b {
            self.graph.update_edge(a, b, ());
        }
        Ok(())
    }

    /// Remove a node and all of its edges.
    pub fn remove_node(&mut self, id: &TaskId) -> Option<TaskNode> {
        let index = self.index.remove(id)?;
        self.order.retain(|t| t != id);
        self.graph.remove_node(index)
    }

    // ========== Queries ==========

    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn node_mut(&mut self, id: &TaskId) -> Option<&mut TaskNode> {
        match self.index.get(id) {
            Some(&index) => self.graph.node_weight_mut(index),
            None => None,
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> Vec<TaskId> {
        self.order.clone()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.order.iter().filter_map(move |id| self.node(id))
    }

    /// Direct predecessors of a node, in insertion order.
    pub fn predecessors(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct successors of a node, in insertion order.
    pub fn successors(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    pub fn has_edge(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// Whether `to` is reachable from `from` along dependency edges.
    pub fn has_path(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }

    /// All edges as `(from, to)` id pairs, ordered by the source's insertion order.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        self.order
            .iter()
            .flat_map(|from| {
                self.successors(from)
                    .into_iter()
                    .map(move |to| (*from, to))
            })
            .collect()
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }

    /// Every sample occurrence across all nodes (a multiset).
    pub fn sample_occurrences(&self) -> Vec<SampleId> {
        self.nodes().flat_map(|n| n.samples.iter().copied()).collect()
    }

    /// A view covering every node currently in the graph.
    pub fn view(&self) -> GraphView {
        GraphView::new(self.order.clone())
    }

    pub(crate) fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.index.get(id).copied().ok_or(Error::TaskNotFound(*id))
    }

    pub(crate) fn inner(&self) -> &StableDiGraph<TaskNode, ()> {
        &self.graph
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&index) = self.index.get(id) else {
            return Vec::new();
        };
        let found: HashSet<TaskId> = self
            .graph
            .neighbors_directed(index, direction)
            .filter_map(|n| self.graph.node_weight(n).map(|node| node.id))
            .collect();
        self.order
            .iter()
            .filter(|t| found.contains(t))
            .copied()
            .collect()
    }
}

fn check_capacity(spec: &TaskSpec) -> Result<()> {
    if spec.capacity == 0 {
        return Err(Error::Validation(format!(
            "task {} ({}) has zero capacity",
            spec.id.short(),
            spec.task_type
        )));
    }
    if spec.samples.len() > spec.capacity {
        return Err(Error::Validation(format!(
            "task {} ({}) carries {} samples but has capacity {}",
            spec.id.short(),
            spec.task_type,
            spec.samples.len(),
            spec.capacity
        )));
    }
    Ok(())
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}

/// A filtered view over a [`TaskGraph`]: a set of included node ids.
///
/// Ids removed from the underlying graph simply drop out of every query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphView {
    ids: Vec<TaskId>,
    members: HashSet<TaskId>,
}

impl GraphView {
    pub fn new(ids: Vec<TaskId>) -> Self {
        let mut members = HashSet::with_capacity(ids.len());
        let ids = ids.into_iter().filter(|id| members.insert(*id)).collect();
        Self { ids, members }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.members.contains(id)
    }

    /// Ids of the view that are still present in `graph`.
    pub fn node_ids(&self, graph: &TaskGraph) -> Vec<TaskId> {
        self.ids
            .iter()
            .filter(|id| graph.contains(id))
            .copied()
            .collect()
    }

    pub fn nodes<'g>(&'g self, graph: &'g TaskGraph) -> impl Iterator<Item = &'g TaskNode> + 'g {
        self.ids.iter().filter_map(move |id| graph.node(id))
    }

    pub fn len(&self, graph: &TaskGraph) -> usize {
        self.nodes(graph).count()
    }

    pub fn is_empty(&self, graph: &TaskGraph) -> bool {
        self.nodes(graph).next().is_none()
    }

    /// Distinct samples referenced by the view, in first-seen order.
    pub fn samples(&self, graph: &TaskGraph) -> Vec<SampleId> {
        let mut seen = HashSet::new();
        self.nodes(graph)
            .flat_map(|n| n.samples.iter().copied())
            .filter(|s| seen.insert(*s))
            .collect()
    }

    /// Predecessors of `id` that also belong to the view.
    pub fn predecessors(&self, graph: &TaskGraph, id: &TaskId) -> Vec<TaskId> {
        graph
            .predecessors(id)
            .into_iter()
            .filter(|p| self.contains(p))
            .collect()
    }

    /// Edges with both endpoints inside the view.
    pub fn edges(&self, graph: &TaskGraph) -> Vec<(TaskId, TaskId)> {
        graph
            .edges()
            .into_iter()
            .filter(|(a, b)| self.contains(a) && self.contains(b))
            .collect()
    }

    /// Topological order of the view's nodes. Ties are broken by graph
    /// insertion order, so the result is deterministic.
    pub fn topological_order(&self, graph: &TaskGraph) -> Result<Vec<TaskId>> {
        let live = self.node_ids(graph);
        let rank: HashMap<TaskId, usize> = graph
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();

        let mut in_degree: HashMap<TaskId, usize> = live
            .iter()
            .map(|id| (*id, self.predecessors(graph, id).len()))
            .collect();

        let mut ready: BinaryHeap<Reverse<(usize, TaskId)>> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| Reverse((rank[id], *id)))
            .collect();

        let mut sorted = Vec::with_capacity(live.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            sorted.push(id);
            for next in graph.successors(&id) {
                if let Some(deg) = in_degree.get_mut(&next) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse((rank[&next], next)));
                    }
                }
            }
        }

        if sorted.len() < live.len() {
            let stuck = live
                .iter()
                .find(|id| !sorted.contains(id))
                .and_then(|id| graph.node(id))
                .map(|n| format!("{} ({})", n.id.short(), n.task_type))
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::CycleDetected(stuck));
        }

        Ok(sorted)
    }
}
