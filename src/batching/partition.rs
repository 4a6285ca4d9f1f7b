//! Partitioner.
//!
//! A batch is a weakly connected component of the task graph. Components
//! are returned as views over the graph, never as copies.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::unionfind::UnionFind;

use crate::core::graph::{GraphView, TaskGraph};
use crate::core::task::TaskId;
use crate::Result;

/// Split the graph into its weakly connected components.
///
/// Components are ordered by their first member in insertion order, and
/// each component lists its nodes in insertion order.
pub fn connected_components(graph: &TaskGraph) -> Vec<GraphView> {
    let ids = graph.node_ids();
    let position: HashMap<TaskId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut sets = UnionFind::<usize>::new(ids.len());
    for (from, to) in graph.edges() {
        if let (Some(&a), Some(&b)) = (position.get(&from), position.get(&to)) {
            sets.union(a, b);
        }
    }

    let mut groups: Vec<Vec<TaskId>> = Vec::new();
    let mut group_of_root: HashMap<usize, usize> = HashMap::new();
    for (i, id) in ids.iter().enumerate() {
        let root = sets.find(i);
        let group = *group_of_root.entry(root).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[group].push(*id);
    }

    groups.into_iter().map(GraphView::new).collect()
}

/// The batch `id` belongs to: the node itself plus everything upstream
/// and downstream of it.
pub fn component_of(graph: &TaskGraph, id: &TaskId) -> Result<GraphView> {
    graph.index_of(id)?;

    let mut reached: HashSet<TaskId> = HashSet::from([*id]);
    walk(graph, *id, &mut reached, |g, t| g.predecessors(t));
    walk(graph, *id, &mut reached, |g, t| g.successors(t));

    let members = graph
        .node_ids()
        .into_iter()
        .filter(|t| reached.contains(t))
        .collect();
    Ok(GraphView::new(members))
}

fn walk<F>(graph: &TaskGraph, start: TaskId, reached: &mut HashSet<TaskId>, next: F)
where
    F: Fn(&TaskGraph, &TaskId) -> Vec<TaskId>,
{
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        for neighbor in next(graph, &current) {
            if reached.insert(neighbor) {
                queue.push_back(neighbor);
            }
        }
    }
}
