//! Batch merger.
//!
//! Greedily fuses same-type task nodes into shared nodes up to capacity,
//! rewiring dependency edges onto the surviving node. Merging happens on
//! the owning graph; the [`GraphView`] only scopes which nodes take part.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, trace};

use crate::core::graph::{GraphView, TaskGraph};
use crate::core::task::{TaskId, TaskNode};
use crate::{Error, Result};

/// Strategy deciding which nodes may merge and in what order.
pub trait MergePolicy: Send + Sync {
    /// Whether `candidate` may be merged into `reference`.
    fn compatible(&self, _reference: &TaskNode, _candidate: &TaskNode) -> bool {
        true
    }

    /// Preference for merging `candidate` into `reference`. Higher ranks are
    /// tried first; equal ranks keep insertion order.
    fn rank(&self, _reference: &TaskNode, _candidate: &TaskNode) -> i64 {
        0
    }
}

/// Any two same-type nodes may merge; candidates are tried in insertion order.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyCompatible;

impl MergePolicy for AnyCompatible {}

/// Nodes merge only when their shared parameters are identical.
///
/// Used for furnaces: one run applies one temperature and atmosphere
/// profile to every sample inside.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactParameters;

impl MergePolicy for ExactParameters {
    fn compatible(&self, reference: &TaskNode, candidate: &TaskNode) -> bool {
        reference.parameters == candidate.parameters
    }
}

/// Ranks candidates by the Jaccard similarity of the reagents they use, so
/// that dispenses sharing powders end up in the same batch.
#[derive(Debug, Clone)]
pub struct ReagentOverlap {
    /// Parameter holding an object keyed by reagent name.
    pub key: String,
}

impl Default for ReagentOverlap {
    fn default() -> Self {
        Self {
            key: "powder_dispenses".to_string(),
        }
    }
}

impl ReagentOverlap {
    fn reagents<'a>(&self, node: &'a TaskNode) -> BTreeSet<&'a str> {
        node.parameters_per_sample
            .values()
            .chain(std::iter::once(&node.parameters))
            .filter_map(|params| params.get(&self.key))
            .filter_map(|value| value.as_object())
            .flat_map(|reagents| reagents.keys().map(String::as_str))
            .collect()
    }
}

impl MergePolicy for ReagentOverlap {
    fn rank(&self, reference: &TaskNode, candidate: &TaskNode) -> i64 {
        let a = self.reagents(reference);
        let b = self.reagents(candidate);
        let union = a.union(&b).count();
        if union == 0 {
            return 0;
        }
        let shared = a.intersection(&b).count();
        // Per-mille keeps the rank an integer.
        (shared * 1000 / union) as i64
    }
}

/// Outcome of one merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Nodes removed because they were absorbed into another node.
    pub absorbed: usize,
    /// Nodes that absorbed at least one other node.
    pub references: usize,
    /// Candidate pairs skipped because merging would create a cycle.
    pub skipped_dependent: usize,
}

impl MergeReport {
    pub fn is_noop(&self) -> bool {
        self.absorbed == 0
    }
}

/// Merge compatible nodes of `task_type` inside `view`, editing `graph`.
///
/// Single deterministic pass over the view in insertion order. Each node
/// not yet absorbed becomes the reference and takes in remaining nodes of
/// the same type while the policy allows it and the combined sample count
/// fits its capacity. Two nodes connected by a dependency path are never
/// merged, which keeps the graph acyclic.
pub fn merge_nodes(
    graph: &mut TaskGraph,
    view: &GraphView,
    task_type: &str,
    policy: &dyn MergePolicy,
) -> Result<MergeReport> {
    let node_ids = view.node_ids(graph);
    let mut absorbed: HashSet<TaskId> = HashSet::new();
    let mut report = MergeReport::default();

    for reference_id in &node_ids {
        if absorbed.contains(reference_id) {
            continue;
        }

        let candidates = {
            let Some(reference) = graph.node(reference_id) else {
                continue;
            };
            if reference.task_type != task_type || reference.is_full() {
                continue;
            }
            let mut ranked: Vec<(i64, TaskId)> = node_ids
                .iter()
                .filter(|id| *id != reference_id && !absorbed.contains(*id))
                .filter_map(|id| graph.node(id))
                .filter(|candidate| candidate.task_type == task_type)
                .filter(|candidate| policy.compatible(reference, candidate))
                .map(|candidate| (policy.rank(reference, candidate), candidate.id))
                .collect();
            // Stable sort: equal ranks stay in insertion order.
            ranked.sort_by(|a, b| b.0.cmp(&a.0));
            ranked
        };

        let mut took_any = false;
        for (_, candidate_id) in candidates {
            let (reference_count, capacity, candidate_count) =
                match (graph.node(reference_id), graph.node(&candidate_id)) {
                    (Some(r), Some(c)) => (r.sample_count(), r.capacity, c.sample_count()),
                    _ => continue,
                };
            if reference_count >= capacity {
                break;
            }
            if reference_count + candidate_count > capacity {
                continue;
            }
            if graph.has_path(reference_id, &candidate_id) || graph.has_path(&candidate_id, reference_id) {
                trace!(
                    reference = %reference_id.short(),
                    candidate = %candidate_id.short(),
                    "skipping merge of dependent nodes"
                );
                report.skipped_dependent += 1;
                continue;
            }

            contract(graph, reference_id, &candidate_id)?;
            absorbed.insert(candidate_id);
            report.absorbed += 1;
            took_any = true;
        }

        if took_any {
            report.references += 1;
        }
    }

    debug!(
        task_type,
        absorbed = report.absorbed,
        references = report.references,
        "merge pass finished"
    );
    Ok(report)
}

/// Merge across the whole graph.
pub fn merge_all(graph: &mut TaskGraph, task_type: &str, policy: &dyn MergePolicy) -> Result<MergeReport> {
    let view = graph.view();
    merge_nodes(graph, &view, task_type, policy)
}

/// Fold `candidate` into `reference`: rewire its edges, move its samples,
/// delete it.
fn contract(graph: &mut TaskGraph, reference: &TaskId, candidate: &TaskId) -> Result<()> {
    for prev in graph.predecessors(candidate) {
        graph.connect_unchecked(&prev, reference)?;
    }
    for next in graph.successors(candidate) {
        graph.connect_unchecked(reference, &next)?;
    }
    let node = graph
        .remove_node(candidate)
        .ok_or(Error::TaskNotFound(*candidate))?;
    graph
        .node_mut(reference)
        .ok_or(Error::TaskNotFound(*reference))?
        .absorb(node);
    Ok(())
}
