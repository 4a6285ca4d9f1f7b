//! Task data model for the batching graph.
//!
//! A task is one processing step (dispensing, heating, diffraction, ...)
//! executed by a physical resource. Each task node carries the samples it
//! will process, bounded by the resource's capacity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::core::sample::SampleId;

/// Opaque execution parameters of a task, as a JSON object.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a task node.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A serialized task entry, as stored with a sample.
///
/// Predecessors are referenced by id. For a freshly submitted sample the
/// entries form a chain and `samples` holds only that sample's id; an
/// already-merged list may carry several samples per entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "_id")]
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub capacity: usize,
    #[serde(default)]
    pub prev_tasks: Vec<TaskId>,
    #[serde(default)]
    pub samples: Vec<SampleId>,
}

/// A node in the task graph.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNode {
    pub id: TaskId,
    pub task_type: String,
    /// Parameters shared by every sample on this node.
    pub parameters: Parameters,
    /// Maximum number of samples the resource can process at once.
    pub capacity: usize,
    /// Member samples, in the order they joined the node.
    pub samples: Vec<SampleId>,
    /// The parameters that applied to each sample before merging.
    pub parameters_per_sample: BTreeMap<SampleId, Parameters>,
}

impl TaskNode {
    /// Create a node carrying a single sample.
    pub fn new(task_type: &str, parameters: Parameters, capacity: usize, sample: SampleId) -> Self {
        Self::with_samples(TaskId::new(), task_type, parameters, capacity, vec![sample])
    }

    /// Create a node with an explicit id and a pre-populated sample list.
    pub fn with_samples(
        id: TaskId,
        task_type: &str,
        parameters: Parameters,
        capacity: usize,
        samples: Vec<SampleId>,
    ) -> Self {
        let parameters_per_sample = samples
            .iter()
            .map(|sample| (*sample, parameters.clone()))
            .collect();
        Self {
            id,
            task_type: task_type.to_string(),
            parameters,
            capacity,
            samples,
            parameters_per_sample,
        }
    }

    /// Build a node from a serialized task entry.
    pub fn from_spec(spec: &TaskSpec) -> Self {
        Self::with_samples(
            spec.id,
            &spec.task_type,
            spec.parameters.clone(),
            spec.capacity,
            spec.samples.clone(),
        )
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Remaining room before the node reaches capacity.
    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.samples.len())
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    /// Move another node's samples and per-sample parameters onto this one.
    pub fn absorb(&mut self, other: TaskNode) {
        self.samples.extend(other.samples);
        self.parameters_per_sample.extend(other.parameters_per_sample);
    }
}
