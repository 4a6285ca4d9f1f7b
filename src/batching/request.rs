//! Execution request builder.
//!
//! Linearizes a ready batch into the request body accepted by the
//! execution service: samples with request-unique names, and tasks in
//! topological order whose predecessors are given as list positions.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::graph::{GraphView, TaskGraph};
use crate::core::sample::{Sample, SampleId};
use crate::core::task::{TaskId, TaskNode};
use crate::{Error, Result};

/// Default request name.
pub const DEFAULT_REQUEST_NAME: &str = "Experiment";

/// Request body for `POST /api/experiment/submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRequest {
    pub name: String,
    pub samples: Vec<RequestSample>,
    pub tasks: Vec<RequestTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSample {
    /// Name unique within the request.
    pub name: String,
    #[serde(rename = "_id")]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTask {
    #[serde(rename = "type")]
    pub task_type: String,
    /// Positions of predecessor tasks within `ExperimentRequest::tasks`.
    pub prev_tasks: Vec<usize>,
    /// Request-unique names of the samples on this task.
    pub samples: Vec<String>,
    pub parameters: Value,
}

impl ExperimentRequest {
    /// Ids of every sample in the request, in request order.
    pub fn sample_ids(&self) -> Vec<String> {
        self.samples.iter().map(|s| s.id.clone()).collect()
    }
}

/// Builds [`ExperimentRequest`]s from batches.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    name: String,
    per_sample_parameter_types: HashSet<String>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_NAME, ["Dispensing"])
    }
}

impl RequestBuilder {
    /// `per_sample_parameter_types` lists task types whose parameters are
    /// sent per sample instead of shared.
    pub fn new<I, S>(name: &str, per_sample_parameter_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            per_sample_parameter_types: per_sample_parameter_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Linearize `batch`.
    ///
    /// # Errors
    /// `SampleNotFound` if a sample in the batch is missing from `samples`,
    /// `CycleDetected` if the batch cannot be ordered.
    pub fn build(
        &self,
        graph: &TaskGraph,
        batch: &GraphView,
        samples: &HashMap<SampleId, Sample>,
    ) -> Result<ExperimentRequest> {
        let order = batch.topological_order(graph)?;
        let position: HashMap<TaskId, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut names: HashMap<SampleId, String> = HashMap::new();
        let mut taken: HashSet<String> = HashSet::new();
        let mut request_samples = Vec::new();
        let mut tasks = Vec::with_capacity(order.len());

        for id in &order {
            let node = graph.node(id).ok_or(Error::TaskNotFound(*id))?;

            for sample_id in &node.samples {
                if names.contains_key(sample_id) {
                    continue;
                }
                let sample = samples.get(sample_id).ok_or(Error::SampleNotFound(*sample_id))?;
                let name = unique_sample_name(&sample.name, &taken);
                taken.insert(name.clone());
                names.insert(*sample_id, name.clone());
                request_samples.push(RequestSample {
                    name,
                    id: sample_id.to_string(),
                });
            }

            // Positions are resolved once the full order is known.
            let prev_tasks = batch
                .predecessors(graph, id)
                .iter()
                .filter_map(|p| position.get(p).copied())
                .collect();

            tasks.push(RequestTask {
                task_type: node.task_type.clone(),
                prev_tasks,
                samples: node
                    .samples
                    .iter()
                    .filter_map(|s| names.get(s).cloned())
                    .collect(),
                parameters: self.parameters_for(node),
            });
        }

        Ok(ExperimentRequest {
            name: self.name.clone(),
            samples: request_samples,
            tasks,
        })
    }

    fn parameters_for(&self, node: &TaskNode) -> Value {
        if self.per_sample_parameter_types.contains(&node.task_type) {
            let per_sample = node
                .parameters_per_sample
                .iter()
                .map(|(sample, params)| (sample.to_string(), Value::Object(params.clone())))
                .collect();
            Value::Object(per_sample)
        } else {
            Value::Object(node.parameters.clone())
        }
    }
}

/// Return `name`, or `name_N` with the smallest `N >= 1` not in `taken`.
pub fn unique_sample_name(name: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(name) {
        return name.to_string();
    }
    (1..)
        .map(|i| format!("{}_{}", name, i))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}
