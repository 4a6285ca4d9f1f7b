//! Samples and their lifecycle.
//!
//! A sample is an independently submitted unit of work: one physical
//! specimen plus the ordered chain of steps it must go through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::{Parameters, TaskId, TaskSpec};
use crate::execution::ExecutionId;
use crate::{Error, Result};

/// Unique identifier for a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleId(pub Uuid);

impl SampleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SampleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SampleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SampleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Sample status in its lifecycle.
///
/// ```text
/// Pending -> Running -> ReadyForDatabase -> Complete
///               \
///                -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleStatus {
    /// Waiting to be batched and submitted.
    Pending,
    /// Submitted and being processed by the execution service.
    Running,
    /// Finished on the execution service, data not yet digested.
    ReadyForDatabase,
    /// Execution and data handling are both done.
    Complete,
    /// The execution service reported an error.
    Failed,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleStatus::Pending => "pending",
            SampleStatus::Running => "running",
            SampleStatus::ReadyForDatabase => "readyfordatabase",
            SampleStatus::Complete => "complete",
            SampleStatus::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    /// Re-applying the current status is allowed and changes nothing.
    pub fn can_transition_to(&self, next: SampleStatus) -> bool {
        use SampleStatus::*;
        *self == next
            || matches!(
                (self, next),
                (Pending, Running)
                    | (Running, ReadyForDatabase)
                    | (Running, Failed)
                    | (ReadyForDatabase, Complete)
            )
    }
}

impl std::fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SampleStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SampleStatus::Pending),
            "running" => Ok(SampleStatus::Running),
            "readyfordatabase" => Ok(SampleStatus::ReadyForDatabase),
            "complete" => Ok(SampleStatus::Complete),
            "failed" => Ok(SampleStatus::Failed),
            other => Err(Error::Validation(format!("unknown sample status: {}", other))),
        }
    }
}

/// A sample as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "_id")]
    pub id: SampleId,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Parameters,
    /// Ordered processing steps.
    pub tasks: Vec<TaskSpec>,
    pub status: SampleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// External job this sample was submitted as, once running.
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
}

impl Sample {
    /// Create a pending sample with no steps.
    pub fn new(name: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: SampleId::new(),
            name: name.to_string(),
            tags: Vec::new(),
            metadata: Parameters::new(),
            tasks: Vec::new(),
            status: SampleStatus::Pending,
            created_at,
            updated_at: created_at,
            execution_id: None,
        }
    }

    /// Append a step, chained after the current last step.
    pub fn add_task(&mut self, task_type: &str, parameters: Parameters, capacity: usize) -> TaskId {
        let id = TaskId::new();
        let prev_tasks = self.tasks.last().map(|t| vec![t.id]).unwrap_or_default();
        self.tasks.push(TaskSpec {
            id,
            task_type: task_type.to_string(),
            parameters,
            capacity,
            prev_tasks,
            samples: vec![self.id],
        });
        id
    }

    /// Builder-style variant of [`Sample::add_task`].
    pub fn with_task(mut self, task_type: &str, parameters: Parameters, capacity: usize) -> Self {
        self.add_task(task_type, parameters, capacity);
        self
    }

    /// Apply a lifecycle transition, stamping `updated_at`.
    pub fn transition(&mut self, next: SampleStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if self.status != next {
            self.status = next;
            self.updated_at = now;
        }
        Ok(())
    }

    /// Mark as running under the given external job.
    pub fn start(&mut self, execution_id: &ExecutionId, now: DateTime<Utc>) -> Result<()> {
        self.transition(SampleStatus::Running, now)?;
        self.execution_id = Some(execution_id.clone());
        Ok(())
    }
}

/// One step of a sample submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub capacity: usize,
}

/// The shape in which new samples are submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSubmission {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Parameters,
    pub tasks: Vec<StepSpec>,
}

impl SampleSubmission {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("sample name must not be empty".to_string()));
        }
        if self.name.contains('$') || self.name.contains('.') {
            return Err(Error::Validation(format!(
                "sample name {:?} must not contain '$' or '.'",
                self.name
            )));
        }
        // A sample with no steps never joins a batch.
        if self.tasks.is_empty() {
            return Err(Error::Validation(format!("sample {:?} has no steps", self.name)));
        }
        if let Some(step) = self.tasks.iter().find(|s| s.capacity == 0) {
            return Err(Error::Validation(format!(
                "step {} must have a capacity of at least 1",
                step.task_type
            )));
        }
        Ok(())
    }

    /// Validate and turn into a pending sample.
    pub fn into_sample(self, created_at: DateTime<Utc>) -> Result<Sample> {
        self.validate()?;
        let mut sample = Sample::new(&self.name, created_at);
        sample.tags = self.tags;
        sample.metadata = self.metadata;
        for step in self.tasks {
            sample.add_task(&step.task_type, step.parameters, step.capacity);
        }
        Ok(sample)
    }
}
