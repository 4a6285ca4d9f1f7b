//! Execution service collaborator.
//!
//! The execution service runs submitted experiments on the lab hardware.
//! The worker talks to it through [`ExecutionClient`]; the HTTP
//! implementation lives in [`http`].

pub mod http;

pub use http::HttpExecutionClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::batching::request::ExperimentRequest;
use crate::Result;

/// Identifier of a submitted experiment, as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExecutionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of an experiment on the execution service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ExecutionStatus {
    /// Whether the experiment has stopped, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Error)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "PENDING"),
            ExecutionStatus::Running => write!(f, "RUNNING"),
            ExecutionStatus::Completed => write!(f, "COMPLETED"),
            ExecutionStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Client for the execution service.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Submit an experiment.
    ///
    /// # Errors
    /// `Submission` on transport failure, a non-success response, or a
    /// response without an experiment id.
    async fn submit(&self, request: &ExperimentRequest) -> Result<ExecutionId>;

    /// Fetch the status of a submitted experiment.
    ///
    /// # Errors
    /// `Poll` on transport failure, a non-success response, or an
    /// unreadable body.
    async fn status(&self, id: &ExecutionId) -> Result<ExecutionStatus>;
}
