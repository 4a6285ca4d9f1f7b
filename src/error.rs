use thiserror::Error;

use crate::core::sample::{SampleId, SampleStatus};
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cycle detected at task: {0}")]
    CycleDetected(String),

    #[error("Task not found in graph: {0}")]
    TaskNotFound(TaskId),

    #[error("Sample not found: {0}")]
    SampleNotFound(SampleId),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: SampleStatus, to: SampleStatus },

    #[error("Submission failed{}: {message}", http_suffix(.status))]
    Submission { status: Option<u16>, message: String },

    #[error("Polling execution {execution_id} failed: {message}")]
    Poll {
        execution_id: String,
        message: String,
    },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Errors that invalidate a batching pass. The pass is abandoned and the
    /// graph is rebuilt from the store on the next cycle.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Error::CycleDetected(_) | Error::TaskNotFound(_) | Error::Validation(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::SampleNotFound(_) | Error::TaskNotFound(_))
    }
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, Error>;
