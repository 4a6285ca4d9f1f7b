//! Sample store.
//!
//! The store owns every sample record. New samples arrive through
//! [`SampleStore::insert`]; the worker only reads them and applies status
//! transitions, one record at a time.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::sample::{Sample, SampleId, SampleStatus};
use crate::execution::ExecutionId;
use crate::{Error, Result};

const TABLE_VERSION: u32 = 1;

/// Persistence for samples.
///
/// Every operation on a missing id fails with `SampleNotFound`.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Add a new sample. Fails with `Validation` if the id is already taken.
    async fn insert(&self, sample: Sample) -> Result<SampleId>;

    /// Delete a sample, returning it.
    async fn remove(&self, id: &SampleId) -> Result<Sample>;

    /// Samples in the given status, oldest first.
    async fn get_by_status(&self, status: SampleStatus) -> Result<Vec<Sample>>;

    async fn get_sample(&self, id: &SampleId) -> Result<Sample>;

    /// Apply a lifecycle transition, stamping `updated_at` with `now`.
    async fn set_status(&self, id: &SampleId, status: SampleStatus, now: DateTime<Utc>) -> Result<()>;

    /// Move a pending sample to running under an external job.
    async fn mark_running(&self, id: &SampleId, execution_id: &ExecutionId, now: DateTime<Utc>) -> Result<()>;
}

/// The record set both stores operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SampleTable {
    pub version: u32,
    pub samples: Vec<Sample>,
}

impl Default for SampleTable {
    fn default() -> Self {
        Self {
            version: TABLE_VERSION,
            samples: Vec::new(),
        }
    }
}

impl SampleTable {
    pub fn insert(&mut self, sample: Sample) -> Result<SampleId> {
        if self.samples.iter().any(|s| s.id == sample.id) {
            return Err(Error::Validation(format!("sample {} already exists", sample.id)));
        }
        let id = sample.id;
        self.samples.push(sample);
        Ok(id)
    }

    pub fn remove(&mut self, id: &SampleId) -> Result<Sample> {
        let position = self
            .samples
            .iter()
            .position(|s| s.id == *id)
            .ok_or(Error::SampleNotFound(*id))?;
        Ok(self.samples.remove(position))
    }

    pub fn by_status(&self, status: SampleStatus) -> Vec<Sample> {
        let mut found: Vec<Sample> = self
            .samples
            .iter()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        found
    }

    pub fn get(&self, id: &SampleId) -> Result<&Sample> {
        self.samples
            .iter()
            .find(|s| s.id == *id)
            .ok_or(Error::SampleNotFound(*id))
    }

    pub fn get_mut(&mut self, id: &SampleId) -> Result<&mut Sample> {
        self.samples
            .iter_mut()
            .find(|s| s.id == *id)
            .ok_or(Error::SampleNotFound(*id))
    }

    pub fn set_status(&mut self, id: &SampleId, status: SampleStatus, now: DateTime<Utc>) -> Result<()> {
        self.get_mut(id)?.transition(status, now)
    }

    pub fn mark_running(&mut self, id: &SampleId, execution_id: &ExecutionId, now: DateTime<Utc>) -> Result<()> {
        self.get_mut(id)?.start(execution_id, now)
    }
}
