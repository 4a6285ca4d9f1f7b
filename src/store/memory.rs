use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{SampleStore, SampleTable};
use crate::core::sample::{Sample, SampleId, SampleStatus};
use crate::execution::ExecutionId;
use crate::Result;

/// In-process store. Used by tests and by `labqueue plan` on a snapshot.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: RwLock<SampleTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-filled with `samples`.
    pub fn with_samples<I>(samples: I) -> Result<Self>
    where
        I: IntoIterator<Item = Sample>,
    {
        let mut table = SampleTable::default();
        for sample in samples {
            table.insert(sample)?;
        }
        Ok(Self {
            table: RwLock::new(table),
        })
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.samples.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn insert(&self, sample: Sample) -> Result<SampleId> {
        self.table.write().await.insert(sample)
    }

    async fn remove(&self, id: &SampleId) -> Result<Sample> {
        self.table.write().await.remove(id)
    }

    async fn get_by_status(&self, status: SampleStatus) -> Result<Vec<Sample>> {
        Ok(self.table.read().await.by_status(status))
    }

    async fn get_sample(&self, id: &SampleId) -> Result<Sample> {
        self.table.read().await.get(id).cloned()
    }

    async fn set_status(&self, id: &SampleId, status: SampleStatus, now: DateTime<Utc>) -> Result<()> {
        self.table.write().await.set_status(id, status, now)
    }

    async fn mark_running(&self, id: &SampleId, execution_id: &ExecutionId, now: DateTime<Utc>) -> Result<()> {
        self.table.write().await.mark_running(id, execution_id, now)
    }
}
