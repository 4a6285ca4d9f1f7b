//! Hand-off of finished samples to data storage.

use async_trait::async_trait;
use tracing::debug;

use crate::core::sample::Sample;
use crate::Result;

/// Receives each sample once its execution has completed, before the
/// sample is marked complete. A failure leaves the sample in
/// `ReadyForDatabase` and it is offered again on the next cycle.
#[async_trait]
pub trait SampleDigester: Send + Sync {
    async fn digest(&self, sample: &Sample) -> Result<()>;
}

/// Digester that accepts every sample and stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDigester;

#[async_trait]
impl SampleDigester for NoopDigester {
    async fn digest(&self, sample: &Sample) -> Result<()> {
        debug!(sample = %sample.id, "digest: nothing to store");
        Ok(())
    }
}
