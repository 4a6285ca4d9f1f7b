//! Readiness evaluation for batches.
//!
//! A batch is submitted once every node is full, or once its oldest sample
//! has waited longer than the configured maximum.

use chrono::{DateTime, Duration, Utc};

use crate::core::graph::{GraphView, TaskGraph};
use crate::core::sample::SampleId;
use crate::Result;

/// Why a batch is, or is not yet, ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Every node holds exactly its capacity.
    Saturated,
    /// The oldest sample has waited at least the maximum wait.
    Expired,
    /// Neither; keep collecting samples.
    Waiting,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        !matches!(self, Readiness::Waiting)
    }
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Readiness::Saturated => write!(f, "saturated"),
            Readiness::Expired => write!(f, "expired"),
            Readiness::Waiting => write!(f, "waiting"),
        }
    }
}

/// True iff every node in the batch holds exactly as many samples as its
/// capacity.
pub fn is_saturated(graph: &TaskGraph, batch: &GraphView) -> bool {
    batch
        .nodes(graph)
        .all(|node| node.sample_count() == node.capacity)
}

/// Time since the oldest sample in the batch was created.
///
/// `created_at` resolves a sample id to its creation time; a lookup
/// failure is returned as-is. An empty batch has age zero.
pub fn batch_age<F>(graph: &TaskGraph, batch: &GraphView, now: DateTime<Utc>, created_at: F) -> Result<Duration>
where
    F: Fn(&SampleId) -> Result<DateTime<Utc>>,
{
    let mut oldest: Option<DateTime<Utc>> = None;
    for sample in batch.samples(graph) {
        let created = created_at(&sample)?;
        oldest = Some(match oldest {
            Some(current) if current <= created => current,
            _ => created,
        });
    }
    Ok(oldest.map(|t| now - t).unwrap_or_else(Duration::zero))
}

/// Decide whether a batch should be submitted now.
pub fn evaluate<F>(
    graph: &TaskGraph,
    batch: &GraphView,
    now: DateTime<Utc>,
    max_wait: Duration,
    created_at: F,
) -> Result<Readiness>
where
    F: Fn(&SampleId) -> Result<DateTime<Utc>>,
{
    if is_saturated(graph, batch) {
        return Ok(Readiness::Saturated);
    }
    if batch_age(graph, batch, now, created_at)? >= max_wait {
        return Ok(Readiness::Expired);
    }
    Ok(Readiness::Waiting)
}
