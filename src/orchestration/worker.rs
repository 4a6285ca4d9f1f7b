//! The batch worker: the scheduling loop.
//!
//! Each cycle batches the pending samples and submits the batches that are
//! ready, then polls the execution service for the jobs already running and
//! hands finished samples to the digester. Cycles never overlap.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batching::merge::{merge_all, merge_nodes, AnyCompatible, ExactParameters, MergePolicy, ReagentOverlap};
use crate::batching::partition::connected_components;
use crate::batching::readiness::{batch_age, evaluate, Readiness};
use crate::batching::request::{ExperimentRequest, RequestBuilder, DEFAULT_REQUEST_NAME};
use crate::core::graph::{GraphView, TaskGraph};
use crate::core::sample::{Sample, SampleId, SampleStatus};
use crate::execution::{ExecutionClient, ExecutionId, ExecutionStatus};
use crate::orchestration::clock::{Clock, SystemClock};
use crate::orchestration::digest::{NoopDigester, SampleDigester};
use crate::store::SampleStore;
use crate::{Error, Result};

/// Default pause between cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default maximum time a sample waits for its batch to fill.
pub const DEFAULT_MAX_WAIT_SECS: i64 = 30 * 60;

/// Scheduling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// A batch is submitted once its oldest sample has waited this long,
    /// even if not every node is full.
    pub max_wait: chrono::Duration,
    pub request_name: String,
    /// Types merged across the whole graph, only between nodes with
    /// identical parameters. Applied first, in order.
    pub strict_merge_types: Vec<String>,
    /// Types merged within each connected region, then once more across
    /// the whole graph.
    pub regional_merge_types: Vec<String>,
    /// Types whose parameters are sent per sample.
    pub per_sample_parameter_types: Vec<String>,
    /// Prefer merging regional nodes that share reagents.
    pub rank_by_reagent_overlap: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: chrono::Duration::seconds(DEFAULT_MAX_WAIT_SECS),
            request_name: DEFAULT_REQUEST_NAME.to_string(),
            strict_merge_types: vec!["Heating".to_string(), "HeatingWithAtmosphere".to_string()],
            regional_merge_types: vec!["Dispensing".to_string()],
            per_sample_parameter_types: vec!["Dispensing".to_string()],
            rank_by_reagent_overlap: false,
        }
    }
}

impl WorkerConfig {
    fn regional_policy(&self) -> Box<dyn MergePolicy> {
        if self.rank_by_reagent_overlap {
            Box::new(ReagentOverlap::default())
        } else {
            Box::new(AnyCompatible)
        }
    }

    fn request_builder(&self) -> RequestBuilder {
        RequestBuilder::new(&self.request_name, self.per_sample_parameter_types.iter().cloned())
    }
}

/// Events emitted by the worker as samples move through their lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A batch was accepted by the execution service.
    BatchSubmitted {
        execution_id: ExecutionId,
        samples: Vec<SampleId>,
    },
    /// The execution service rejected a batch; its samples stay pending.
    SubmissionFailed { samples: Vec<SampleId>, error: String },
    /// A job finished; its samples await digestion.
    ExecutionCompleted {
        execution_id: ExecutionId,
        samples: Vec<SampleId>,
    },
    /// A job reported an error; its samples failed.
    ExecutionFailed {
        execution_id: ExecutionId,
        samples: Vec<SampleId>,
    },
    /// The status of a job could not be fetched.
    PollFailed { execution_id: ExecutionId, error: String },
    /// A sample was digested and is complete.
    SampleCompleted { sample: SampleId },
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Pending samples seen at the start of the cycle.
    pub pending: usize,
    pub batches: usize,
    /// Batches not yet ready.
    pub waiting: usize,
    pub submitted: Vec<ExecutionId>,
    pub submission_failures: usize,
    /// The batching pass hit a graph error and was abandoned.
    pub batching_aborted: bool,
    /// Samples marked complete.
    pub completed: usize,
    /// Samples marked failed.
    pub failed: usize,
    pub poll_failures: usize,
    pub digest_failures: usize,
}

impl CycleReport {
    /// Whether the cycle changed nothing and found nothing to do.
    pub fn is_idle(&self) -> bool {
        self.pending == 0
            && self.submitted.is_empty()
            && self.completed == 0
            && self.failed == 0
            && self.submission_failures == 0
            && self.poll_failures == 0
            && self.digest_failures == 0
    }
}

/// One batch as it would be submitted now.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub samples: Vec<SampleId>,
    pub nodes: usize,
    pub readiness: Readiness,
    pub age: chrono::Duration,
    pub request: ExperimentRequest,
}

/// Merge the task chains of `samples` into batches.
///
/// Strict types merge first across the whole graph, then regional types
/// merge within each connected region and finally across the whole graph
/// to pick up regions of a single sample. Returns the merged graph and its
/// batches.
pub fn batch_samples(samples: &[Sample], config: &WorkerConfig) -> Result<(TaskGraph, Vec<GraphView>)> {
    let graphs = samples
        .iter()
        .map(TaskGraph::from_sample)
        .collect::<Result<Vec<_>>>()?;
    let mut graph = TaskGraph::compose(graphs);

    for task_type in &config.strict_merge_types {
        merge_all(&mut graph, task_type, &ExactParameters)?;
    }

    let policy = config.regional_policy();
    for task_type in &config.regional_merge_types {
        for region in connected_components(&graph) {
            merge_nodes(&mut graph, &region, task_type, policy.as_ref())?;
        }
        merge_all(&mut graph, task_type, policy.as_ref())?;
    }

    let batches = connected_components(&graph);
    debug!(
        samples = samples.len(),
        nodes = graph.node_count(),
        batches = batches.len(),
        "batched pending samples"
    );
    Ok((graph, batches))
}

fn created_at(samples: &HashMap<SampleId, Sample>, id: &SampleId) -> Result<DateTime<Utc>> {
    samples
        .get(id)
        .map(|s| s.created_at)
        .ok_or(Error::SampleNotFound(*id))
}

/// The scheduler. Holds its collaborators and drives one cycle at a time.
pub struct BatchWorker {
    store: Arc<dyn SampleStore>,
    client: Arc<dyn ExecutionClient>,
    clock: Arc<dyn Clock>,
    digester: Arc<dyn SampleDigester>,
    config: WorkerConfig,
    builder: RequestBuilder,
    event_tx: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

impl BatchWorker {
    pub fn new(store: Arc<dyn SampleStore>, client: Arc<dyn ExecutionClient>, config: WorkerConfig) -> Self {
        let builder = config.request_builder();
        Self {
            store,
            client,
            clock: Arc::new(SystemClock),
            digester: Arc::new(NoopDigester),
            config,
            builder,
            event_tx: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_digester(mut self, digester: Arc<dyn SampleDigester>) -> Self {
        self.digester = digester;
        self
    }

    /// Send lifecycle events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Run cycles until `cancel` fires.
    ///
    /// A cycle that fails on the store is logged and the next one starts
    /// after the usual interval.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            max_wait_secs = self.config.max_wait.num_seconds(),
            "worker started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.run_cycle().await {
                Ok(report) if !report.is_idle() => debug!(?report, "cycle finished"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "cycle failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("worker stopped");
    }

    /// One full cycle: batch and submit, poll, digest.
    ///
    /// Polling and digestion run even when batching fails on the store; the
    /// first error is returned once all three steps have run.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let batched = self.process_pending_samples(&mut report).await;
        let polled = self.look_for_completed_samples(&mut report).await;
        let digested = self.digest_ready_samples(&mut report).await;
        batched.and(polled).and(digested)?;
        Ok(report)
    }

    /// Batch the pending samples and submit every ready batch.
    ///
    /// A graph error abandons the pass; the samples stay pending and are
    /// batched again from scratch next cycle.
    pub async fn process_pending_samples(&self, report: &mut CycleReport) -> Result<()> {
        let pending = self.store.get_by_status(SampleStatus::Pending).await?;
        report.pending = pending.len();
        if pending.is_empty() {
            return Ok(());
        }

        let (graph, batches) = match batch_samples(&pending, &self.config) {
            Ok(batched) => batched,
            Err(e) if e.is_graph_error() => {
                warn!(error = %e, pending = pending.len(), "batching pass aborted");
                report.batching_aborted = true;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        report.batches = batches.len();

        let samples: HashMap<SampleId, Sample> = pending.into_iter().map(|s| (s.id, s)).collect();
        let now = self.clock.now();

        for batch in &batches {
            let readiness = match evaluate(&graph, batch, now, self.config.max_wait, |id| created_at(&samples, id)) {
                Ok(readiness) => readiness,
                Err(e) => {
                    error!(error = %e, "could not evaluate batch");
                    continue;
                }
            };
            if !readiness.is_ready() {
                debug!(nodes = batch.len(&graph), "batch waiting");
                report.waiting += 1;
                continue;
            }

            let request = match self.builder.build(&graph, batch, &samples) {
                Ok(request) => request,
                Err(e) => {
                    error!(error = %e, "could not build request for batch");
                    continue;
                }
            };
            self.submit_batch(&request, batch.samples(&graph), readiness, report)
                .await;
        }

        Ok(())
    }

    async fn submit_batch(
        &self,
        request: &ExperimentRequest,
        sample_ids: Vec<SampleId>,
        readiness: Readiness,
        report: &mut CycleReport,
    ) {
        let execution_id = match self.client.submit(request).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, samples = sample_ids.len(), "submission failed, samples stay pending");
                report.submission_failures += 1;
                self.emit(WorkerEvent::SubmissionFailed {
                    samples: sample_ids,
                    error: e.to_string(),
                });
                return;
            }
        };

        info!(
            execution_id = %execution_id,
            samples = sample_ids.len(),
            tasks = request.tasks.len(),
            %readiness,
            "batch submitted"
        );
        let now = self.clock.now();
        for id in &sample_ids {
            if let Err(e) = self.store.mark_running(id, &execution_id, now).await {
                error!(sample = %id, execution_id = %execution_id, error = %e, "could not mark sample running");
            }
        }
        report.submitted.push(execution_id.clone());
        self.emit(WorkerEvent::BatchSubmitted {
            execution_id,
            samples: sample_ids,
        });
    }

    /// Poll every running job once and apply finished statuses.
    pub async fn look_for_completed_samples(&self, report: &mut CycleReport) -> Result<()> {
        let running = self.store.get_by_status(SampleStatus::Running).await?;

        let mut by_execution: BTreeMap<ExecutionId, Vec<SampleId>> = BTreeMap::new();
        for sample in running {
            match sample.execution_id {
                Some(execution_id) => by_execution.entry(execution_id).or_default().push(sample.id),
                None => warn!(sample = %sample.id, "running sample has no execution id"),
            }
        }

        for (execution_id, samples) in by_execution {
            let status = match self.client.status(&execution_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "poll failed, will retry");
                    report.poll_failures += 1;
                    self.emit(WorkerEvent::PollFailed {
                        execution_id,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            match status {
                ExecutionStatus::Completed => {
                    info!(execution_id = %execution_id, samples = samples.len(), "execution completed");
                    self.transition_all(&samples, SampleStatus::ReadyForDatabase).await;
                    self.emit(WorkerEvent::ExecutionCompleted { execution_id, samples });
                }
                ExecutionStatus::Error => {
                    warn!(execution_id = %execution_id, samples = samples.len(), "execution failed");
                    report.failed += self.transition_all(&samples, SampleStatus::Failed).await;
                    self.emit(WorkerEvent::ExecutionFailed { execution_id, samples });
                }
                ExecutionStatus::Pending | ExecutionStatus::Running => {
                    debug!(execution_id = %execution_id, %status, "execution in progress");
                }
            }
        }

        Ok(())
    }

    /// Apply `status` to each sample, returning how many succeeded.
    async fn transition_all(&self, samples: &[SampleId], status: SampleStatus) -> usize {
        let now = self.clock.now();
        let mut applied = 0;
        for id in samples {
            match self.store.set_status(id, status, now).await {
                Ok(()) => applied += 1,
                Err(e) => error!(sample = %id, %status, error = %e, "could not update sample status"),
            }
        }
        applied
    }

    /// Hand every sample awaiting digestion to the digester and mark the
    /// accepted ones complete.
    pub async fn digest_ready_samples(&self, report: &mut CycleReport) -> Result<()> {
        let ready = self.store.get_by_status(SampleStatus::ReadyForDatabase).await?;

        for sample in ready {
            if let Err(e) = self.digester.digest(&sample).await {
                warn!(sample = %sample.id, error = %e, "digest failed, will retry");
                report.digest_failures += 1;
                continue;
            }
            match self
                .store
                .set_status(&sample.id, SampleStatus::Complete, self.clock.now())
                .await
            {
                Ok(()) => {
                    debug!(sample = %sample.id, "sample complete");
                    report.completed += 1;
                    self.emit(WorkerEvent::SampleCompleted { sample: sample.id });
                }
                Err(e) => error!(sample = %sample.id, error = %e, "could not mark sample complete"),
            }
        }

        Ok(())
    }

    /// Batch the pending samples and report what would be submitted,
    /// without submitting anything.
    pub async fn plan(&self) -> Result<Vec<BatchPlan>> {
        let pending = self.store.get_by_status(SampleStatus::Pending).await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let (graph, batches) = batch_samples(&pending, &self.config)?;
        let samples: HashMap<SampleId, Sample> = pending.into_iter().map(|s| (s.id, s)).collect();
        let now = self.clock.now();
        let lookup = |id: &SampleId| created_at(&samples, id);

        batches
            .iter()
            .map(|batch| -> Result<BatchPlan> {
                Ok(BatchPlan {
                    samples: batch.samples(&graph),
                    nodes: batch.len(&graph),
                    readiness: evaluate(&graph, batch, now, self.config.max_wait, lookup)?,
                    age: batch_age(&graph, batch, now, lookup)?,
                    request: self.builder.build(&graph, batch, &samples)?,
                })
            })
            .collect()
    }
}
