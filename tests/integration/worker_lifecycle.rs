//! Sample lifecycle through the worker: submission, polling and digestion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use labqueue::core::{Sample, SampleStatus};
use labqueue::execution::{ExecutionId, ExecutionStatus};
use labqueue::orchestration::{BatchWorker, SampleDigester, WorkerEvent};
use labqueue::store::{JsonFileStore, SampleStore};
use labqueue::{Error, Result};

use crate::fixtures::{at, heating_sample, synthesis_sample, ManualClock, Reply, ScriptedClient, WorkerHarness};

const MAX_WAIT: i64 = 30 * 60;

fn five_firings() -> Vec<Sample> {
    (0..5).map(|i| heating_sample(&format!("s{}", i), at(i), 600)).collect()
}

fn three_syntheses() -> Vec<Sample> {
    vec![
        synthesis_sample("LiMnO2", at(0), &["Li2CO3", "MnO"], 600),
        synthesis_sample("NaMnO2", at(0), &["Na2CO3", "MnO"], 600),
        synthesis_sample("KMnO2", at(0), &["K2CO3", "MnO"], 600),
    ]
}

/// Submit the three syntheses as `exp-1` by letting them expire.
async fn submit_three(harness: &WorkerHarness) -> Vec<Sample> {
    let samples = harness.store.get_by_status(SampleStatus::Pending).await.unwrap();
    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.waiting, 1);
    assert!(report.submitted.is_empty());

    harness.clock.advance(MAX_WAIT);
    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.submitted, vec![ExecutionId::from("exp-1")]);
    samples
}

/// Test: Rejected submission is retried on the next cycle
///
/// Given: five identical firings, and a service that fails the first
///        submission with HTTP 500
/// When: two cycles run
/// Then: the full batch stays pending after the first, is running under
///       the returned job id after the second, and the leftover sample
///       keeps waiting throughout
#[tokio::test]
async fn test_rejected_submission_retries_next_cycle() {
    let samples = five_firings();
    let mut harness = WorkerHarness::new(samples.clone());
    harness.client.reply(Reply::Reject(500));
    harness.client.reply(Reply::Accept("job-42"));

    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.pending, 5);
    assert_eq!(report.batches, 2);
    assert_eq!(report.waiting, 1);
    assert_eq!(report.submission_failures, 1);
    assert!(report.submitted.is_empty());
    assert_eq!(harness.count(SampleStatus::Pending).await, 5);

    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.submitted, vec![ExecutionId::from("job-42")]);
    assert_eq!(report.waiting, 1);

    for sample in &samples[..4] {
        let stored = harness.store.get_sample(&sample.id).await.unwrap();
        assert_eq!(stored.status, SampleStatus::Running);
        assert_eq!(stored.execution_id, Some(ExecutionId::from("job-42")));
    }
    assert_eq!(harness.status_of(&samples[4].id).await, SampleStatus::Pending);

    let events = harness.drain_events();
    assert!(matches!(
        &events[0],
        WorkerEvent::SubmissionFailed { samples: failed, error } if failed.len() == 4 && error.contains("500")
    ));
    assert!(matches!(
        &events[1],
        WorkerEvent::BatchSubmitted { execution_id, samples: submitted }
            if execution_id.as_str() == "job-42" && submitted.len() == 4
    ));
}

/// Test: Leftover sample is submitted once it has waited long enough
#[tokio::test]
async fn test_partial_batch_submitted_after_max_wait() {
    let samples = five_firings();
    let harness = WorkerHarness::new(samples.clone());

    harness.worker.run_cycle().await.unwrap();
    assert_eq!(harness.count(SampleStatus::Running).await, 4);

    // Age counts from creation, and s4 was created four seconds in.
    harness.clock.advance(MAX_WAIT);
    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.waiting, 1);
    assert_eq!(harness.status_of(&samples[4].id).await, SampleStatus::Pending);

    harness.clock.advance(4);
    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.submitted, vec![ExecutionId::from("exp-2")]);
    assert_eq!(harness.status_of(&samples[4].id).await, SampleStatus::Running);

    let submitted = harness.client.submitted();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[1].samples.len(), 1);
    assert_eq!(submitted[1].samples[0].name, "s4");
}

/// Test: Completed job carries its samples to Complete
///
/// Given: three syntheses submitted as one job
/// When: the service reports the job COMPLETED
/// Then: one cycle moves them through ReadyForDatabase to Complete and
///       the events tell the story in order
#[tokio::test]
async fn test_completed_execution_completes_samples() {
    let mut harness = WorkerHarness::new(three_syntheses());
    let samples = submit_three(&harness).await;

    let submitted = harness.client.submitted();
    assert_eq!(submitted[0].samples.len(), 3);
    assert_eq!(submitted[0].tasks.len(), 5);

    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.completed, 0);
    assert_eq!(harness.count(SampleStatus::Running).await, 3);

    harness.client.set_status("exp-1", ExecutionStatus::Completed);
    harness.clock.advance(60);
    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.completed, 3);

    for sample in &samples {
        let stored = harness.store.get_sample(&sample.id).await.unwrap();
        assert_eq!(stored.status, SampleStatus::Complete);
        assert_eq!(stored.updated_at, at(MAX_WAIT + 60));
    }

    let events = harness.drain_events();
    assert!(matches!(events[0], WorkerEvent::BatchSubmitted { .. }));
    assert!(matches!(
        &events[1],
        WorkerEvent::ExecutionCompleted { samples: done, .. } if done.len() == 3
    ));
    let completed = events[2..]
        .iter()
        .filter(|e| matches!(e, WorkerEvent::SampleCompleted { .. }))
        .count();
    assert_eq!(completed, 3);

    assert!(harness.worker.run_cycle().await.unwrap().is_idle());
}

/// Test: Failed job fails its samples
#[tokio::test]
async fn test_failed_execution_fails_samples() {
    let mut harness = WorkerHarness::new(three_syntheses());
    submit_three(&harness).await;

    harness.client.set_status("exp-1", ExecutionStatus::Error);
    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.failed, 3);
    assert_eq!(report.completed, 0);
    assert_eq!(harness.count(SampleStatus::Failed).await, 3);

    let events = harness.drain_events();
    assert!(matches!(
        events.last(),
        Some(WorkerEvent::ExecutionFailed { execution_id, samples }) if execution_id.as_str() == "exp-1" && samples.len() == 3
    ));

    assert!(harness.worker.run_cycle().await.unwrap().is_idle());
}

/// Test: Poll failure leaves samples running until the next answer
#[tokio::test]
async fn test_poll_failure_is_retried() {
    let mut harness = WorkerHarness::new(three_syntheses());
    submit_three(&harness).await;

    harness.client.fail_status("exp-1");
    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.poll_failures, 1);
    assert_eq!(harness.count(SampleStatus::Running).await, 3);
    assert!(matches!(
        harness.drain_events().last(),
        Some(WorkerEvent::PollFailed { error, .. }) if error.contains("502")
    ));

    harness.client.set_status("exp-1", ExecutionStatus::Completed);
    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.poll_failures, 0);
    assert_eq!(report.completed, 3);
}

/// Test: Each running job is polled once and settled independently
///
/// Given: eight firings submitted as two saturated jobs
/// When: only the second job completes
/// Then: its four samples complete and the other four keep running
#[tokio::test]
async fn test_jobs_settle_independently() {
    let samples: Vec<Sample> = (0..8).map(|i| heating_sample(&format!("s{}", i), at(i), 600)).collect();
    let harness = WorkerHarness::new(samples.clone());

    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(
        report.submitted,
        vec![ExecutionId::from("exp-1"), ExecutionId::from("exp-2")]
    );

    harness.client.polled.lock().unwrap().clear();
    harness.client.set_status("exp-2", ExecutionStatus::Completed);
    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.completed, 4);

    let polled = harness.client.polled.lock().unwrap().clone();
    assert_eq!(polled, vec![ExecutionId::from("exp-1"), ExecutionId::from("exp-2")]);

    for sample in &samples[..4] {
        assert_eq!(harness.status_of(&sample.id).await, SampleStatus::Running);
    }
    for sample in &samples[4..] {
        assert_eq!(harness.status_of(&sample.id).await, SampleStatus::Complete);
    }
}

/// Fails the first digest it sees, then accepts everything.
#[derive(Default)]
struct FlakyDigester {
    calls: AtomicUsize,
}

#[async_trait]
impl SampleDigester for FlakyDigester {
    async fn digest(&self, sample: &Sample) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::Validation(format!("database unavailable for {}", sample.name)));
        }
        Ok(())
    }
}

/// Test: Digest failure keeps the sample ready for another attempt
#[tokio::test]
async fn test_digest_failure_is_retried() {
    let mut harness = WorkerHarness::new(three_syntheses());
    let digester = Arc::new(FlakyDigester::default());
    harness.worker = harness.worker.with_digester(digester.clone());
    submit_three(&harness).await;

    harness.client.set_status("exp-1", ExecutionStatus::Completed);
    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.digest_failures, 1);
    assert_eq!(report.completed, 2);
    assert_eq!(harness.count(SampleStatus::ReadyForDatabase).await, 1);

    let report = harness.worker.run_cycle().await.unwrap();
    assert_eq!(report.digest_failures, 0);
    assert_eq!(report.completed, 1);
    assert_eq!(harness.count(SampleStatus::Complete).await, 3);
    assert_eq!(digester.calls.load(Ordering::SeqCst), 4);
}

/// Test: Worker state survives in the JSON store
///
/// Given: samples inserted into a file-backed store
/// When: a worker submits them and a second store opens the same file
/// Then: the second store sees them running under the job id
#[tokio::test]
async fn test_file_store_end_to_end() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("samples.json");
    let store = Arc::new(JsonFileStore::new(&path));

    let mut ids = Vec::new();
    for sample in five_firings().into_iter().take(4) {
        ids.push(store.insert(sample).await.unwrap());
    }

    let client = Arc::new(ScriptedClient::new());
    client.reply(Reply::Accept("job-7"));
    let worker = BatchWorker::new(store.clone(), client.clone(), Default::default())
        .with_clock(Arc::new(ManualClock::new(at(0))));

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.submitted, vec![ExecutionId::from("job-7")]);

    let reopened = JsonFileStore::new(&path);
    let running = reopened.get_by_status(SampleStatus::Running).await.unwrap();
    assert_eq!(running.iter().map(|s| s.id).collect::<Vec<_>>(), ids);
    assert!(running
        .iter()
        .all(|s| s.execution_id == Some(ExecutionId::from("job-7"))));

    client.set_status("job-7", ExecutionStatus::Completed);
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.completed, 4);
    assert_eq!(reopened.get_by_status(SampleStatus::Complete).await.unwrap().len(), 4);
}

/// Test: Cancelled worker stops without another cycle
#[tokio::test]
async fn test_cancelled_before_start_does_nothing() {
    let harness = WorkerHarness::new(five_firings());
    let cancel = CancellationToken::new();
    cancel.cancel();

    harness.worker.run(cancel).await;

    assert!(harness.client.submitted().is_empty());
    assert_eq!(harness.count(SampleStatus::Pending).await, 5);
}

/// Test: Run loop keeps cycling until cancelled
///
/// Given: a worker running in the background on paused time
/// When: the job completes between cycles and the token is cancelled
/// Then: the loop has submitted, polled and completed the batch, and exits
#[tokio::test(start_paused = true)]
async fn test_run_loop_until_cancelled() {
    let samples: Vec<Sample> = (0..4).map(|i| heating_sample(&format!("s{}", i), at(i), 600)).collect();
    let harness = WorkerHarness::new(samples);
    let interval = harness.worker.config().poll_interval;

    let WorkerHarness {
        worker,
        store,
        client,
        mut event_rx,
        ..
    } = harness;

    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    match event_rx.recv().await {
        Some(WorkerEvent::BatchSubmitted { execution_id, .. }) => assert_eq!(execution_id.as_str(), "exp-1"),
        other => panic!("expected a submission, got {:?}", other),
    }

    client.set_status("exp-1", ExecutionStatus::Completed);
    tokio::time::sleep(interval * 3).await;

    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(store.get_by_status(SampleStatus::Complete).await.unwrap().len(), 4);
    assert_eq!(client.submitted().len(), 1);
}
