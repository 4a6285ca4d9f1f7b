//! Batch construction over realistic workloads.

use std::collections::{HashMap, HashSet};

use labqueue::batching::{merge_all, AnyCompatible, ExactParameters, Readiness};
use labqueue::core::{GraphView, Sample, SampleId, TaskGraph, TaskId};
use labqueue::orchestration::{batch_samples, WorkerConfig};

use crate::fixtures::{at, heating_sample, synthesis_sample, WorkerHarness};

/// Six synthesis runs (five at 600, one at 900) and three plain firings.
fn mixed_workload() -> Vec<Sample> {
    vec![
        synthesis_sample("LiMnO2", at(0), &["Li2CO3", "MnO"], 600),
        synthesis_sample("LiFePO4", at(10), &["Li2CO3", "FePO4"], 600),
        synthesis_sample("NaMnO2", at(20), &["Na2CO3", "MnO"], 600),
        synthesis_sample("NaFePO4", at(30), &["Na2CO3", "FePO4"], 600),
        synthesis_sample("KMnO2", at(40), &["K2CO3", "MnO"], 600),
        synthesis_sample("LiCoO2", at(50), &["Li2CO3", "Co3O4"], 900),
        heating_sample("anneal-a", at(60), 600),
        heating_sample("anneal-b", at(70), 600),
        heating_sample("anneal-c", at(80), 600),
    ]
}

fn assert_partition(graph: &TaskGraph, batches: &[GraphView]) {
    let mut seen: HashSet<TaskId> = HashSet::new();
    for batch in batches {
        for id in batch.node_ids(graph) {
            assert!(seen.insert(id), "node {} is in two batches", id.short());
        }
    }
    let all: HashSet<TaskId> = graph.node_ids().into_iter().collect();
    assert_eq!(seen, all);

    let batch_of: HashMap<TaskId, usize> = batches
        .iter()
        .enumerate()
        .flat_map(|(i, b)| b.node_ids(graph).into_iter().map(move |id| (id, i)))
        .collect();
    for (from, to) in graph.edges() {
        assert_eq!(batch_of[&from], batch_of[&to], "edge crosses batches");
    }
}

/// Test: Merged graph respects every batching invariant
///
/// Given: a mixed workload of synthesis runs and plain firings
/// When: the samples are batched with the default configuration
/// Then: capacities hold, every step survives exactly once, the graph is
///       acyclic and the batches partition it
#[test]
fn test_mixed_workload_invariants() {
    let samples = mixed_workload();
    let (graph, batches) = batch_samples(&samples, &WorkerConfig::default()).unwrap();

    for node in graph.nodes() {
        assert!(
            node.sample_count() <= node.capacity,
            "{} holds {} of {}",
            node.task_type,
            node.sample_count(),
            node.capacity
        );
    }

    let mut occurrences: HashMap<SampleId, usize> = HashMap::new();
    for id in graph.sample_occurrences() {
        *occurrences.entry(id).or_default() += 1;
    }
    for sample in &samples {
        assert_eq!(occurrences[&sample.id], sample.tasks.len(), "steps of {}", sample.name);
    }

    assert!(graph.is_acyclic());
    assert_partition(&graph, &batches);

    for batch in &batches {
        let order = batch.topological_order(&graph).unwrap();
        let position: HashMap<TaskId, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for (from, to) in batch.edges(&graph) {
            assert!(position[&from] < position[&to]);
        }
    }
}

/// Test: Merging shares furnaces and dispensers
///
/// Given: the mixed workload
/// When: batched
/// Then: the synthesis runs share one dispensing node, the 600 degree
///       firings fill a furnace, and the plain firings form their own batch
#[test]
fn test_mixed_workload_shape() {
    let samples = mixed_workload();
    let (graph, batches) = batch_samples(&samples, &WorkerConfig::default()).unwrap();

    let dispensing: Vec<_> = graph.nodes().filter(|n| n.task_type == "Dispensing").collect();
    assert_eq!(dispensing.len(), 1);
    assert_eq!(dispensing[0].sample_count(), 6);
    assert_eq!(dispensing[0].parameters_per_sample.len(), 6);

    let mut heating: Vec<usize> = graph
        .nodes()
        .filter(|n| n.task_type == "Heating")
        .map(|n| n.sample_count())
        .collect();
    heating.sort_unstable();
    // 600 with duration: 4 + 1, 900: 1, plain 600: 3
    assert_eq!(heating, vec![1, 1, 3, 4]);

    assert_eq!(graph.nodes().filter(|n| n.task_type == "Diffraction").count(), 6);

    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].samples(&graph).len(), 6);
    assert_eq!(batches[1].samples(&graph).len(), 3);
}

/// Test: Batching is a fixed point
///
/// Given: an already batched workload
/// When: every merge pass runs again
/// Then: nothing more is absorbed
#[test]
fn test_merging_again_changes_nothing() {
    let samples = mixed_workload();
    let (mut graph, _) = batch_samples(&samples, &WorkerConfig::default()).unwrap();
    let before = graph.node_count();

    assert!(merge_all(&mut graph, "Heating", &ExactParameters).unwrap().is_noop());
    assert!(merge_all(&mut graph, "Dispensing", &AnyCompatible).unwrap().is_noop());
    assert_eq!(graph.node_count(), before);
}

/// Test: Furnace capacity splits a large group
///
/// Given: five identical firings on a furnace of capacity four
/// When: batched
/// Then: two batches, one saturated with four samples and one with the rest
#[test]
fn test_capacity_splits_batches() {
    let samples: Vec<Sample> = (0..5).map(|i| heating_sample(&format!("s{}", i), at(i), 600)).collect();
    let (graph, batches) = batch_samples(&samples, &WorkerConfig::default()).unwrap();

    assert_eq!(graph.node_count(), 2);
    assert_eq!(batches.len(), 2);

    let first: Vec<SampleId> = samples[..4].iter().map(|s| s.id).collect();
    assert_eq!(batches[0].samples(&graph), first);
    assert_eq!(batches[1].samples(&graph), vec![samples[4].id]);
}

/// Test: Different temperatures never share a furnace
#[test]
fn test_strict_types_need_identical_parameters() {
    let samples = vec![
        heating_sample("a", at(0), 600),
        heating_sample("b", at(0), 700),
        heating_sample("c", at(0), 600),
    ];
    let (graph, batches) = batch_samples(&samples, &WorkerConfig::default()).unwrap();

    assert_eq!(graph.node_count(), 2);
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].samples(&graph), vec![samples[0].id, samples[2].id]);
}

/// Test: Dry run reports batches without submitting
///
/// Given: three fresh samples that all share a name
/// When: the worker plans, then plans again once they have waited
/// Then: one waiting batch becomes expired, and the request gives every
///       sample a distinct name
#[tokio::test]
async fn test_plan_reports_batches_and_dedups_names() {
    let samples = vec![
        heating_sample("X", at(0), 600),
        heating_sample("X", at(0), 600),
        heating_sample("X", at(0), 600),
    ];
    let harness = WorkerHarness::new(samples);

    let plans = harness.worker.plan().await.unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].readiness, Readiness::Waiting);
    assert_eq!(plans[0].samples.len(), 3);
    assert_eq!(plans[0].nodes, 1);
    assert_eq!(plans[0].age, chrono::Duration::zero());

    let names: HashSet<String> = plans[0].request.samples.iter().map(|s| s.name.clone()).collect();
    let expected: HashSet<String> = ["X", "X_1", "X_2"].iter().map(|s| s.to_string()).collect();
    assert_eq!(names, expected);
    assert_eq!(plans[0].request.tasks.len(), 1);
    assert_eq!(plans[0].request.tasks[0].samples.len(), 3);

    harness.clock.advance(30 * 60);
    let plans = harness.worker.plan().await.unwrap();
    assert_eq!(plans[0].readiness, Readiness::Expired);
    assert!(harness.client.submitted().is_empty());
}

/// Test: Request encodes dependencies by position
///
/// Given: two synthesis runs at the same temperature
/// When: planned
/// Then: dispensing comes first, heating points at it, each diffraction
///       points at the heating, and dispensing parameters are per sample
#[tokio::test]
async fn test_request_links_steps_by_position() {
    let samples = vec![
        synthesis_sample("A", at(0), &["Li2CO3"], 600),
        synthesis_sample("B", at(5), &["Na2CO3"], 600),
    ];
    let ids: Vec<String> = samples.iter().map(|s| s.id.to_string()).collect();
    let harness = WorkerHarness::new(samples);

    let plans = harness.worker.plan().await.unwrap();
    assert_eq!(plans.len(), 1);
    let request = &plans[0].request;

    let types: Vec<&str> = request.tasks.iter().map(|t| t.task_type.as_str()).collect();
    assert_eq!(types, vec!["Dispensing", "Heating", "Diffraction", "Diffraction"]);
    assert!(request.tasks[0].prev_tasks.is_empty());
    assert_eq!(request.tasks[1].prev_tasks, vec![0]);
    assert_eq!(request.tasks[2].prev_tasks, vec![1]);
    assert_eq!(request.tasks[3].prev_tasks, vec![1]);

    let dispensing = request.tasks[0].parameters.as_object().unwrap();
    assert_eq!(dispensing.len(), 2);
    for id in &ids {
        assert!(dispensing[id]["powder_dispenses"].is_object());
    }
    assert_eq!(request.tasks[1].parameters["temperature"], 600);
    assert_eq!(request.sample_ids(), ids);
}
