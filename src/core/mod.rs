//! Core domain models for batching.
//!
//! This module contains the fundamental data structures used throughout
//! the scheduler: samples, task nodes and the task graph.

pub mod graph;
pub mod sample;
pub mod task;

pub use graph::{GraphView, TaskGraph};
pub use sample::{Sample, SampleId, SampleStatus, SampleSubmission, StepSpec};
pub use task::{Parameters, TaskId, TaskNode, TaskSpec};
