//! Integration test suite for labqueue.
//!
//! These tests drive the batching engine and the worker through their
//! public API: samples go in, experiment requests come out, and the
//! worker carries each sample from pending to complete.
//!
//! # Test Categories
//!
//! - `batching_e2e`: Batch construction over realistic workloads
//! - `worker_lifecycle`: Submission, polling and digestion across cycles
//!
//! # CI Compatibility
//!
//! The execution service is replaced by a scripted client, so no network
//! access is needed.


mod batching_e2e;
mod worker_lifecycle;
