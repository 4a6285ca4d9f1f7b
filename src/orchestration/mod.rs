//! Orchestration layer: the scheduling loop and the collaborators it is
//! driven by besides the store and the execution service.

pub mod clock;
pub mod digest;
pub mod worker;

pub use clock::{Clock, SystemClock};
pub use digest::{NoopDigester, SampleDigester};
pub use worker::{batch_samples, BatchPlan, BatchWorker, CycleReport, WorkerConfig, WorkerEvent};
