//! Batching engine: merge per-sample task graphs into capacity-respecting
//! batches, split them into independently schedulable components, decide
//! when each one is ready and turn it into an execution request.

pub mod merge;
pub mod partition;
pub mod readiness;
pub mod request;

pub use merge::{merge_all, merge_nodes, AnyCompatible, ExactParameters, MergePolicy, MergeReport, ReagentOverlap};
pub use partition::{component_of, connected_components};
pub use readiness::{batch_age, evaluate, is_saturated, Readiness};
pub use request::{unique_sample_name, ExperimentRequest, RequestBuilder, RequestSample, RequestTask};
