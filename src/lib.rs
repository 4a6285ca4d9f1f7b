pub mod batching;
pub mod config;
pub mod core;
pub mod error;
pub mod execution;
pub mod log;
pub mod orchestration;
pub mod store;
pub mod util;

pub use error::{Error, Result};
