//! Structured logging for labqueue.
//!
//! Log levels:
//! - ERROR: A status write or lookup failed for a sample
//! - WARN: Recoverable failures (submission, polling, digestion, aborted batching pass)
//! - INFO: Worker start/stop, submitted batches, finished executions
//! - DEBUG: Per-cycle detail (batches waiting, merge passes, store I/O)
//! - TRACE: Individual merge decisions
//!
//! Priority for the filter:
//! 1. `--debug` flag
//! 2. `LABQUEUE_DEBUG=1` env var
//! 3. `LABQUEUE_LOG` env var, any `EnvFilter` directive (e.g. "labqueue=trace")
//! 4. default to `info`

use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "LABQUEUE_DEBUG";
const FILTER_ENV: &str = "LABQUEUE_LOG";

/// Initialize logging at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging to stderr with explicit debug mode setting.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var(DEBUG_ENV).map(|v| is_truthy(&v)).unwrap_or(false);
    let directive = std::env::var(FILTER_ENV).ok();

    let filter = filter_for(debug || env_debug, directive.as_deref());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn filter_for(debug: bool, directive: Option<&str>) -> EnvFilter {
    if debug {
        return EnvFilter::new("debug");
    }
    directive
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
