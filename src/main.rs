use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use labqueue::config::Config;
use labqueue::core::{SampleStatus, SampleSubmission};
use labqueue::execution::HttpExecutionClient;
use labqueue::orchestration::{BatchWorker, WorkerEvent};
use labqueue::store::{JsonFileStore, SampleStore};
use labqueue::Result;

/// Labqueue - batches lab samples into experiments and tracks them to completion
#[derive(Parser, Debug)]
#[command(name = "labqueue")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    LABQUEUE_DEBUG=1     Enable debug logging (alternative to --debug)\n    LABQUEUE_LOG=<filter>  Log filter directive, e.g. labqueue=trace")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.labqueue/labqueue.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Sample store file, overriding the config
    #[arg(short = 's', long, global = true)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the batching worker until interrupted
    Run,

    /// Add samples from a JSON file (one submission or an array of them)
    Submit {
        /// Path to the JSON file
        file: PathBuf,
    },

    /// Show how pending samples would be batched right now, without submitting
    Plan {
        /// Print the full request body of each batch
        #[arg(long)]
        json: bool,
    },

    /// List samples, optionally only those in one status
    Status {
        /// pending, running, readyfordatabase, complete or failed
        status: Option<SampleStatus>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    labqueue::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let store_path = match cli.store {
        Some(path) => path,
        None => config.effective_store_path()?,
    };
    let store = Arc::new(JsonFileStore::new(store_path));

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Run => rt.block_on(run_worker(config, store)),
        Command::Submit { file } => rt.block_on(run_submit(&file, store)),
        Command::Plan { json } => rt.block_on(run_plan(config, store, json)),
        Command::Status { status } => rt.block_on(run_status(status, store)),
    }
}

fn build_worker(config: &Config, store: Arc<JsonFileStore>) -> Result<BatchWorker> {
    let client = HttpExecutionClient::new(&config.api_url, config.request_timeout())?;
    Ok(BatchWorker::new(store, Arc::new(client), config.worker_config()))
}

/// Run the worker until Ctrl-C.
async fn run_worker(config: Config, store: Arc<JsonFileStore>) -> Result<()> {
    info!(
        api_url = %config.api_url,
        store = %store.path().display(),
        "starting labqueue worker"
    );

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let worker = build_worker(&config, store)?.with_events(event_tx);

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current cycle");
        } else {
            warn!("could not listen for interrupt");
        }
        cancel_on_signal.cancel();
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("{}", describe_event(&event));
        }
    });

    worker.run(cancel).await;
    drop(worker);
    let _ = printer.await;
    Ok(())
}

fn describe_event(event: &WorkerEvent) -> String {
    match event {
        WorkerEvent::BatchSubmitted { execution_id, samples } => {
            format!("submitted {} sample(s) as {}", samples.len(), execution_id)
        }
        WorkerEvent::SubmissionFailed { samples, error } => {
            format!("submission of {} sample(s) failed: {}", samples.len(), error)
        }
        WorkerEvent::ExecutionCompleted { execution_id, samples } => {
            format!("{} completed ({} sample(s))", execution_id, samples.len())
        }
        WorkerEvent::ExecutionFailed { execution_id, samples } => {
            format!("{} failed ({} sample(s))", execution_id, samples.len())
        }
        WorkerEvent::PollFailed { execution_id, error } => {
            format!("could not poll {}: {}", execution_id, error)
        }
        WorkerEvent::SampleCompleted { sample } => format!("sample {} complete", sample),
    }
}

/// Read submissions from `file` and add them to the store as pending samples.
async fn run_submit(file: &Path, store: Arc<JsonFileStore>) -> Result<()> {
    let contents = fs::read_to_string(file)?;
    let submissions = parse_submissions(&contents)?;

    let now = Utc::now();
    for submission in submissions {
        let sample = submission.into_sample(now)?;
        let name = sample.name.clone();
        let steps = sample.tasks.len();
        let id = store.insert(sample).await?;
        println!("{}  {}  ({} steps)", id, name, steps);
    }
    Ok(())
}

fn parse_submissions(contents: &str) -> Result<Vec<SampleSubmission>> {
    let value: serde_json::Value = serde_json::from_str(contents)?;
    if value.is_array() {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}

async fn run_plan(config: Config, store: Arc<JsonFileStore>, json: bool) -> Result<()> {
    let worker = build_worker(&config, store)?;
    let plans = worker.plan().await?;

    if plans.is_empty() {
        println!("No pending samples.");
        return Ok(());
    }

    for (i, plan) in plans.iter().enumerate() {
        println!(
            "batch {}: {} sample(s), {} task(s), age {}s, {}",
            i + 1,
            plan.samples.len(),
            plan.nodes,
            plan.age.num_seconds(),
            plan.readiness
        );
        if json {
            println!("{}", serde_json::to_string_pretty(&plan.request)?);
        }
    }
    Ok(())
}

async fn run_status(status: Option<SampleStatus>, store: Arc<JsonFileStore>) -> Result<()> {
    let statuses = match status {
        Some(status) => vec![status],
        None => vec![
            SampleStatus::Pending,
            SampleStatus::Running,
            SampleStatus::ReadyForDatabase,
            SampleStatus::Complete,
            SampleStatus::Failed,
        ],
    };

    for status in statuses {
        let samples = store.get_by_status(status).await?;
        println!("{} ({})", status, samples.len());
        for sample in samples {
            let execution = sample
                .execution_id
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {}  {:<24}  {}  {}",
                sample.id,
                sample.name,
                execution,
                sample.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}
