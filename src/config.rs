use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::batching::request::DEFAULT_REQUEST_NAME;
use crate::orchestration::worker::{WorkerConfig, DEFAULT_MAX_WAIT_SECS};
use crate::{Error, Result};

pub const DEFAULT_API_URL: &str = "http://localhost:8896";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the execution service.
    pub api_url: String,
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
    /// Per-request HTTP timeout. Unset uses the client default.
    pub request_timeout_secs: Option<u64>,
    pub store_path: Option<String>,
    pub request_name: String,
    pub strict_merge_types: Vec<String>,
    pub regional_merge_types: Vec<String>,
    pub per_sample_parameter_types: Vec<String>,
    pub rank_by_reagent_overlap: bool,
}

impl Default for Config {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            poll_interval_secs: worker.poll_interval.as_secs(),
            max_wait_secs: DEFAULT_MAX_WAIT_SECS as u64,
            request_timeout_secs: None,
            store_path: None,
            request_name: DEFAULT_REQUEST_NAME.to_string(),
            strict_merge_types: worker.strict_merge_types,
            regional_merge_types: worker.regional_merge_types,
            per_sample_parameter_types: worker.per_sample_parameter_types,
            rank_by_reagent_overlap: worker.rank_by_reagent_overlap,
        }
    }
}

impl Config {
    pub fn labqueue_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".labqueue"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::labqueue_dir()?.join("labqueue.toml"))
    }

    /// Where the JSON sample store lives.
    pub fn effective_store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::labqueue_dir()?.join("samples.json")),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_wait: chrono::Duration::seconds(self.max_wait_secs as i64),
            request_name: self.request_name.clone(),
            strict_merge_types: self.strict_merge_types.clone(),
            regional_merge_types: self.regional_merge_types.clone(),
            per_sample_parameter_types: self.per_sample_parameter_types.clone(),
            rank_by_reagent_overlap: self.rank_by_reagent_overlap,
        }
    }

    /// Load `~/.labqueue/labqueue.toml`, or defaults if it does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            api_url = %config.api_url,
            poll_interval_secs = config.poll_interval_secs,
            max_wait_secs = config.max_wait_secs,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
