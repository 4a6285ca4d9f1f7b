use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

use super::{SampleStore, SampleTable};
use crate::core::sample::{Sample, SampleId, SampleStatus};
use crate::execution::ExecutionId;
use crate::util::blocking;
use crate::Result;

/// Store backed by a single JSON file.
///
/// Every operation reads the file, so samples submitted by another process
/// are seen on the next call. Each write holds an exclusive lock on a
/// sibling `.lock` file for the whole read-modify-write, then saves through
/// a uniquely named temp file renamed over the original. Readers never see a
/// partial file and never take the lock.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    /// Serializes writers from this handle before they queue on the file lock.
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SampleTable) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        blocking(move || f(&load_table(&path)?)).await
    }

    async fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SampleTable) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        blocking(move || {
            let _file_lock = lock_exclusive(&path)?;
            let mut table = load_table(&path)?;
            let out = f(&mut table)?;
            save_table(&path, &table)?;
            Ok(out)
        })
        .await
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Block until this handle holds the store's lock file exclusively. The lock
/// is released when the returned file is dropped.
fn lock_exclusive(path: &Path) -> Result<File> {
    let dir = parent_dir(path);
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path(path))?;
    file.lock_exclusive()?;
    Ok(file)
}

fn load_table(path: &Path) -> Result<SampleTable> {
    if !path.exists() {
        debug!(path = %path.display(), "sample file not found, starting empty");
        return Ok(SampleTable::default());
    }
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Callers must hold the lock from [`lock_exclusive`].
fn save_table(path: &Path, table: &SampleTable) -> Result<()> {
    let mut temp = NamedTempFile::new_in(parent_dir(path))?;
    serde_json::to_writer_pretty(&mut temp, table)?;
    temp.persist(path).map_err(|e| e.error)?;
    debug!(path = %path.display(), samples = table.samples.len(), "sample file saved");
    Ok(())
}

#[async_trait]
impl SampleStore for JsonFileStore {
    async fn insert(&self, sample: Sample) -> Result<SampleId> {
        self.update(move |table| table.insert(sample)).await
    }

    async fn remove(&self, id: &SampleId) -> Result<Sample> {
        let id = *id;
        self.update(move |table| table.remove(&id)).await
    }

    async fn get_by_status(&self, status: SampleStatus) -> Result<Vec<Sample>> {
        self.read(move |table| Ok(table.by_status(status))).await
    }

    async fn get_sample(&self, id: &SampleId) -> Result<Sample> {
        let id = *id;
        self.read(move |table| table.get(&id).cloned()).await
    }

    async fn set_status(&self, id: &SampleId, status: SampleStatus, now: DateTime<Utc>) -> Result<()> {
        let id = *id;
        self.update(move |table| table.set_status(&id, status, now)).await
    }

    async fn mark_running(&self, id: &SampleId, execution_id: &ExecutionId, now: DateTime<Utc>) -> Result<()> {
        let id = *id;
        let execution_id = execution_id.clone();
        self.update(move |table| table.mark_running(&id, &execution_id, now))
            .await
    }
}
