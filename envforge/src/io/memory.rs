//! ResultMemory: prior successful runs, shared across processes.
//!
//! `results.json` is a JSON array of [`MemoryRecord`]s. Every access holds an
//! advisory lock on a sibling `results.json.lock` file: shared for reads,
//! exclusive for read-modify-write. Writes go through a temp file and rename.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use tracing::{debug, info, instrument};

use crate::core::types::MemoryRecord;
use crate::core::version::closest_record;

const MEMORY_FILE: &str = "results.json";
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Read/append access to prior successful records.
pub trait MemoryStore {
    /// Create the backing store if it does not exist yet.
    fn ensure(&self) -> Result<()>;

    /// Closest record for `repo` at `version`, if any.
    fn closest(&self, repo: &str, version: &str) -> Result<Option<MemoryRecord>>;

    fn append(&self, record: MemoryRecord) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileMemoryStore {
    path: PathBuf,
    lock_timeout: Duration,
}

struct MemoryLock {
    file: File,
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl FileMemoryStore {
    /// Store at `<results_dir>/results.json`.
    pub fn new(results_dir: &Path, lock_timeout: Duration) -> Self {
        Self {
            path: results_dir.join(MEMORY_FILE),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self, exclusive: bool) -> Result<MemoryLock> {
        let parent = self
            .path
            .parent()
            .with_context(|| format!("memory path missing parent {}", self.path.display()))?;
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        let lock_path = self.path.with_extension("json.lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("open {}", lock_path.display()))?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err).with_context(|| format!("lock {}", lock_path.display()));
                    }
                    if start.elapsed() >= self.lock_timeout {
                        return Err(anyhow!(
                            "Timed out waiting for memory lock ({}s)",
                            self.lock_timeout.as_secs()
                        ));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
            }
        }
        Ok(MemoryLock { file })
    }

    fn read_records(&self) -> Result<Vec<MemoryRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&contents).with_context(|| format!("parse {}", self.path.display()))
    }

    fn write_records(&self, records: &[MemoryRecord]) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(records).context("serialize memory records")?;
        buf.push('\n');
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

impl MemoryStore for FileMemoryStore {
    fn ensure(&self) -> Result<()> {
        let _lock = self.lock(true)?;
        if !self.path.exists() {
            debug!(path = %self.path.display(), "creating empty memory store");
            self.write_records(&[])?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(repo = %repo, version = %version))]
    fn closest(&self, repo: &str, version: &str) -> Result<Option<MemoryRecord>> {
        let records = {
            let _lock = self.lock(false)?;
            self.read_records()?
        };
        let found = closest_record(&records, repo, version).cloned();
        debug!(
            candidates = records.len(),
            matched = ?found.as_ref().map(|record| record.task.version.as_str()),
            "memory lookup"
        );
        Ok(found)
    }

    #[instrument(skip_all, fields(task_id = %record.task.id))]
    fn append(&self, record: MemoryRecord) -> Result<()> {
        let _lock = self.lock(true)?;
        let mut records = self.read_records()?;
        records.push(record);
        self.write_records(&records)?;
        info!(total = records.len(), "memory record appended");
        Ok(())
    }
}
