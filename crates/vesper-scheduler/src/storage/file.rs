//! Single-document JSON job store.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::JobStorage;
use crate::{Job, StorageError};

/// Stores every job in one JSON array at `path`.
///
/// There is no mutual exclusion between processes: [`claim_job`](JobStorage::claim_job)
/// always succeeds and [`supports_locking`](JobStorage::supports_locking) is `false`.
/// Only run one scheduler against a given file.
#[derive(Debug)]
pub struct FileJobStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileJobStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the raw record array. A missing or empty file is an empty store.
    async fn read_document(&self) -> Result<Vec<Value>, StorageError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        match serde_json::from_str(&content)? {
            Value::Array(records) => Ok(records),
            other => Err(StorageError::Corrupt(format!(
                "{}: expected a JSON array of jobs, found {}",
                self.path.display(),
                json_kind(&other)
            ))),
        }
    }

    /// Split raw records into decodable jobs and records that failed to decode.
    fn decode(&self, records: Vec<Value>) -> (Vec<Job>, Vec<Value>) {
        let mut jobs = Vec::with_capacity(records.len());
        let mut malformed = Vec::new();

        for record in records {
            let decoded = serde_json::from_value::<Job>(record.clone())
                .map_err(|e| e.to_string())
                .and_then(|job| job.validate().map(|()| job));
            match decoded {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    let id = record.get("id").and_then(Value::as_str).unwrap_or("<unknown>");
                    warn!(
                        path = %self.path.display(),
                        id,
                        error = %e,
                        "skipping malformed job record"
                    );
                    malformed.push(record);
                }
            }
        }

        (jobs, malformed)
    }

    /// Write `jobs`, keeping any malformed records they do not replace.
    async fn write_jobs(&self, jobs: &[Job]) -> Result<(), StorageError> {
        let (_, malformed) = self.decode(self.read_document().await?);
        let ids: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();

        let mut records = jobs
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        records.extend(malformed.into_iter().filter(|raw| {
            !raw.get("id")
                .and_then(Value::as_str)
                .is_some_and(|id| ids.contains(id))
        }));

        self.write_document(&records).await
    }

    async fn write_document(&self, records: &[Value]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(records)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), count = records.len(), "wrote job store");
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl JobStorage for FileJobStorage {
    fn name(&self) -> &'static str {
        "file"
    }

    fn supports_locking(&self) -> bool {
        false
    }

    async fn load_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let (jobs, _) = self.decode(self.read_document().await?);
        Ok(jobs)
    }

    async fn save_jobs(&self, jobs: &[Job]) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.write_jobs(jobs).await
    }

    async fn save_job(&self, job: &Job) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.load_jobs().await?;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        self.write_jobs(&jobs).await
    }

    async fn claim_job(&self, _id: &str, _lease_duration: Duration) -> bool {
        true
    }

    async fn release_job(&self, _id: &str) -> Result<(), StorageError> {
        Ok(())
    }
}
