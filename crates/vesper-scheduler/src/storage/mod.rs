//! Job persistence and claim backends.
//!
//! A backend stores the full job set and, optionally, arbitrates which worker
//! may execute a job. Two implementations ship with the crate:
//!
//! | Backend              | Layout                          | Locking |
//! |----------------------|---------------------------------|---------|
//! | [`FileJobStorage`]   | one JSON array document         | none    |
//! | [`SqliteJobStorage`] | one row per job in a collection | leases  |

use std::time::Duration;

use async_trait::async_trait;

use crate::{Job, StorageError};

mod file;
mod sqlite;

pub use file::FileJobStorage;
pub use sqlite::SqliteJobStorage;

/// Persistence and distributed claiming over the job set.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Whether [`claim_job`](JobStorage::claim_job) actually excludes other workers.
    ///
    /// Backends returning `false` are only safe with a single scheduler process.
    fn supports_locking(&self) -> bool;

    /// Return every decodable job. Order is unspecified.
    ///
    /// Records that cannot be decoded are logged and left out, but stay in storage.
    async fn load_jobs(&self) -> Result<Vec<Job>, StorageError>;

    /// Overwrite the persisted set with `jobs`.
    async fn save_jobs(&self, jobs: &[Job]) -> Result<(), StorageError>;

    /// Load a single job by id.
    async fn load_job(&self, id: &str) -> Result<Option<Job>, StorageError> {
        Ok(self.load_jobs().await?.into_iter().find(|j| j.id == id))
    }

    /// Insert or replace a single job.
    async fn save_job(&self, job: &Job) -> Result<(), StorageError> {
        let mut jobs = self.load_jobs().await?;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job.clone(),
            None => jobs.push(job.clone()),
        }
        self.save_jobs(&jobs).await
    }

    /// Try to take exclusive execution rights over `id` for `lease_duration`.
    ///
    /// Returns `false` without side effects if another worker holds a live
    /// lease. Backend failures are reported as `false`: a job never runs
    /// without a confirmed claim.
    async fn claim_job(&self, id: &str, lease_duration: Duration) -> bool;

    /// Drop any lease on `id`. A no-op if none is held.
    async fn release_job(&self, id: &str) -> Result<(), StorageError>;
}
