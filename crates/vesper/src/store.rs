//! Storage backend selection and scheduler construction.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};
use miette::Result;
use tracing::{info, warn};
use vesper_scheduler::{
    FileJobStorage, JobStorage, Scheduler, SchedulerConfig, SqliteJobStorage,
};

use crate::handlers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Single JSON document. Only one process may use it at a time, so do
    /// not schedule into it while `vesper run` is active
    File,
    /// SQLite database with lease-based claims, safe for replicas
    Sqlite,
}

impl Backend {
    fn default_file_name(self) -> &'static str {
        match self {
            Backend::File => "jobs.json",
            Backend::Sqlite => "jobs.db",
        }
    }
}

/// Options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    /// Storage backend
    #[arg(long, global = true, env = "VESPER_BACKEND", value_enum, default_value = "file")]
    pub backend: Backend,

    /// Path to the job store (defaults to the user data directory)
    #[arg(long, global = true, env = "VESPER_STORE")]
    pub store: Option<PathBuf>,

    /// Table holding the jobs (sqlite backend)
    #[arg(long, global = true, env = "VESPER_COLLECTION", default_value = "jobs")]
    pub collection: String,

    /// Claim lease in seconds
    #[arg(long, global = true, env = "VESPER_LEASE_SECS", default_value = "300")]
    pub lease_secs: u64,

    /// Delay before retrying a failed job, in seconds
    #[arg(long, global = true, env = "VESPER_RETRY_DELAY_SECS", default_value = "300")]
    pub retry_delay_secs: u64,

    /// Default attempt limit for new jobs
    #[arg(long, global = true, env = "VESPER_MAX_ATTEMPTS", default_value = "3")]
    pub max_attempts: u32,

    /// Upper bound on the sleep between ticks, in seconds
    #[arg(long, global = true, env = "VESPER_POLL_INTERVAL", default_value = "60")]
    pub poll_interval: u64,
}

impl StoreArgs {
    /// Resolve the store path, falling back to `<data_dir>/vesper/<file>`.
    pub fn store_path(&self) -> PathBuf {
        self.store.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vesper")
                .join(self.backend.default_file_name())
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_lease_duration(Duration::from_secs(self.lease_secs))
            .with_retry_delay(Duration::from_secs(self.retry_delay_secs))
            .with_poll_interval(Duration::from_secs(self.poll_interval))
            .with_default_max_attempts(self.max_attempts)
    }

    pub fn open_storage(&self) -> Result<Arc<dyn JobStorage>> {
        let path = self.store_path();
        let storage: Arc<dyn JobStorage> = match self.backend {
            Backend::File => Arc::new(FileJobStorage::new(&path)),
            Backend::Sqlite => Arc::new(
                SqliteJobStorage::open(&path, &self.collection)
                    .map_err(|e| miette::miette!("failed to open job store: {}", e))?,
            ),
        };

        info!(backend = storage.name(), path = %path.display(), "opened job store");
        Ok(storage)
    }

    /// Build a scheduler over the configured store with the built-in handlers.
    pub fn open_scheduler(&self) -> Result<Scheduler> {
        let scheduler = Scheduler::with_config(self.open_storage()?, self.scheduler_config())
            .map_err(|e| miette::miette!("{}", e))?;
        handlers::register_builtin(&scheduler).map_err(|e| miette::miette!("{}", e))?;
        Ok(scheduler)
    }
}

/// Warn when another process writing this store would race with us.
///
/// Returns whether a warning was logged.
pub fn warn_if_unlocked(scheduler: &Scheduler) -> bool {
    let unlocked = !scheduler.storage().supports_locking();
    if unlocked {
        warn!(
            backend = scheduler.storage().name(),
            "backend has no cross-process locking, only one vesper process may use this store at a time"
        );
    }
    unlocked
}
