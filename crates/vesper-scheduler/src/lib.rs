//! Durable deferred-job scheduler for Vesper.
//!
//! This crate provides a persistent scheduler that:
//! - Defers work to an absolute UTC instant
//! - Survives crashes and restarts by persisting every job to a storage backend
//! - Excludes concurrent workers through lease-based claims (transactional backend)
//! - Retries failed handlers with a fixed backoff up to a per-job attempt limit
//!
//! A tick is the unit of progress: [`Scheduler::run_tick`] reloads the job set,
//! claims and executes every due job, and reports aggregate counters. It can be
//! driven by the built-in sleep loop ([`Scheduler::start`]) or by an external
//! trigger, possibly from several replicas at once.
//!
//! # Known gap
//!
//! A job whose worker dies after marking it `running` stays `running`. Leases
//! only guard claim acquisition; nothing reclaims in-flight work.

mod config;
mod error;
mod registry;
mod scheduler;
pub mod storage;
mod types;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, StorageError};
pub use registry::{HandlerRegistry, JobHandler};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use storage::{FileJobStorage, JobStorage, SqliteJobStorage};
pub use types::{ExecutionOutcome, Job, JobPayload, JobStatus, TickReport, classify_failure};
