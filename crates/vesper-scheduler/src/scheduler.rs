//! Job scheduler implementation.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    ExecutionOutcome, HandlerRegistry, Job, JobHandler, JobPayload, JobStatus, JobStorage,
    SchedulerConfig, SchedulerError, TickReport, classify_failure,
};

/// Minimum sleep duration between scheduler checks.
const MIN_SLEEP_SECS: u64 = 1;

/// The job scheduler.
///
/// Every tick works on its own snapshot of the job set, loaded from storage at
/// the start of the tick. Mutations of a claimed job are written through to
/// storage immediately, so one worker's stale snapshot never overwrites
/// another worker's results. Ticks within one process are serialized.
pub struct Scheduler {
    storage: Arc<dyn JobStorage>,
    registry: HandlerRegistry,
    config: SchedulerConfig,
    tick_lock: Mutex<()>,
}

impl Scheduler {
    /// Create a scheduler with the default configuration.
    pub fn new(storage: Arc<dyn JobStorage>) -> Self {
        Self {
            storage,
            registry: HandlerRegistry::new(),
            config: SchedulerConfig::default(),
            tick_lock: Mutex::new(()),
        }
    }

    /// Create a scheduler with a validated configuration.
    pub fn with_config(
        storage: Arc<dyn JobStorage>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new(storage)
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Register the handler that executes jobs of `job_type`.
    pub fn register_handler<H>(&self, job_type: &str, handler: H) -> Result<(), SchedulerError>
    where
        H: JobHandler + 'static,
    {
        self.registry.register(job_type, handler)
    }

    /// Schedule a job with the configured default attempt limit.
    ///
    /// The job type is not checked against registered handlers: the handler
    /// may be registered later or by another process.
    pub async fn schedule_job(
        &self,
        job_type: &str,
        schedule_at: DateTime<Utc>,
        payload: JobPayload,
    ) -> Result<String, SchedulerError> {
        self.schedule_job_with_attempts(
            job_type,
            schedule_at,
            payload,
            self.config.default_max_attempts,
        )
        .await
    }

    /// Schedule a job that may fail at most `max_attempts` times.
    #[tracing::instrument(skip(self, payload))]
    pub async fn schedule_job_with_attempts(
        &self,
        job_type: &str,
        schedule_at: DateTime<Utc>,
        payload: JobPayload,
        max_attempts: u32,
    ) -> Result<String, SchedulerError> {
        if job_type.trim().is_empty() {
            return Err(SchedulerError::InvalidJobType(job_type.to_string()));
        }
        if max_attempts == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let job = Job::new(job_type, schedule_at, payload, max_attempts);
        self.storage.save_job(&job).await?;

        info!(id = %job.id, job_type, schedule_at = %schedule_at, "scheduled job");
        Ok(job.id)
    }

    /// Get a job by id.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, SchedulerError> {
        Ok(self.storage.load_job(id).await?)
    }

    /// All pending jobs, earliest first.
    pub async fn get_pending_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        let mut jobs: Vec<Job> = self
            .storage
            .load_jobs()
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        jobs.sort_by(|a, b| a.schedule_at.cmp(&b.schedule_at));
        Ok(jobs)
    }

    /// All jobs, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        let mut jobs = self.storage.load_jobs().await?;
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    /// Run one tick: claim and execute every due job, one at a time.
    ///
    /// Job-level failures are recorded on the job and counted. Storage
    /// failures abort the tick and are returned; claims taken by the tick are
    /// still released.
    #[tracing::instrument(skip(self), fields(backend = self.storage.name()))]
    pub async fn run_tick(&self) -> Result<TickReport, SchedulerError> {
        let _guard = self.tick_lock.lock().await;

        let snapshot = self.storage.load_jobs().await?;
        let now = Utc::now();

        let mut report = TickReport {
            jobs_checked: snapshot.len(),
            ..TickReport::default()
        };

        let due: Vec<Job> = snapshot.into_iter().filter(|j| j.is_due_at(now)).collect();
        report.jobs_due = due.len();

        for job in due {
            self.process_due_job(job, &mut report).await?;
        }

        if report.jobs_due > 0 {
            info!(
                checked = report.jobs_checked,
                due = report.jobs_due,
                executed = report.jobs_executed,
                succeeded = report.jobs_succeeded,
                failed = report.jobs_failed,
                "tick complete"
            );
        } else {
            debug!(checked = report.jobs_checked, "tick complete, nothing due");
        }

        Ok(report)
    }

    /// Claim, execute and release one due job.
    async fn process_due_job(
        &self,
        job: Job,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        if !self
            .storage
            .claim_job(&job.id, self.config.lease_duration)
            .await
        {
            debug!(id = %job.id, "job claimed elsewhere, skipping");
            return Ok(());
        }

        let result = self.execute_claimed(&job.id, report).await;

        if let Err(e) = self.storage.release_job(&job.id).await {
            warn!(id = %job.id, error = %e, "failed to release job claim");
        }

        result
    }

    /// Execute a job this worker holds the claim for.
    #[tracing::instrument(skip(self, report))]
    async fn execute_claimed(
        &self,
        id: &str,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        // The snapshot may predate another worker finishing this job
        let Some(mut job) = self.storage.load_job(id).await? else {
            debug!(id, "job disappeared after claim, skipping");
            return Ok(());
        };
        if !job.is_due_at(Utc::now()) {
            debug!(id, status = %job.status, "job no longer due after claim, skipping");
            return Ok(());
        }

        job.start(Utc::now())?;
        self.storage.save_job(&job).await?;
        report.jobs_executed += 1;

        info!(
            id,
            job_type = %job.job_type,
            attempt = job.attempts + 1,
            max_attempts = job.max_attempts,
            "executing job"
        );

        let outcome = match self.invoke_handler(&job).await {
            Ok(()) => ExecutionOutcome::Success,
            Err(error) => classify_failure(job.attempts, job.max_attempts, error),
        };
        let finished_at = Utc::now();
        let retry_delay = self.config.retry_delay_chrono();

        match &outcome {
            ExecutionOutcome::Success => {
                report.jobs_succeeded += 1;
                info!(id, "job completed");
            }
            ExecutionOutcome::RetryableFailure(error) => {
                report.jobs_failed += 1;
                warn!(
                    id,
                    attempts = job.attempts + 1,
                    next_retry = %(finished_at + retry_delay),
                    error = %error,
                    "job failed, scheduled retry"
                );
            }
            ExecutionOutcome::TerminalFailure(error) => {
                report.jobs_failed += 1;
                error!(
                    id,
                    attempts = job.attempts + 1,
                    error = %error,
                    "job failed permanently"
                );
            }
        }

        job.apply_outcome(outcome, finished_at, retry_delay)?;
        self.storage.save_job(&job).await?;
        Ok(())
    }

    /// Resolve and run the handler. Missing handlers and panics count as failures.
    async fn invoke_handler(&self, job: &Job) -> Result<(), String> {
        let Some(handler) = self.registry.get(&job.job_type) else {
            return Err(SchedulerError::HandlerNotFound(job.job_type.clone()).to_string());
        };

        match AssertUnwindSafe(handler.handle(job.clone()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(format!("handler panicked: {}", panic_message(&panic))),
        }
    }

    /// Calculate how long to sleep until the next pending job is due.
    ///
    /// Bounded below by one second and above by the poll interval.
    pub async fn calculate_sleep_duration(&self) -> Duration {
        let max_sleep = self.config.poll_interval;

        let jobs = match self.storage.load_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "failed to load jobs for sleep calculation");
                return max_sleep;
            }
        };

        let next_due = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.schedule_at)
            .min();

        match next_due {
            Some(next) => {
                let secs = (next - Utc::now()).num_seconds().max(MIN_SLEEP_SECS as i64) as u64;
                Duration::from_secs(secs).min(max_sleep)
            }
            None => max_sleep,
        }
    }

    /// Run ticks in a sleep loop until `shutdown_rx` reports `true`.
    ///
    /// Tick failures are logged and the loop continues.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(backend = self.storage.name(), "scheduler starting");

        if !self.storage.supports_locking() {
            warn!(
                backend = self.storage.name(),
                "storage backend has no claim locking, run only one scheduler against it"
            );
        }

        loop {
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            if let Err(e) = self.run_tick().await {
                error!(error = %e, "scheduler tick failed");
            }

            let sleep_duration = self.calculate_sleep_duration().await;

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        info!("shutdown channel closed");
                        break;
                    }
                }
                _ = sleep(sleep_duration) => {}
            }
        }

        info!("scheduler shut down gracefully");
    }

    /// Spawn the continuous loop on the current runtime.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        SchedulerHandle { shutdown_tx, task }
    }
}

/// Handle to a scheduler loop started with [`Scheduler::start`].
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait for the in-flight tick to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "scheduler task failed");
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
