//! Scheduler types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SchedulerError;

/// Default number of executions a job gets before it is marked failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Opaque key-value payload handed to a job's handler verbatim.
pub type JobPayload = serde_json::Map<String, serde_json::Value>;

/// A deferred unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique identifier (UUID v4).
    pub id: String,
    /// Name of the handler that executes this job.
    pub job_type: String,
    /// When this job becomes eligible for execution (or retry).
    pub schedule_at: DateTime<Utc>,
    /// Handler input.
    #[serde(default)]
    pub payload: JobPayload,
    /// Current lifecycle state.
    #[serde(default)]
    pub status: JobStatus,
    /// Number of failed executions so far.
    #[serde(default)]
    pub attempts: u32,
    /// Failed executions allowed before the job is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// When this job was created.
    pub created_at: DateTime<Utc>,
    /// When the most recent execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error from the final failed execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Claim expiry. Only the transactional backend sets this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
    /// When the current claim was taken. Only the transactional backend sets this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_claimed_at: Option<DateTime<Utc>>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `schedule_at`.
    #[default]
    Pending,
    /// Claimed and currently executing.
    Running,
    /// Handler succeeded.
    Completed,
    /// Handler failed `max_attempts` times.
    Failed,
}

impl JobStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Pending)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    /// Completed and failed jobs never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Result of one execution, decided independently of the handler's error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Handler returned `Ok`.
    Success,
    /// Handler failed and the job has attempts left.
    RetryableFailure(String),
    /// Handler failed and the job is out of attempts.
    TerminalFailure(String),
}

/// Classify a failed execution of a job that has already failed `attempts` times.
pub fn classify_failure(attempts: u32, max_attempts: u32, error: String) -> ExecutionOutcome {
    if attempts.saturating_add(1) >= max_attempts {
        ExecutionOutcome::TerminalFailure(error)
    } else {
        ExecutionOutcome::RetryableFailure(error)
    }
}

/// Aggregate counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Jobs loaded from storage.
    pub jobs_checked: usize,
    /// Jobs pending with `schedule_at <= now`.
    pub jobs_due: usize,
    /// Jobs claimed and handed to a handler (or found to have none).
    pub jobs_executed: usize,
    /// Executions that completed the job.
    pub jobs_succeeded: usize,
    /// Executions that failed, whether retried or terminal.
    pub jobs_failed: usize,
}

impl Job {
    /// Create a new pending job with a fresh identifier.
    pub fn new(
        job_type: impl Into<String>,
        schedule_at: DateTime<Utc>,
        payload: JobPayload,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            schedule_at,
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            lease_until: None,
            lease_claimed_at: None,
        }
    }

    /// Check if this job is due to run at `now`.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.schedule_at <= now
    }

    /// Check if this job is due to run.
    pub fn is_due(&self) -> bool {
        self.is_due_at(Utc::now())
    }

    /// Check the attempt counters of a job read back from storage.
    ///
    /// A job must allow at least one attempt, and a job that can still run
    /// must have attempts left. Executing anything else would push `attempts`
    /// past `max_attempts`.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.attempts > self.max_attempts
            || (!self.status.is_terminal() && self.attempts >= self.max_attempts)
        {
            return Err(format!(
                "{} job has used {} of {} attempts",
                self.status, self.attempts, self.max_attempts
            ));
        }
        Ok(())
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition_to(&mut self, next: JobStatus) -> Result<(), SchedulerError> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark a claimed job as running.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.transition_to(JobStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Record the outcome of an execution that started with [`Job::start`].
    pub fn apply_outcome(
        &mut self,
        outcome: ExecutionOutcome,
        now: DateTime<Utc>,
        retry_delay: Duration,
    ) -> Result<(), SchedulerError> {
        match outcome {
            ExecutionOutcome::Success => {
                self.transition_to(JobStatus::Completed)?;
                self.completed_at = Some(now);
                self.error = None;
            }
            ExecutionOutcome::RetryableFailure(_) => {
                self.transition_to(JobStatus::Pending)?;
                self.attempts = self.attempts.saturating_add(1);
                self.schedule_at = now + retry_delay;
                self.error = None;
            }
            ExecutionOutcome::TerminalFailure(error) => {
                self.transition_to(JobStatus::Failed)?;
                self.attempts = self.attempts.saturating_add(1);
                self.error = Some(error);
            }
        }
        Ok(())
    }
}
