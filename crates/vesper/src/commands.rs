//! One-shot subcommands: tick, schedule, list, show.

use chrono::{DateTime, Duration, Utc};
use miette::Result;
use serde::Serialize;
use thiserror::Error;
use vesper_scheduler::{JobPayload, Scheduler, TickReport};

use crate::store::warn_if_unlocked;

/// Invalid command-line input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("invalid --at timestamp {0:?}: expected RFC 3339, e.g. 2026-01-01T09:00:00Z")]
    InvalidTimestamp(String),

    #[error("--in-secs is too large: {0}")]
    DelayOutOfRange(u64),

    #[error("invalid --payload: {0}")]
    InvalidPayload(String),
}

/// Machine-readable result of `vesper tick`.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutput {
    Ok(TickReport),
    Error { error: String },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| miette::miette!("failed to encode output: {}", e))?;
    println!("{json}");
    Ok(())
}

/// Run one tick and print its counters. Storage failures exit non-zero.
pub async fn tick(scheduler: &Scheduler) -> Result<()> {
    warn_if_unlocked(scheduler);

    match scheduler.run_tick().await {
        Ok(report) => print_json(&TickOutput::Ok(report)),
        Err(e) => {
            print_json(&TickOutput::Error {
                error: e.to_string(),
            })?;
            Err(miette::miette!("tick failed: {}", e))
        }
    }
}

pub async fn schedule(
    scheduler: &Scheduler,
    job_type: &str,
    at: Option<&str>,
    in_secs: Option<u64>,
    payload: Option<&str>,
) -> Result<()> {
    warn_if_unlocked(scheduler);

    let schedule_at =
        resolve_schedule_at(at, in_secs, Utc::now()).map_err(|e| miette::miette!("{}", e))?;
    let payload = parse_payload(payload).map_err(|e| miette::miette!("{}", e))?;

    let id = scheduler
        .schedule_job(job_type, schedule_at, payload)
        .await
        .map_err(|e| miette::miette!("failed to schedule job: {}", e))?;

    if !scheduler.registry().contains(job_type) {
        tracing::warn!(job_type, "no built-in handler for this job type");
    }

    println!("{id}");
    Ok(())
}

pub async fn list(scheduler: &Scheduler, pending: bool) -> Result<()> {
    let jobs = if pending {
        scheduler.get_pending_jobs().await
    } else {
        scheduler.list_jobs().await
    }
    .map_err(|e| miette::miette!("failed to load jobs: {}", e))?;

    print_json(&jobs)
}

pub async fn show(scheduler: &Scheduler, id: &str) -> Result<()> {
    let job = scheduler
        .get_job(id)
        .await
        .map_err(|e| miette::miette!("failed to load job: {}", e))?
        .ok_or_else(|| miette::miette!("job not found: {}", id))?;

    print_json(&job)
}

/// `--at` wins over `--in-secs`; with neither the job is due immediately.
pub fn resolve_schedule_at(
    at: Option<&str>,
    in_secs: Option<u64>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, InputError> {
    if let Some(at) = at {
        return DateTime::parse_from_rfc3339(at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| InputError::InvalidTimestamp(at.to_string()));
    }

    match in_secs {
        Some(secs) => i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or(InputError::DelayOutOfRange(secs)),
        None => Ok(now),
    }
}

/// Parse `--payload`, which must be a JSON object.
pub fn parse_payload(raw: Option<&str>) -> Result<JobPayload, InputError> {
    let Some(raw) = raw else {
        return Ok(JobPayload::new());
    };

    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(InputError::InvalidPayload(
            "expected a JSON object".to_string(),
        )),
        Err(e) => Err(InputError::InvalidPayload(e.to_string())),
    }
}
