//! Handlers available to every `vesper` process.

use std::time::Duration;

use tracing::info;
use vesper_scheduler::{Job, Scheduler, SchedulerError};

/// Longest pause the `sleep` handler accepts.
const MAX_SLEEP_SECS: f64 = 3600.0;

pub fn register_builtin(scheduler: &Scheduler) -> Result<(), SchedulerError> {
    scheduler.register_handler("log", |job: Job| async move { log_job(&job) })?;
    scheduler.register_handler("sleep", |job: Job| async move { sleep_job(&job).await })?;
    Ok(())
}

/// Log the payload and succeed.
fn log_job(job: &Job) -> Result<(), String> {
    let payload = serde_json::to_string(&job.payload).map_err(|e| e.to_string())?;
    info!(id = %job.id, attempts = job.attempts, %payload, "log job");
    Ok(())
}

/// Pause for `payload.seconds`, then succeed.
async fn sleep_job(job: &Job) -> Result<(), String> {
    let duration = sleep_duration(job)?;
    tokio::time::sleep(duration).await;
    info!(id = %job.id, seconds = duration.as_secs_f64(), "sleep job finished");
    Ok(())
}

fn sleep_duration(job: &Job) -> Result<Duration, String> {
    let seconds = match job.payload.get("seconds") {
        None => return Ok(Duration::ZERO),
        Some(value) => value
            .as_f64()
            .ok_or_else(|| format!("payload.seconds must be a number, got {value}"))?,
    };

    if !(0.0..=MAX_SLEEP_SECS).contains(&seconds) {
        return Err(format!(
            "payload.seconds must be between 0 and {MAX_SLEEP_SECS}, got {seconds}"
        ));
    }
    Ok(Duration::from_secs_f64(seconds))
}
