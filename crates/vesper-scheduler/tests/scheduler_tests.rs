//! End-to-end scheduler behavior against the real storage backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::tempdir;

use vesper_scheduler::{
    FileJobStorage, Job, JobPayload, JobStatus, JobStorage, Scheduler, SchedulerConfig,
    SchedulerError, SqliteJobStorage, StorageError, TickReport,
};

fn past() -> chrono::DateTime<Utc> {
    Utc::now() - ChronoDuration::seconds(1)
}

fn succeed(scheduler: &Scheduler, job_type: &str) {
    scheduler
        .register_handler(job_type, |_job: Job| async { Ok(()) })
        .unwrap();
}

fn always_fail(scheduler: &Scheduler, job_type: &str) {
    scheduler
        .register_handler(job_type, |_job: Job| async {
            Err("smtp connection refused".to_string())
        })
        .unwrap();
}

#[tokio::test]
async fn past_job_completes_on_tick() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(FileJobStorage::new(dir.path().join("jobs.json")));
    let scheduler = Scheduler::new(storage);
    succeed(&scheduler, "email");

    let id = scheduler
        .schedule_job("email", past(), JobPayload::new())
        .await
        .unwrap();

    let report = scheduler.run_tick().await.unwrap();
    assert_eq!(
        report,
        TickReport {
            jobs_checked: 1,
            jobs_due: 1,
            jobs_executed: 1,
            jobs_succeeded: 1,
            jobs_failed: 0,
        }
    );

    let job = scheduler.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
    assert!(job.error.is_none());
}

#[tokio::test]
async fn future_job_is_not_executed() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(FileJobStorage::new(dir.path().join("jobs.json")));
    let scheduler = Scheduler::new(storage);
    succeed(&scheduler, "email");

    let id = scheduler
        .schedule_job("email", Utc::now() + ChronoDuration::hours(1), JobPayload::new())
        .await
        .unwrap();

    let report = scheduler.run_tick().await.unwrap();
    assert_eq!(report.jobs_checked, 1);
    assert_eq!(report.jobs_due, 0);
    assert_eq!(report.jobs_executed, 0);

    let job = scheduler.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn failing_job_exhausts_attempts() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(FileJobStorage::new(dir.path().join("jobs.json")));
    let config = SchedulerConfig::default().with_retry_delay(Duration::from_millis(1));
    let scheduler = Scheduler::with_config(storage, config).unwrap();
    always_fail(&scheduler, "email");

    let id = scheduler
        .schedule_job_with_attempts("email", past(), JobPayload::new(), 2)
        .await
        .unwrap();

    let first = scheduler.run_tick().await.unwrap();
    assert_eq!(first.jobs_failed, 1);
    let job = scheduler.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);

    // Let the backoff elapse
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = scheduler.run_tick().await.unwrap();
    assert_eq!(second.jobs_executed, 1);
    assert_eq!(second.jobs_failed, 1);

    let job = scheduler.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.error.as_deref(), Some("smtp connection refused"));

    // Terminal jobs are never picked up again
    tokio::time::sleep(Duration::from_millis(20)).await;
    let third = scheduler.run_tick().await.unwrap();
    assert_eq!(third.jobs_due, 0);
}

#[tokio::test]
async fn retry_is_rescheduled_five_minutes_out() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(FileJobStorage::new(dir.path().join("jobs.json")));
    let scheduler = Scheduler::new(storage);
    always_fail(&scheduler, "email");

    let id = scheduler
        .schedule_job("email", past(), JobPayload::new())
        .await
        .unwrap();

    let before = Utc::now();
    scheduler.run_tick().await.unwrap();
    let after = Utc::now();

    let job = scheduler.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.error.is_none());
    assert!(job.schedule_at >= before + ChronoDuration::minutes(5));
    assert!(job.schedule_at <= after + ChronoDuration::minutes(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_sqlite_claims_exclude_each_other() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let worker_a = SqliteJobStorage::open(&path, "jobs").unwrap();
    let worker_b = SqliteJobStorage::open(&path, "jobs").unwrap();

    let job = Job::new("email", past(), JobPayload::new(), 3);
    worker_a.save_job(&job).await.unwrap();

    let lease = Duration::from_secs(300);
    let (a, b) = tokio::join!(
        worker_a.claim_job(&job.id, lease),
        worker_b.claim_job(&job.id, lease)
    );
    assert!(a ^ b, "exactly one claim must win (a={a}, b={b})");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sqlite_workers_run_each_job_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let runs = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..2 {
        let storage = Arc::new(SqliteJobStorage::open(&path, "jobs").unwrap());
        let scheduler = Arc::new(Scheduler::new(storage));
        let counter = Arc::clone(&runs);
        scheduler
            .register_handler("count", move |_job: Job| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(())
                }
            })
            .unwrap();
        workers.push(scheduler);
    }

    for _ in 0..8 {
        workers[0]
            .schedule_job("count", past(), JobPayload::new())
            .await
            .unwrap();
    }

    let (a, b) = tokio::join!(workers[0].run_tick(), workers[1].run_tick());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(runs.load(Ordering::SeqCst), 8);
    assert_eq!(a.jobs_succeeded + b.jobs_succeeded, 8);

    let jobs = workers[1].list_jobs().await.unwrap();
    assert_eq!(jobs.len(), 8);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
    assert!(jobs.iter().all(|j| j.attempts == 0));
}

#[tokio::test]
async fn jobs_survive_scheduler_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.json");
    let at = Utc::now() + ChronoDuration::hours(1);

    {
        let scheduler = Scheduler::new(Arc::new(FileJobStorage::new(&path)));
        for kind in ["email", "report", "cleanup"] {
            scheduler
                .schedule_job(kind, at, JobPayload::new())
                .await
                .unwrap();
        }
    }

    let restarted = Scheduler::new(Arc::new(FileJobStorage::new(&path)));
    let pending = restarted.get_pending_jobs().await.unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|j| j.status == JobStatus::Pending));
}

#[tokio::test]
async fn sqlite_jobs_survive_scheduler_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let mut ids = Vec::new();

    {
        let storage = Arc::new(SqliteJobStorage::open(&path, "jobs").unwrap());
        let scheduler = Scheduler::new(storage);
        for offset in [30, 10, 20] {
            let at = Utc::now() + ChronoDuration::minutes(offset);
            ids.push(
                scheduler
                    .schedule_job("email", at, JobPayload::new())
                    .await
                    .unwrap(),
            );
        }
    }

    let storage = Arc::new(SqliteJobStorage::open(&path, "jobs").unwrap());
    let restarted = Scheduler::new(storage);
    let pending: Vec<String> = restarted
        .get_pending_jobs()
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();

    // Sorted by schedule time
    assert_eq!(pending, vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]);
}

#[tokio::test]
async fn idle_tick_does_not_touch_storage() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.json");
    let scheduler = Scheduler::new(Arc::new(FileJobStorage::new(&path)));
    scheduler
        .schedule_job("email", Utc::now() + ChronoDuration::hours(1), JobPayload::new())
        .await
        .unwrap();
    let before = std::fs::read(&path).unwrap();

    let report = scheduler.run_tick().await.unwrap();
    assert_eq!(
        report,
        TickReport {
            jobs_checked: 1,
            ..TickReport::default()
        }
    );
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn empty_store_ticks_cleanly() {
    let dir = tempdir().unwrap();
    let scheduler = Scheduler::new(Arc::new(FileJobStorage::new(dir.path().join("jobs.json"))));
    assert_eq!(scheduler.run_tick().await.unwrap(), TickReport::default());
    assert!(!dir.path().join("jobs.json").exists());
}

#[tokio::test]
async fn payload_reaches_handler() {
    let dir = tempdir().unwrap();
    let scheduler = Scheduler::new(Arc::new(FileJobStorage::new(dir.path().join("jobs.json"))));
    let seen = Arc::new(std::sync::Mutex::new(None));
    let slot = Arc::clone(&seen);
    scheduler
        .register_handler("email", move |job: Job| {
            let slot = Arc::clone(&slot);
            async move {
                *slot.lock().unwrap() = job.payload.get("to").cloned();
                Ok(())
            }
        })
        .unwrap();

    let mut payload = JobPayload::new();
    payload.insert("to".to_string(), json!("ops@example.com"));
    scheduler.schedule_job("email", past(), payload).await.unwrap();
    scheduler.run_tick().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), Some(json!("ops@example.com")));
}

fn read_records(path: &std::path::Path) -> Vec<Value> {
    let raw: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    raw.as_array().unwrap().clone()
}

#[tokio::test]
async fn malformed_record_does_not_block_due_jobs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.json");
    let due = Job::new("email", past(), JobPayload::new(), 3);
    let malformed = json!({
        "id": "bad-1",
        "job_type": "email",
        "schedule_at": "whenever",
        "created_at": "2026-01-01T00:00:00Z"
    });
    let document = json!([serde_json::to_value(&due).unwrap(), malformed.clone()]);
    std::fs::write(&path, document.to_string()).unwrap();

    let scheduler = Scheduler::new(Arc::new(FileJobStorage::new(&path)));
    succeed(&scheduler, "email");

    let report = scheduler.run_tick().await.unwrap();
    assert_eq!(report.jobs_checked, 1);
    assert_eq!(report.jobs_succeeded, 1);

    let job = scheduler.get_job(&due.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let records = read_records(&path);
    assert_eq!(records.len(), 2);
    assert!(records.contains(&malformed));
}

#[tokio::test]
async fn stored_jobs_without_attempts_left_are_never_run() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.json");
    let no_attempts = json!({
        "id": "j1",
        "job_type": "email",
        "schedule_at": "2026-01-01T00:00:00Z",
        "created_at": "2026-01-01T00:00:00Z",
        "max_attempts": 0
    });
    let over_limit = json!({
        "id": "j2",
        "job_type": "email",
        "schedule_at": "2026-01-01T00:00:00Z",
        "created_at": "2026-01-01T00:00:00Z",
        "attempts": 5,
        "max_attempts": 3
    });
    let document = json!([no_attempts.clone(), over_limit.clone()]);
    std::fs::write(&path, document.to_string()).unwrap();

    let scheduler = Scheduler::new(Arc::new(FileJobStorage::new(&path)));
    always_fail(&scheduler, "email");

    let report = scheduler.run_tick().await.unwrap();
    assert_eq!(report, TickReport::default());
    assert_eq!(read_records(&path), vec![no_attempts, over_limit]);
}

#[tokio::test]
async fn sqlite_jobs_without_attempts_left_are_never_run() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let storage = Arc::new(SqliteJobStorage::open(&path, "jobs").unwrap());
    let scheduler = Scheduler::new(Arc::clone(&storage) as Arc<dyn JobStorage>);
    always_fail(&scheduler, "email");

    // Write both records with valid counters, then corrupt them in place
    let mut over_limit = Job::new("email", past(), JobPayload::new(), 3);
    let mut no_attempts = Job::new("email", past(), JobPayload::new(), 1);
    storage
        .save_jobs(&[over_limit.clone(), no_attempts.clone()])
        .await
        .unwrap();
    over_limit.attempts = 5;
    no_attempts.max_attempts = 0;
    storage
        .save_jobs(&[over_limit.clone(), no_attempts.clone()])
        .await
        .unwrap();

    let report = scheduler.run_tick().await.unwrap();
    assert_eq!(report, TickReport::default());
    assert!(storage.load_jobs().await.unwrap().is_empty());
}

/// Wraps a file store and can be told to fail writes.
struct FlakyStorage {
    inner: FileJobStorage,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    releases: AtomicUsize,
}

impl FlakyStorage {
    fn new(inner: FileJobStorage) -> Self {
        Self {
            inner,
            fail_loads: AtomicBool::new(false),
            fail_saves: AtomicBool::new(false),
            releases: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobStorage for FlakyStorage {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn supports_locking(&self) -> bool {
        false
    }

    async fn load_jobs(&self) -> Result<Vec<Job>, StorageError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("store offline".to_string()));
        }
        self.inner.load_jobs().await
    }

    async fn save_jobs(&self, jobs: &[Job]) -> Result<(), StorageError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("store read-only".to_string()));
        }
        self.inner.save_jobs(jobs).await
    }

    async fn claim_job(&self, id: &str, lease_duration: Duration) -> bool {
        self.inner.claim_job(id, lease_duration).await
    }

    async fn release_job(&self, id: &str) -> Result<(), StorageError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release_job(id).await
    }
}

#[tokio::test]
async fn unavailable_storage_fails_the_tick() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(FlakyStorage::new(FileJobStorage::new(
        dir.path().join("jobs.json"),
    )));
    let scheduler = Scheduler::new(Arc::clone(&storage) as Arc<dyn JobStorage>);
    storage.fail_loads.store(true, Ordering::SeqCst);

    assert!(matches!(
        scheduler.run_tick().await,
        Err(SchedulerError::Storage(StorageError::Unavailable(_)))
    ));
}

#[tokio::test]
async fn claim_is_released_when_persisting_fails() {
    let dir = tempdir().unwrap();
    let storage = Arc::new(FlakyStorage::new(FileJobStorage::new(
        dir.path().join("jobs.json"),
    )));
    let scheduler = Scheduler::new(Arc::clone(&storage) as Arc<dyn JobStorage>);
    succeed(&scheduler, "email");
    let id = scheduler
        .schedule_job("email", past(), JobPayload::new())
        .await
        .unwrap();

    storage.fail_saves.store(true, Ordering::SeqCst);
    assert!(scheduler.run_tick().await.is_err());
    assert_eq!(storage.releases.load(Ordering::SeqCst), 1);

    // Nothing was written, so the job is still due
    storage.fail_saves.store(false, Ordering::SeqCst);
    let job = scheduler.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn start_and_stop_drive_the_loop() {
    let dir = tempdir().unwrap();
    let scheduler = Arc::new(Scheduler::new(Arc::new(FileJobStorage::new(
        dir.path().join("jobs.json"),
    ))));
    succeed(&scheduler, "email");
    let id = scheduler
        .schedule_job("email", past(), JobPayload::new())
        .await
        .unwrap();

    let handle = Arc::clone(&scheduler).start();

    let mut status = JobStatus::Pending;
    for _ in 0..100 {
        status = scheduler.get_job(&id).await.unwrap().unwrap().status;
        if status == JobStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop().await;

    assert_eq!(status, JobStatus::Completed);
}
