//! Transactional SQLite job store with lease-based claims.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info, warn};

use super::JobStorage;
use crate::config::to_chrono;
use crate::{Job, JobStatus, StorageError};

/// How long a connection waits on a competing writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, job_type, schedule_at, payload, status, attempts, max_attempts,
     created_at, started_at, completed_at, error, lease_until, lease_claimed_at";

/// Stores one row per job in a named collection (table).
///
/// Claims run inside an `IMMEDIATE` transaction, so the lease check and the
/// lease write are atomic across every process sharing the database file.
/// Lease columns are owned by this backend: [`save_jobs`](JobStorage::save_jobs)
/// never writes them.
pub struct SqliteJobStorage {
    conn: Arc<Mutex<Connection>>,
    collection: String,
}

/// Result of a claim attempt inside the transaction.
enum ClaimResult {
    Claimed,
    Held(DateTime<Utc>),
    Missing,
}

impl SqliteJobStorage {
    /// Open or create the database at `path` and ensure `collection` exists.
    pub fn open(path: impl AsRef<Path>, collection: &str) -> Result<Self, StorageError> {
        validate_collection(collection)?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let storage = Self::init(conn, collection)?;
        info!(path = %path.display(), collection, "job database initialized");
        Ok(storage)
    }

    /// Open a private in-memory database. Leases only exclude users of this instance.
    pub fn open_in_memory(collection: &str) -> Result<Self, StorageError> {
        validate_collection(collection)?;
        Self::init(Connection::open_in_memory()?, collection)
    }

    fn init(conn: Connection, collection: &str) -> Result<Self, StorageError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // Enable WAL mode for concurrent readers alongside the claiming writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{collection}" (
                id               TEXT    NOT NULL PRIMARY KEY,
                job_type         TEXT    NOT NULL,
                schedule_at      TEXT    NOT NULL,
                payload          TEXT    NOT NULL DEFAULT '{{}}',
                status           TEXT    NOT NULL DEFAULT 'pending',
                attempts         INTEGER NOT NULL DEFAULT 0,
                max_attempts     INTEGER NOT NULL DEFAULT 3,
                created_at       TEXT    NOT NULL,
                started_at       TEXT,
                completed_at     TEXT,
                error            TEXT,
                lease_until      TEXT,
                lease_claimed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS "idx_{collection}_due" ON "{collection}" (status, schedule_at);
            "#
        ))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            collection: collection.to_string(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let collection = self.collection.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StorageError::Unavailable("connection lock poisoned".to_string()))?;
            f(&mut conn, &collection)
        })
        .await?
    }
}

/// Collection names are interpolated into SQL, so only plain identifiers are allowed.
fn validate_collection(name: &str) -> Result<(), StorageError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StorageError::InvalidCollection(name.to_string()));
    }
    Ok(())
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(field: &str, value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("{field}: {e} ({value:?})"))
}

fn parse_opt_ts(field: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>, String> {
    value.map(|v| parse_ts(field, &v)).transpose()
}

/// A row as stored, before timestamps and enums are decoded.
struct RawJobRow {
    id: String,
    job_type: String,
    schedule_at: String,
    payload: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error: Option<String>,
    lease_until: Option<String>,
    lease_claimed_at: Option<String>,
}

impl RawJobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_type: row.get(1)?,
            schedule_at: row.get(2)?,
            payload: row.get(3)?,
            status: row.get(4)?,
            attempts: row.get(5)?,
            max_attempts: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            error: row.get(10)?,
            lease_until: row.get(11)?,
            lease_claimed_at: row.get(12)?,
        })
    }

    fn decode(self) -> Result<Job, String> {
        let job = Job {
            schedule_at: parse_ts("schedule_at", &self.schedule_at)?,
            payload: serde_json::from_str(&self.payload).map_err(|e| format!("payload: {e}"))?,
            status: self.status.parse::<JobStatus>()?,
            attempts: u32::try_from(self.attempts).map_err(|e| format!("attempts: {e}"))?,
            max_attempts: u32::try_from(self.max_attempts)
                .map_err(|e| format!("max_attempts: {e}"))?,
            created_at: parse_ts("created_at", &self.created_at)?,
            started_at: parse_opt_ts("started_at", self.started_at)?,
            completed_at: parse_opt_ts("completed_at", self.completed_at)?,
            error: self.error,
            lease_until: parse_opt_ts("lease_until", self.lease_until)?,
            lease_claimed_at: parse_opt_ts("lease_claimed_at", self.lease_claimed_at)?,
            id: self.id,
            job_type: self.job_type,
        };
        job.validate()?;
        Ok(job)
    }
}

/// Decode a row, logging and dropping it if any field is malformed.
fn decode_or_skip(collection: &str, raw: RawJobRow) -> Option<Job> {
    let id = raw.id.clone();
    match raw.decode() {
        Ok(job) => Some(job),
        Err(e) => {
            warn!(collection, id = %id, error = %e, "skipping malformed job record");
            None
        }
    }
}

fn upsert(conn: &Connection, collection: &str, job: &Job) -> Result<(), StorageError> {
    let payload = serde_json::to_string(&job.payload)?;
    conn.prepare_cached(&format!(
        r#"INSERT INTO "{collection}"
             (id, job_type, schedule_at, payload, status, attempts, max_attempts,
              created_at, started_at, completed_at, error)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
           ON CONFLICT(id) DO UPDATE SET
              job_type     = excluded.job_type,
              schedule_at  = excluded.schedule_at,
              payload      = excluded.payload,
              status       = excluded.status,
              attempts     = excluded.attempts,
              max_attempts = excluded.max_attempts,
              created_at   = excluded.created_at,
              started_at   = excluded.started_at,
              completed_at = excluded.completed_at,
              error        = excluded.error"#
    ))?
    .execute(params![
        job.id,
        job.job_type,
        format_ts(job.schedule_at),
        payload,
        job.status.as_str(),
        job.attempts,
        job.max_attempts,
        format_ts(job.created_at),
        job.started_at.map(format_ts),
        job.completed_at.map(format_ts),
        job.error,
    ])?;
    Ok(())
}

#[async_trait]
impl JobStorage for SqliteJobStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn supports_locking(&self) -> bool {
        true
    }

    async fn load_jobs(&self) -> Result<Vec<Job>, StorageError> {
        self.with_conn(|conn, collection| {
            let mut stmt =
                conn.prepare_cached(&format!(r#"SELECT {JOB_COLUMNS} FROM "{collection}""#))?;
            let rows = stmt
                .query_map([], RawJobRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows
                .into_iter()
                .filter_map(|raw| decode_or_skip(collection, raw))
                .collect())
        })
        .await
    }

    async fn save_jobs(&self, jobs: &[Job]) -> Result<(), StorageError> {
        let jobs = jobs.to_vec();
        self.with_conn(move |conn, collection| {
            let tx = conn.transaction()?;
            for job in &jobs {
                upsert(&tx, collection, job)?;
            }
            tx.commit()?;
            debug!(collection, count = jobs.len(), "saved jobs");
            Ok(())
        })
        .await
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>, StorageError> {
        let id = id.to_string();
        self.with_conn(move |conn, collection| {
            let raw = conn
                .prepare_cached(&format!(
                    r#"SELECT {JOB_COLUMNS} FROM "{collection}" WHERE id = ?1"#
                ))?
                .query_row(params![id], RawJobRow::from_row)
                .optional()?;
            Ok(raw.and_then(|raw| decode_or_skip(collection, raw)))
        })
        .await
    }

    async fn save_job(&self, job: &Job) -> Result<(), StorageError> {
        let job = job.clone();
        self.with_conn(move |conn, collection| upsert(conn, collection, &job))
            .await
    }

    #[tracing::instrument(skip(self, lease_duration), fields(collection = %self.collection))]
    async fn claim_job(&self, id: &str, lease_duration: Duration) -> bool {
        let job_id = id.to_string();
        let lease = to_chrono(lease_duration);

        let result = self
            .with_conn(move |conn, collection| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = Utc::now();

                let current: Option<Option<String>> = tx
                    .query_row(
                        &format!(r#"SELECT lease_until FROM "{collection}" WHERE id = ?1"#),
                        params![job_id],
                        |row| row.get(0),
                    )
                    .optional()?;

                let Some(lease_until) = current else {
                    return Ok(ClaimResult::Missing);
                };

                if let Some(raw) = lease_until {
                    match parse_ts("lease_until", &raw) {
                        Ok(until) if until > now => return Ok(ClaimResult::Held(until)),
                        Ok(_) => {}
                        Err(e) => warn!(id = %job_id, error = %e, "overwriting unreadable lease"),
                    }
                }

                tx.execute(
                    &format!(
                        r#"UPDATE "{collection}" SET lease_until = ?1, lease_claimed_at = ?2
                           WHERE id = ?3"#
                    ),
                    params![format_ts(now + lease), format_ts(now), job_id],
                )?;
                tx.commit()?;
                Ok(ClaimResult::Claimed)
            })
            .await;

        match result {
            Ok(ClaimResult::Claimed) => {
                debug!(id, "claimed job");
                true
            }
            Ok(ClaimResult::Held(until)) => {
                debug!(id, lease_until = %until, "job is leased by another worker");
                false
            }
            Ok(ClaimResult::Missing) => {
                debug!(id, "cannot claim unknown job");
                false
            }
            Err(e) => {
                warn!(id, error = %e, "claim failed, treating job as not claimed");
                false
            }
        }
    }

    async fn release_job(&self, id: &str) -> Result<(), StorageError> {
        let id = id.to_string();
        self.with_conn(move |conn, collection| {
            conn.execute(
                &format!(
                    r#"UPDATE "{collection}" SET lease_until = NULL, lease_claimed_at = NULL
                       WHERE id = ?1"#
                ),
                params![id],
            )?;
            Ok(())
        })
        .await
    }
}
