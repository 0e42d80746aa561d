use super::{SqliteConfig, SqliteConnection};
use crate::stores::{
    duration_ms, lock, now_ms, DedupeStore, JobRegistration, JobStatus, WaitOutcome,
};
use crate::sweeper::Sweeper;
use crate::{Error, Result};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const STORE: &str = "sqlite_dedupe";

struct JobRow {
    job_id: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    created_at: i64,
}

fn read_job(conn: &rusqlite::Connection, key: &str) -> rusqlite::Result<Option<JobRow>> {
    conn.query_row(
        "SELECT job_id, status, result, error, created_at FROM dedupe_jobs WHERE hash = ?1",
        params![key],
        |row| {
            Ok(JobRow {
                job_id: row.get(0)?,
                status: row.get(1)?,
                result: row.get(2)?,
                error: row.get(3)?,
                created_at: row.get(4)?,
            })
        },
    )
    .optional()
}

fn delete_stale(conn: &mut rusqlite::Connection, now: i64, timeout_ms: i64) -> Result<u64> {
    let cutoff = now - timeout_ms;
    let removed = conn.execute(
        "DELETE FROM dedupe_jobs
         WHERE (status = 'pending' AND created_at <= ?1)
            OR (status != 'pending' AND updated_at <= ?1)",
        params![cutoff],
    )?;
    Ok(removed as u64)
}

/// Job rows in the `dedupe_jobs` table; waiters poll the row.
pub struct SqliteDedupeStore {
    conn: SqliteConnection,
    owned: bool,
    config: SqliteConfig,
    closed: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SqliteDedupeStore {
    pub fn open(config: SqliteConfig) -> Result<Self> {
        let conn = SqliteConnection::open(&config)?;
        Ok(Self::build(conn, true, config))
    }

    pub fn with_connection(conn: SqliteConnection, config: SqliteConfig) -> Result<Self> {
        if conn.is_closed() {
            return Err(Error::StoreDestroyed { store: STORE });
        }
        Ok(Self::build(conn, false, config))
    }

    fn build(conn: SqliteConnection, owned: bool, config: SqliteConfig) -> Self {
        let sweep_conn = conn.clone();
        let timeout_ms = duration_ms(config.job_timeout);
        let sweeper = Sweeper::spawn(STORE, config.cleanup_interval, move || {
            if sweep_conn.is_closed() {
                return None;
            }
            let conn = sweep_conn.clone();
            Some(async move {
                conn.call(STORE, move |c| delete_stale(c, now_ms(), timeout_ms))
                    .await
            })
        });
        Self {
            conn,
            owned,
            config,
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(sweeper),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::StoreDestroyed { store: STORE })
        } else {
            Ok(())
        }
    }

    async fn resolve(
        &self,
        key: &str,
        status: JobStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<()> {
        self.ensure_open()?;
        let key = key.to_string();
        self.conn
            .call(STORE, move |conn| {
                conn.execute(
                    "UPDATE dedupe_jobs SET status = ?1, result = ?2, error = ?3, updated_at = ?4
                     WHERE hash = ?5 AND status = 'pending'",
                    params![status.as_str(), result, error, now_ms(), key],
                )?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl DedupeStore for SqliteDedupeStore {
    async fn register(&self, key: &str) -> Result<JobRegistration> {
        self.ensure_open()?;
        let key = key.to_string();
        let timeout_ms = duration_ms(self.config.job_timeout);
        self.conn
            .call(STORE, move |conn| {
                // IMMEDIATE takes the write lock up front so two processes cannot both
                // observe "no pending job" and insert.
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = now_ms();
                if let Some(row) = read_job(&tx, &key)? {
                    if row.status == JobStatus::Pending.as_str() && now - row.created_at < timeout_ms
                    {
                        tx.commit()?;
                        return Ok(JobRegistration {
                            job_id: row.job_id,
                            owner: false,
                        });
                    }
                }
                let job_id = uuid::Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO dedupe_jobs (hash, job_id, status, result, error, created_at, updated_at)
                     VALUES (?1, ?2, 'pending', NULL, NULL, ?3, ?3)
                     ON CONFLICT(hash) DO UPDATE SET
                         job_id = excluded.job_id,
                         status = 'pending',
                         result = NULL,
                         error = NULL,
                         created_at = excluded.created_at,
                         updated_at = excluded.updated_at",
                    params![key, job_id, now],
                )?;
                tx.commit()?;
                Ok(JobRegistration {
                    job_id,
                    owner: true,
                })
            })
            .await
    }

    async fn wait_outcome(&self, key: &str) -> Result<WaitOutcome> {
        self.ensure_open()?;
        let deadline = Instant::now() + self.config.max_wait;
        let timeout_ms = duration_ms(self.config.job_timeout);
        let mut seen = false;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::StoreDestroyed { store: STORE });
            }
            let lookup = key.to_string();
            let row = self
                .conn
                .call(STORE, move |conn| Ok(read_job(conn, &lookup)?))
                .await?;

            let timed_out = || Error::DedupeTimeout {
                key: key.to_string(),
            };
            match row {
                None if !seen => return Ok(WaitOutcome::Missing),
                // Reclaimed by cleanup while we waited.
                None => return Err(timed_out()),
                Some(row) => {
                    seen = true;
                    match row.status.parse::<JobStatus>() {
                        Ok(JobStatus::Completed) => {
                            let raw = row.result.unwrap_or_default();
                            return match serde_json::from_str(&raw) {
                                Ok(value) => Ok(WaitOutcome::Completed(value)),
                                Err(e) => {
                                    warn!(hash = %key, error = %e, "undecodable dedupe result");
                                    Ok(WaitOutcome::Failed(format!("undecodable result: {e}")))
                                }
                            };
                        }
                        Ok(JobStatus::Failed) => {
                            return Ok(WaitOutcome::Failed(row.error.unwrap_or_default()))
                        }
                        Ok(JobStatus::Pending) if now_ms() - row.created_at >= timeout_ms => {
                            debug!(hash = %key, job_id = %row.job_id, "job abandoned");
                            return Err(timed_out());
                        }
                        Ok(JobStatus::Pending) => {}
                        Err(e) => return Err(e),
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DedupeTimeout {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn complete(&self, key: &str, value: &Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.resolve(key, JobStatus::Completed, Some(raw), None).await
    }

    async fn fail(&self, key: &str, error: &str) -> Result<()> {
        self.resolve(key, JobStatus::Failed, None, Some(error.to_string()))
            .await
    }

    async fn is_in_progress(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let key = key.to_string();
        let cutoff = now_ms() - duration_ms(self.config.job_timeout);
        self.conn
            .call(STORE, move |conn| {
                let found = conn
                    .query_row(
                        "SELECT 1 FROM dedupe_jobs
                         WHERE hash = ?1 AND status = 'pending' AND created_at > ?2",
                        params![key, cutoff],
                        |_| Ok(()),
                    )
                    .optional()?;
                Ok(found.is_some())
            })
            .await
    }

    async fn cleanup(&self) -> Result<u64> {
        self.ensure_open()?;
        let timeout_ms = duration_ms(self.config.job_timeout);
        self.conn
            .call(STORE, move |conn| delete_stale(conn, now_ms(), timeout_ms))
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        lock(&self.sweeper).take();
        if self.owned {
            self.conn.close();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        STORE
    }
}
