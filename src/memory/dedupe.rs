use crate::stores::{
    duration_ms, lock, now_ms, DedupeStore, JobRegistration, JobStatus, WaitOutcome,
};
use crate::sweeper::Sweeper;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

const STORE: &str = "memory_dedupe";

#[derive(Debug, Clone)]
pub struct MemoryDedupeConfig {
    /// Pending jobs older than this are treated as abandoned.
    pub job_timeout: Duration,
    /// Upper bound on a single `wait_for`.
    pub max_wait: Duration,
    pub cleanup_interval: Duration,
}

impl Default for MemoryDedupeConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(5 * 60),
            max_wait: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl MemoryDedupeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
enum Signal {
    Pending,
    Completed(Value),
    Failed(String),
    /// Reclaimed while pending; waiters give up.
    Abandoned,
    Closed,
}

struct Job {
    job_id: String,
    status: JobStatus,
    created_at_ms: i64,
    updated_at_ms: i64,
    tx: watch::Sender<Signal>,
}

impl Job {
    fn expired(&self, now: i64, timeout_ms: i64) -> bool {
        self.status == JobStatus::Pending && now - self.created_at_ms >= timeout_ms
    }
}

fn sweep(jobs: &mut HashMap<String, Job>, now: i64, timeout_ms: i64) -> u64 {
    let before = jobs.len();
    jobs.retain(|_, job| {
        let stale = match job.status {
            JobStatus::Pending => now - job.created_at_ms >= timeout_ms,
            _ => now - job.updated_at_ms >= timeout_ms,
        };
        if stale && job.status == JobStatus::Pending {
            job.tx.send_replace(Signal::Abandoned);
        }
        !stale
    });
    (before - jobs.len()) as u64
}

/// In-process job registry. Waiters are woken by a `watch` channel, not polling.
pub struct MemoryDedupeStore {
    config: MemoryDedupeConfig,
    jobs: Arc<Mutex<HashMap<String, Job>>>,
    closed: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

impl MemoryDedupeStore {
    pub fn new(config: MemoryDedupeConfig) -> Self {
        let jobs = Arc::new(Mutex::new(HashMap::new()));
        let weak = Arc::downgrade(&jobs);
        let timeout_ms = duration_ms(config.job_timeout);
        let sweeper = Sweeper::spawn(STORE, config.cleanup_interval, move || {
            let jobs = weak.upgrade()?;
            Some(async move { Ok(sweep(&mut lock(&jobs), now_ms(), timeout_ms)) })
        });
        Self {
            config,
            jobs,
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

    fn resolve(&self, key: &str, status: JobStatus, signal: Signal) -> Result<()> {
        self.ensure_open()?;
        let mut jobs = lock(&self.jobs);
        if let Some(job) = jobs.get_mut(key) {
            if job.status == JobStatus::Pending {
                job.status = status;
                job.updated_at_ms = now_ms();
                job.tx.send_replace(signal);
            }
        }
        Ok(())
    }
}

impl Default for MemoryDedupeStore {
    fn default() -> Self {
        Self::new(MemoryDedupeConfig::default())
    }
}

#[async_trait]
impl DedupeStore for MemoryDedupeStore {
    async fn register(&self, key: &str) -> Result<JobRegistration> {
        self.ensure_open()?;
        let now = now_ms();
        let timeout_ms = duration_ms(self.config.job_timeout);
        let mut jobs = lock(&self.jobs);

        if let Some(job) = jobs.get(key) {
            if job.status == JobStatus::Pending && !job.expired(now, timeout_ms) {
                return Ok(JobRegistration {
                    job_id: job.job_id.clone(),
                    owner: false,
                });
            }
            if job.status == JobStatus::Pending {
                debug!(key, job_id = %job.job_id, "reclaiming abandoned job");
                job.tx.send_replace(Signal::Abandoned);
            }
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let (tx, _) = watch::channel(Signal::Pending);
        jobs.insert(
            key.to_string(),
            Job {
                job_id: job_id.clone(),
                status: JobStatus::Pending,
                created_at_ms: now,
                updated_at_ms: now,
                tx,
            },
        );
        Ok(JobRegistration {
            job_id,
            owner: true,
        })
    }

    async fn wait_outcome(&self, key: &str) -> Result<WaitOutcome> {
        self.ensure_open()?;
        let (mut rx, remaining) = {
            let jobs = lock(&self.jobs);
            let Some(job) = jobs.get(key) else {
                return Ok(WaitOutcome::Missing);
            };
            let age = Duration::from_millis((now_ms() - job.created_at_ms).max(0) as u64);
            let remaining = self.config.job_timeout.saturating_sub(age);
            (job.tx.subscribe(), remaining)
        };

        let limit = self.config.max_wait.min(remaining);
        let signal = match tokio::time::timeout(
            limit,
            rx.wait_for(|s| !matches!(s, Signal::Pending)),
        )
        .await
        {
            Ok(Ok(signal)) => signal.clone(),
            // Sender dropped: the job was removed without resolving.
            Ok(Err(_)) => Signal::Abandoned,
            Err(_) => Signal::Abandoned,
        };

        match signal {
            Signal::Completed(value) => Ok(WaitOutcome::Completed(value)),
            Signal::Failed(error) => Ok(WaitOutcome::Failed(error)),
            Signal::Closed => Err(Error::StoreDestroyed { store: STORE }),
            Signal::Pending | Signal::Abandoned => Err(Error::DedupeTimeout {
                key: key.to_string(),
            }),
        }
    }

    async fn complete(&self, key: &str, value: &Value) -> Result<()> {
        self.resolve(key, JobStatus::Completed, Signal::Completed(value.clone()))
    }

    async fn fail(&self, key: &str, error: &str) -> Result<()> {
        self.resolve(key, JobStatus::Failed, Signal::Failed(error.to_string()))
    }

    async fn is_in_progress(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let timeout_ms = duration_ms(self.config.job_timeout);
        Ok(lock(&self.jobs)
            .get(key)
            .map(|job| job.status == JobStatus::Pending && !job.expired(now_ms(), timeout_ms))
            .unwrap_or(false))
    }

    async fn cleanup(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(sweep(
            &mut lock(&self.jobs),
            now_ms(),
            duration_ms(self.config.job_timeout),
        ))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        lock(&self.sweeper).take();
        for (_, job) in lock(&self.jobs).drain() {
            if job.status == JobStatus::Pending {
                job.tx.send_replace(Signal::Closed);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        STORE
    }
}
