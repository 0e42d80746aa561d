use super::keys::{self, attr};
use super::table::{Condition, Item, ItemKey, RemoteTable, ScanFilter, ScanRequest, ITEM_SIZE_LIMIT};
use super::{delete_keys, epoch_secs, scan_all, RemoteConfig};
use crate::stores::{
    duration_ms, lock, now_ms, DedupeStore, JobRegistration, JobStatus, WaitOutcome,
};
use crate::sweeper::Sweeper;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

const STORE: &str = "remote_dedupe";
const REGISTER_ATTEMPTS: u32 = 3;

struct Inner {
    table: Arc<dyn RemoteTable>,
    config: RemoteConfig,
}

impl Inner {
    fn timeout_ms(&self) -> i64 {
        duration_ms(self.config.job_timeout)
    }

    fn is_fresh_pending(&self, item: &Item, now: i64) -> bool {
        item.get_str(attr::STATUS) == Some(JobStatus::Pending.as_str())
            && item
                .get_i64(attr::CREATED_AT)
                .is_some_and(|created| now - created < self.timeout_ms())
    }

    /// Stale pending rows and resolved rows older than the job timeout.
    fn is_stale(&self, item: &Item, now: i64) -> bool {
        let pending = item.get_str(attr::STATUS) == Some(JobStatus::Pending.as_str());
        let stamp = if pending {
            item.get_i64(attr::CREATED_AT)
        } else {
            item.get_i64(attr::UPDATED_AT)
        };
        stamp.map_or(true, |at| now - at >= self.timeout_ms())
    }

    /// Native expiry: the first whole second at which a row stamped `now` is stale.
    fn expiry_secs(&self, now: i64) -> i64 {
        epoch_secs(now + self.timeout_ms()) + 1
    }

    /// Best-effort removal of a job row that never became current.
    async fn discard(&self, job_key: &ItemKey) {
        if let Err(e) = self.table.delete_item(job_key, None).await {
            debug!(pk = %job_key.pk, sk = %job_key.sk, error = %e, "failed to discard job row");
        }
    }

    async fn cleanup(&self) -> Result<u64> {
        let now = now_ms();
        let items = scan_all(
            self.table.as_ref(),
            ScanRequest::new(ScanFilter::ExpiredBefore {
                pk_prefix: keys::DEDUPE_PREFIX.to_string(),
                ttl_secs: epoch_secs(now) + 1,
            }),
        )
        .await?;
        let stale: Vec<ItemKey> = items
            .into_iter()
            .filter(|item| self.is_stale(item, now))
            .map(|item| item.key)
            .collect();
        delete_keys(self.table.as_ref(), stale, self.config.batch_size).await
    }
}

/// Dedupe jobs over conditional writes.
///
/// `DEDUPE#<hash>` / `LOCK` names the current job and is claimed with a conditional
/// put; each job's outcome lives in its own `JOB#<id>` row so waiters on an older
/// job are unaffected when the lock is re-registered.
pub struct RemoteDedupeStore {
    inner: Arc<Inner>,
    closed: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

impl RemoteDedupeStore {
    pub fn new(table: Arc<dyn RemoteTable>, config: RemoteConfig) -> Self {
        let interval = config.cleanup_interval;
        let inner = Arc::new(Inner { table, config });
        let weak = Arc::downgrade(&inner);
        let sweeper = Sweeper::spawn(STORE, interval, move || {
            let inner = weak.upgrade()?;
            Some(async move { inner.cleanup().await })
        });
        Self {
            inner,
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

    async fn resolve(&self, key: &str, status: JobStatus, payload: (&str, Value)) -> Result<()> {
        self.ensure_open()?;
        let table = &self.inner.table;
        let lock_key = keys::dedupe_lock(key);
        let Some(lock_item) = table.get_item(&lock_key).await? else {
            debug!(hash = key, "resolving unknown job");
            return Ok(());
        };
        let Some(job_id) = lock_item.get_str(attr::JOB_ID).map(str::to_string) else {
            return Ok(());
        };

        let now = now_ms();
        let created = lock_item.get_i64(attr::CREATED_AT).unwrap_or(now);
        let base = |status: JobStatus| {
            Item::new(keys::dedupe_job(key, &job_id))
                .with(attr::ENTITY, "dedupe")
                .with(attr::JOB_ID, job_id.as_str())
                .with(attr::STATUS, status.as_str())
                .with(attr::CREATED_AT, created)
                .with(attr::UPDATED_AT, now)
                .with_ttl(self.inner.expiry_secs(now))
        };
        let mut job = base(status).with(payload.0, payload.1);
        let mut status = status;
        if job.size() > ITEM_SIZE_LIMIT {
            warn!(hash = key, size = job.size(), "job result too large, marking failed");
            status = JobStatus::Failed;
            job = base(status).with(
                attr::ERROR,
                format!("result exceeds {ITEM_SIZE_LIMIT} byte item limit"),
            );
        }

        let still_pending = Condition::equals(attr::STATUS, JobStatus::Pending.as_str());
        match table.put_item(&job, Some(&still_pending)).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!(hash = key, job_id = %job_id, "job already resolved");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let released = lock_item
            .with(attr::STATUS, status.as_str())
            .with(attr::UPDATED_AT, now)
            .with_ttl(self.inner.expiry_secs(now));
        match table
            .put_item(&released, Some(&Condition::equals(attr::JOB_ID, job_id.as_str())))
            .await
        {
            Err(e) if !e.is_conflict() => Err(e),
            _ => Ok(()),
        }
    }

    fn outcome(key: &str, job: &Item) -> Result<Option<WaitOutcome>> {
        let status = job.get_str(attr::STATUS).unwrap_or_default().parse::<JobStatus>()?;
        Ok(match status {
            JobStatus::Pending => None,
            JobStatus::Failed => Some(WaitOutcome::Failed(
                job.get_str(attr::ERROR).unwrap_or_default().to_string(),
            )),
            JobStatus::Completed => {
                let raw = job.get_str(attr::RESULT).unwrap_or_default();
                Some(match serde_json::from_str(raw) {
                    Ok(value) => WaitOutcome::Completed(value),
                    Err(e) => {
                        warn!(hash = key, error = %e, "undecodable dedupe result");
                        WaitOutcome::Failed(format!("undecodable result: {e}"))
                    }
                })
            }
        })
    }
}

#[async_trait]
impl DedupeStore for RemoteDedupeStore {
    async fn register(&self, key: &str) -> Result<JobRegistration> {
        self.ensure_open()?;
        let table = &self.inner.table;
        let lock_key = keys::dedupe_lock(key);

        for attempt in 1..=REGISTER_ATTEMPTS {
            let now = now_ms();
            let job_id = uuid::Uuid::new_v4().to_string();
            let pending = |key: ItemKey| {
                Item::new(key)
                    .with(attr::ENTITY, "dedupe")
                    .with(attr::JOB_ID, job_id.as_str())
                    .with(attr::STATUS, JobStatus::Pending.as_str())
                    .with(attr::CREATED_AT, now)
                    .with(attr::UPDATED_AT, now)
                    .with_ttl(self.inner.expiry_secs(now))
            };
            // The job row exists before any lock can name it.
            let job_key = keys::dedupe_job(key, &job_id);
            table.put_item(&pending(job_key.clone()), None).await?;

            let claimable = Condition::Or(vec![
                Condition::NotExists,
                Condition::not_equals(attr::STATUS, JobStatus::Pending.as_str()),
                Condition::less_than(attr::CREATED_AT, now - self.inner.timeout_ms() + 1),
            ]);
            match table.put_item(&pending(lock_key.clone()), Some(&claimable)).await {
                Ok(()) => {
                    debug!(hash = key, job_id = %job_id, "registered job");
                    return Ok(JobRegistration {
                        job_id,
                        owner: true,
                    });
                }
                Err(e) if e.is_conflict() => {
                    self.inner.discard(&job_key).await;
                    if let Some(current) = table.get_item(&lock_key).await? {
                        if self.inner.is_fresh_pending(&current, now_ms()) {
                            if let Some(id) = current.get_str(attr::JOB_ID) {
                                return Ok(JobRegistration {
                                    job_id: id.to_string(),
                                    owner: false,
                                });
                            }
                        }
                    }
                    // The lock changed between our write and read; try again.
                    debug!(hash = key, attempt, "lock contention on register");
                }
                Err(e) => {
                    self.inner.discard(&job_key).await;
                    return Err(e);
                }
            }
        }

        Err(Error::runtime(format!(
            "could not register job for {key} after {REGISTER_ATTEMPTS} attempts"
        )))
    }

    async fn wait_outcome(&self, key: &str) -> Result<WaitOutcome> {
        self.ensure_open()?;
        let table = &self.inner.table;
        let lock_key = keys::dedupe_lock(key);
        let Some(lock_item) = table.get_item(&lock_key).await? else {
            return Ok(WaitOutcome::Missing);
        };
        let Some(job_id) = lock_item.get_str(attr::JOB_ID).map(str::to_string) else {
            return Ok(WaitOutcome::Missing);
        };
        let job_key = keys::dedupe_job(key, &job_id);
        let deadline = Instant::now() + self.inner.config.max_wait;
        let timed_out = || Error::DedupeTimeout {
            key: key.to_string(),
        };

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::StoreDestroyed { store: STORE });
            }
            match table.get_item(&job_key).await? {
                Some(job) => {
                    if let Some(outcome) = Self::outcome(key, &job)? {
                        return Ok(outcome);
                    }
                    if !self.inner.is_fresh_pending(&job, now_ms()) {
                        debug!(hash = key, job_id = %job_id, "job abandoned");
                        return Err(timed_out());
                    }
                }
                None => {
                    // Not visible yet, or reclaimed. Keep waiting only while the lock
                    // still names this job as live.
                    let current = table.get_item(&lock_key).await?;
                    let live = current.is_some_and(|lock| {
                        lock.get_str(attr::JOB_ID) == Some(job_id.as_str())
                            && self.inner.is_fresh_pending(&lock, now_ms())
                    });
                    if !live {
                        debug!(hash = key, job_id = %job_id, "job row gone");
                        return Err(timed_out());
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }
            tokio::time::sleep(self.inner.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn complete(&self, key: &str, value: &Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.resolve(key, JobStatus::Completed, (attr::RESULT, Value::String(raw)))
            .await
    }

    async fn fail(&self, key: &str, error: &str) -> Result<()> {
        self.resolve(key, JobStatus::Failed, (attr::ERROR, Value::from(error)))
            .await
    }

    async fn is_in_progress(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let current = self.inner.table.get_item(&keys::dedupe_lock(key)).await?;
        Ok(current.is_some_and(|item| self.inner.is_fresh_pending(&item, now_ms())))
    }

    async fn cleanup(&self) -> Result<u64> {
        self.ensure_open()?;
        self.inner.cleanup().await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            lock(&self.sweeper).take();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        STORE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::table::{Page, QueryRequest};
    use crate::remote::InMemoryTable;
    use serde_json::json;
    use std::time::Duration;

    /// Delays writes of pending job rows, as a lagging replica would.
    struct SlowJobRows {
        inner: Arc<InMemoryTable>,
        delay: Duration,
    }

    #[async_trait]
    impl RemoteTable for SlowJobRows {
        async fn get_item(&self, key: &ItemKey) -> Result<Option<Item>> {
            self.inner.get_item(key).await
        }

        async fn put_item(&self, item: &Item, condition: Option<&Condition>) -> Result<()> {
            let pending_job = item.key.sk.starts_with(keys::JOB_SK_PREFIX)
                && item.get_str(attr::STATUS) == Some(JobStatus::Pending.as_str());
            if pending_job {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.put_item(item, condition).await
        }

        async fn delete_item(&self, key: &ItemKey, condition: Option<&Condition>) -> Result<()> {
            self.inner.delete_item(key, condition).await
        }

        async fn query(&self, request: &QueryRequest) -> Result<Page> {
            self.inner.query(request).await
        }

        async fn scan(&self, request: &ScanRequest) -> Result<Page> {
            self.inner.scan(request).await
        }

        async fn batch_delete(&self, keys: &[ItemKey]) -> Result<Vec<ItemKey>> {
            self.inner.batch_delete(keys).await
        }

        fn name(&self) -> &'static str {
            "slow_job_rows"
        }
    }

    fn config() -> RemoteConfig {
        RemoteConfig::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_max_wait(Duration::from_millis(500))
    }

    fn store_with(config: RemoteConfig) -> (Arc<InMemoryTable>, Arc<RemoteDedupeStore>) {
        let table = Arc::new(InMemoryTable::new());
        let store = Arc::new(RemoteDedupeStore::new(table.clone(), config));
        (table, store)
    }

    #[tokio::test]
    async fn test_single_owner() {
        let (_, store) = store_with(config());
        let first = store.register("k").await.unwrap();
        let second = store.register("k").await.unwrap();
        assert!(first.owner);
        assert!(!second.owner);
        assert_eq!(first.job_id, second.job_id);
        assert!(store.is_in_progress("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_registration_has_one_owner() {
        let (_, store) = store_with(config());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.register("k").await.unwrap() })
            })
            .collect();
        let mut owners = 0;
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let reg = handle.await.unwrap();
            owners += reg.owner as usize;
            ids.insert(reg.job_id);
        }
        assert_eq!(owners, 1);
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let (_, store) = store_with(config());
        store.register("k").await.unwrap();
        store.complete("k", &json!("v1")).await.unwrap();
        store.complete("k", &json!("v2")).await.unwrap();
        store.fail("k", "late").await.unwrap();
        assert_eq!(store.wait_for("k").await.unwrap(), Some(json!("v1")));
        assert!(!store.is_in_progress("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_waiter_sees_completion() {
        let (_, store) = store_with(config());
        store.register("k").await.unwrap();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for("k").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.complete("k", &json!({"id": 1})).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Some(json!({"id": 1})));
    }

    #[tokio::test]
    async fn test_missing_and_failed() {
        let (_, store) = store_with(config());
        assert_eq!(store.wait_outcome("nope").await.unwrap(), WaitOutcome::Missing);
        store.register("k").await.unwrap();
        store.fail("k", "boom").await.unwrap();
        assert_eq!(
            store.wait_outcome("k").await.unwrap(),
            WaitOutcome::Failed("boom".into())
        );
        assert_eq!(store.wait_for("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reregister_after_resolution() {
        let (_, store) = store_with(config());
        let first = store.register("k").await.unwrap();
        store.complete("k", &json!(1)).await.unwrap();
        let second = store.register("k").await.unwrap();
        assert!(second.owner);
        assert_ne!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (_, store) = store_with(config().with_max_wait(Duration::from_millis(30)));
        store.register("k").await.unwrap();
        let err = store.wait_outcome("k").await.unwrap_err();
        assert!(matches!(err, Error::DedupeTimeout { .. }));
    }

    #[tokio::test]
    async fn test_abandoned_job_is_reclaimed() {
        let (table, store) = store_with(config().with_job_timeout(Duration::from_millis(20)));
        let first = store.register("k").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.is_in_progress("k").await.unwrap());
        let second = store.register("k").await.unwrap();
        assert!(second.owner);
        assert_ne!(first.job_id, second.job_id);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.cleanup().await.unwrap() >= 3);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_result_fails_job() {
        let (_, store) = store_with(config());
        store.register("k").await.unwrap();
        store
            .complete("k", &json!("x".repeat(ITEM_SIZE_LIMIT)))
            .await
            .unwrap();
        assert!(matches!(
            store.wait_outcome("k").await.unwrap(),
            WaitOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let (_, store) = store_with(config());
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.register("k").await,
            Err(Error::StoreDestroyed { .. })
        ));
    }

    #[tokio::test]
    async fn test_follower_waits_through_slow_job_write() {
        let table = Arc::new(InMemoryTable::new());
        let slow = Arc::new(SlowJobRows {
            inner: table.clone(),
            delay: Duration::from_millis(100),
        });
        let store = Arc::new(RemoteDedupeStore::new(slow, config()));

        let first = {
            let store = store.clone();
            tokio::spawn(async move { store.register("k").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let store = store.clone();
            tokio::spawn(async move { store.register("k").await })
        };
        // Wait as soon as the later caller has its registration.
        let second = second.await.unwrap().unwrap();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_outcome("k").await })
        };
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.owner as u8 + second.owner as u8, 1);
        assert_eq!(first.job_id, second.job_id);

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.complete("k", &json!("done")).await.unwrap();
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            WaitOutcome::Completed(json!("done"))
        );
        // The losing registration cleaned up its own job row.
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_waiter_polls_until_job_row_appears() {
        let (table, store) = store_with(config());
        let now = now_ms();
        table.insert_raw(
            Item::new(keys::dedupe_lock("k"))
                .with(attr::JOB_ID, "j1")
                .with(attr::STATUS, JobStatus::Pending.as_str())
                .with(attr::CREATED_AT, now),
        );
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_outcome("k").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        table.insert_raw(
            Item::new(keys::dedupe_job("k", "j1"))
                .with(attr::JOB_ID, "j1")
                .with(attr::STATUS, JobStatus::Completed.as_str())
                .with(attr::RESULT, "\"late\"")
                .with(attr::CREATED_AT, now)
                .with(attr::UPDATED_AT, now_ms()),
        );
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            WaitOutcome::Completed(json!("late"))
        );
    }

    #[tokio::test]
    async fn test_missing_job_row_under_stale_lock_times_out() {
        let (table, store) = store_with(config());
        table.insert_raw(
            Item::new(keys::dedupe_lock("k"))
                .with(attr::JOB_ID, "j1")
                .with(attr::STATUS, JobStatus::Pending.as_str())
                .with(attr::CREATED_AT, 0),
        );
        let started = std::time::Instant::now();
        let err = store.wait_outcome("k").await.unwrap_err();
        assert!(matches!(err, Error::DedupeTimeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_cleanup_leaves_live_jobs_alone() {
        let (table, store) = store_with(config().with_job_timeout(Duration::from_millis(20)));
        store.register("old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let live = RemoteDedupeStore::new(
            table.clone(),
            config().with_job_timeout(Duration::from_secs(60)),
        );
        live.register("new").await.unwrap();

        // The stale lock and job row go; the live pair stays.
        assert_eq!(store.cleanup().await.unwrap(), 2);
        assert_eq!(table.len(), 2);
        assert!(live.is_in_progress("new").await.unwrap());
    }
}
