use super::keys::{self, attr};
use super::table::{Item, ItemKey, RemoteTable, ScanFilter, ScanRequest, ITEM_SIZE_LIMIT};
use super::{delete_keys, epoch_secs, scan_all, RemoteConfig};
use crate::stores::{duration_ms, lock, now_ms, CacheStats, CacheStore};
use crate::sweeper::Sweeper;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

const STORE: &str = "remote_cache";

struct Inner {
    table: Arc<dyn RemoteTable>,
    config: RemoteConfig,
}

impl Inner {
    async fn purge(&self, key: &ItemKey, why: &str) {
        if let Err(e) = self.table.delete_item(key, None).await {
            debug!(pk = %key.pk, error = %e, "failed to purge {} cache item", why);
        }
    }

    async fn cleanup(&self) -> Result<u64> {
        let now = now_ms();
        // Native ttl rounds up to the next second, so the index can only over-select.
        let items = scan_all(
            self.table.as_ref(),
            ScanRequest::new(ScanFilter::ExpiredBefore {
                pk_prefix: keys::CACHE_PREFIX.to_string(),
                ttl_secs: epoch_secs(now) + 1,
            }),
        )
        .await?;
        let keys = items
            .into_iter()
            .filter(|item| item.get_i64(attr::EXPIRES_AT).map_or(true, |t| t <= now))
            .map(|item| item.key)
            .collect();
        delete_keys(self.table.as_ref(), keys, self.config.batch_size).await
    }
}

/// Cache entries stored as `CACHE#<hash>` / `DATA` items.
///
/// Reads compare `expiresAt` (ms) themselves; the table's native `ttl` only bounds
/// how long expired items linger.
pub struct RemoteCacheStore {
    inner: Arc<Inner>,
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeper: Mutex<Option<Sweeper>>,
}

impl RemoteCacheStore {
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
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
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

    fn miss(&self) -> Result<Option<Value>> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }
}

#[async_trait]
impl CacheStore for RemoteCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_open()?;
        let item_key = keys::cache(key);
        let Some(item) = self.inner.table.get_item(&item_key).await? else {
            return self.miss();
        };

        let expires_at = item.get_i64(attr::EXPIRES_AT).unwrap_or(0);
        if expires_at <= now_ms() {
            self.inner.purge(&item_key, "expired").await;
            return self.miss();
        }
        let decoded = item
            .get_str(attr::VALUE)
            .map(serde_json::from_str::<Value>);
        match decoded {
            Some(Ok(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            _ => {
                warn!(hash = key, "purging undecodable cache item");
                self.inner.purge(&item_key, "undecodable").await;
                self.miss()
            }
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let now = now_ms();
        let expires_at = now.saturating_add(duration_ms(ttl));
        let item = Item::new(keys::cache(key))
            .with(attr::ENTITY, "cache")
            .with(attr::VALUE, serde_json::to_string(value)?)
            .with(attr::CREATED_AT, now)
            .with(attr::EXPIRES_AT, expires_at)
            .with_ttl(epoch_secs(expires_at) + 1);
        let size = item.size();
        if size > ITEM_SIZE_LIMIT {
            return Err(Error::ItemTooLarge {
                size,
                limit: ITEM_SIZE_LIMIT,
            });
        }
        self.inner.table.put_item(&item, None).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.table.delete_item(&keys::cache(key), None).await
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let items = scan_all(
            self.inner.table.as_ref(),
            ScanRequest::new(ScanFilter::PartitionPrefix(keys::CACHE_PREFIX.to_string())),
        )
        .await?;
        let keys = items.into_iter().map(|item| item.key).collect();
        let removed = delete_keys(self.inner.table.as_ref(), keys, self.inner.config.batch_size).await?;
        debug!(removed, "cleared remote cache");
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats> {
        self.ensure_open()?;
        let items = scan_all(
            self.inner.table.as_ref(),
            ScanRequest::new(ScanFilter::PartitionPrefix(keys::CACHE_PREFIX.to_string())),
        )
        .await?;
        let now = now_ms();
        let live: Vec<&Item> = items
            .iter()
            .filter(|item| item.get_i64(attr::EXPIRES_AT).is_some_and(|t| t > now))
            .collect();
        Ok(CacheStats {
            items: live.len() as u64,
            memory_bytes: live.iter().map(|item| item.size() as u64).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: 0,
        })
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
