use super::keys::{self, attr};
use super::table::{Item, ItemKey, QueryRequest, RemoteTable, ScanFilter, ScanRequest, SortKeyFilter};
use super::{delete_keys, epoch_secs, query_all, scan_all, RemoteConfig};
use crate::rate_limit::{CachedCapacity, RequestLog};
use crate::stores::{duration_ms, Priority};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

const STORE: &str = "remote_rate_limit";
const LAST_SEEN_PAGE: usize = 50;

/// One `RATELIMIT#<resource>` / `REQ#<ms>#<uuid>` item per request.
///
/// Records carry a native expiry of `record_retention`, so partitions stay bounded
/// even when no limiter runs cleanup. The adaptive split is persisted under
/// `ADAPTIVE#<resource>` / `META` and shared by every process on the table.
pub struct RemoteRequestLog {
    table: Arc<dyn RemoteTable>,
    config: RemoteConfig,
}

impl RemoteRequestLog {
    pub fn new(table: Arc<dyn RemoteTable>, config: RemoteConfig) -> Self {
        Self { table, config }
    }

    async fn records(&self, resource: &str, sk: SortKeyFilter) -> Result<Vec<Item>> {
        query_all(
            self.table.as_ref(),
            QueryRequest::partition(keys::rate_limit_partition(resource)).sort_key(sk),
        )
        .await
    }
}

fn priority_of(item: &Item) -> Option<Priority> {
    item.get_str(attr::PRIORITY).and_then(|p| p.parse().ok())
}

#[async_trait]
impl RequestLog for RemoteRequestLog {
    async fn append(&self, resource: &str, priority: Option<Priority>, at_ms: i64) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        let expires = at_ms + duration_ms(self.config.record_retention);
        let mut item = Item::new(ItemKey::new(
            keys::rate_limit_partition(resource),
            keys::request_sort_key(at_ms, &id),
        ))
        .with(attr::ENTITY, "ratelimit")
        .with(attr::RESOURCE, resource)
        .with(attr::TIMESTAMP, at_ms)
        .with_ttl(epoch_secs(expires) + 1);
        if let Some(priority) = priority {
            item = item.with(attr::PRIORITY, priority.as_str());
        }
        self.table.put_item(&item, None).await
    }

    async fn timestamps(
        &self,
        resource: &str,
        priority: Option<Priority>,
        since_ms: i64,
    ) -> Result<Vec<i64>> {
        let range = SortKeyFilter::Between(
            keys::request_sort_key_after(since_ms),
            keys::request_sort_key_upper(),
        );
        let items = self.records(resource, range).await?;
        Ok(items
            .iter()
            .filter(|item| priority.is_none() || priority_of(item) == priority)
            .filter_map(|item| item.get_i64(attr::TIMESTAMP))
            .collect())
    }

    async fn last_seen(&self, resource: &str, priority: Priority) -> Result<Option<i64>> {
        let mut request = QueryRequest::partition(keys::rate_limit_partition(resource))
            .sort_key(SortKeyFilter::BeginsWith(keys::REQUEST_SK_PREFIX.to_string()))
            .descending()
            .limit(LAST_SEEN_PAGE);
        loop {
            let page = self.table.query(&request).await?;
            let found = page
                .items
                .iter()
                .find(|item| priority_of(item) == Some(priority))
                .and_then(|item| item.get_i64(attr::TIMESTAMP));
            if found.is_some() {
                return Ok(found);
            }
            match page.last_key {
                Some(key) => request.start_after = Some(key),
                None => return Ok(None),
            }
        }
    }

    async fn clear(&self, resource: &str) -> Result<()> {
        let mut keys: Vec<ItemKey> = self
            .records(resource, SortKeyFilter::Any)
            .await?
            .into_iter()
            .map(|item| item.key)
            .collect();
        keys.push(keys::adaptive_meta(resource));
        delete_keys(self.table.as_ref(), keys, self.config.batch_size).await?;
        Ok(())
    }

    async fn prune_resource(&self, resource: &str, before_ms: i64) -> Result<u64> {
        let range = SortKeyFilter::Between(
            keys::REQUEST_SK_PREFIX.to_string(),
            keys::request_sort_key_after(before_ms),
        );
        let keys = self
            .records(resource, range)
            .await?
            .into_iter()
            .map(|item| item.key)
            .collect();
        delete_keys(self.table.as_ref(), keys, self.config.batch_size).await
    }

    async fn prune(&self, before_ms: i64) -> Result<u64> {
        // Every record at or before `before_ms` expires no later than this.
        let horizon = before_ms + duration_ms(self.config.record_retention);
        let items = scan_all(
            self.table.as_ref(),
            ScanRequest::new(ScanFilter::ExpiredBefore {
                pk_prefix: keys::RATE_LIMIT_PREFIX.to_string(),
                ttl_secs: epoch_secs(horizon) + 1,
            }),
        )
        .await?;
        let keys = items
            .into_iter()
            .filter(|item| item.get_i64(attr::TIMESTAMP).is_some_and(|t| t <= before_ms))
            .map(|item| item.key)
            .collect();
        delete_keys(self.table.as_ref(), keys, self.config.batch_size).await
    }

    async fn load_capacity(&self, resource: &str) -> Result<Option<CachedCapacity>> {
        let Some(item) = self.table.get_item(&keys::adaptive_meta(resource)).await? else {
            return Ok(None);
        };
        match item.get_str(attr::CAPACITY).map(serde_json::from_str) {
            Some(Ok(cached)) => Ok(Some(cached)),
            Some(Err(e)) => {
                warn!(resource, error = %e, "ignoring undecodable adaptive capacity");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn store_capacity(&self, resource: &str, capacity: &CachedCapacity) -> Result<()> {
        let expires = capacity.calculated_at_ms + duration_ms(self.config.record_retention);
        let item = Item::new(keys::adaptive_meta(resource))
            .with(attr::ENTITY, "adaptive")
            .with(attr::RESOURCE, resource)
            .with(attr::CAPACITY, serde_json::to_string(capacity)?)
            .with(attr::UPDATED_AT, capacity.calculated_at_ms)
            .with_ttl(epoch_secs(expires) + 1);
        self.table.put_item(&item, None).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        STORE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{DynamicCapacity, RateLimiterConfig, WindowedRateLimiter};
    use crate::remote::InMemoryTable;
    use crate::stores::{RateLimitStore, ResourceLimit};
    use std::time::Duration;

    fn log() -> (Arc<InMemoryTable>, RemoteRequestLog) {
        let table = Arc::new(InMemoryTable::new());
        (table.clone(), RemoteRequestLog::new(table, RemoteConfig::default()))
    }

    #[tokio::test]
    async fn test_timestamps_by_priority() {
        let (_, log) = log();
        log.append("issues", Some(Priority::User), 100).await.unwrap();
        log.append("issues", Some(Priority::Background), 200).await.unwrap();
        log.append("issues", None, 300).await.unwrap();
        log.append("volumes", None, 150).await.unwrap();

        assert_eq!(log.timestamps("issues", None, 0).await.unwrap(), vec![100, 200, 300]);
        assert_eq!(log.timestamps("issues", None, 200).await.unwrap(), vec![300]);
        assert_eq!(
            log.timestamps("issues", Some(Priority::Background), 0).await.unwrap(),
            vec![200]
        );
        assert_eq!(log.last_seen("issues", Priority::User).await.unwrap(), Some(100));
        assert_eq!(log.last_seen("volumes", Priority::User).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_seen_pages_past_other_priorities() {
        let (_, log) = log();
        log.append("issues", Some(Priority::User), 1).await.unwrap();
        for ts in 2..130 {
            log.append("issues", Some(Priority::Background), ts).await.unwrap();
        }
        assert_eq!(log.last_seen("issues", Priority::User).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_prune() {
        let (table, log) = log();
        for ts in [100, 200, 300] {
            log.append("issues", None, ts).await.unwrap();
        }
        log.append("volumes", None, 100).await.unwrap();
        assert_eq!(log.prune_resource("issues", 200).await.unwrap(), 2);
        assert_eq!(log.prune(100).await.unwrap(), 1);
        assert_eq!(table.len(), 1);
        log.clear("issues").await.unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_prune_selects_through_the_expiry_index() {
        let (table, log) = log();
        log.append("issues", None, 1_000).await.unwrap();
        log.append("issues", None, 10_000_000).await.unwrap();
        // A record written without native expiry is not in the index.
        table.insert_raw(
            Item::new(ItemKey::new("RATELIMIT#issues", keys::request_sort_key(500, "raw")))
                .with(attr::TIMESTAMP, 500),
        );

        assert_eq!(log.prune(5_000).await.unwrap(), 1);
        assert_eq!(table.len(), 2);
        assert_eq!(
            log.timestamps("issues", None, 0).await.unwrap(),
            vec![500, 10_000_000]
        );
    }

    #[tokio::test]
    async fn test_capacity_round_trip() {
        let (_, log) = log();
        assert_eq!(log.load_capacity("issues").await.unwrap(), None);
        let cached = CachedCapacity {
            capacity: DynamicCapacity {
                user_reserved: 60,
                background_max: 140,
                background_paused: false,
                reason: "moderate user activity".into(),
            },
            total_limit: 200,
            calculated_at_ms: 1_000,
            last_user_request_ms: Some(900),
        };
        log.store_capacity("issues", &cached).await.unwrap();
        assert_eq!(log.load_capacity("issues").await.unwrap(), Some(cached));
    }

    #[tokio::test]
    async fn test_limits_are_shared_through_the_table() {
        let table = Arc::new(InMemoryTable::new());
        let limiter = || {
            WindowedRateLimiter::new(
                RemoteRequestLog::new(table.clone(), RemoteConfig::default()),
                RateLimiterConfig::new()
                    .with_default_limit(ResourceLimit::new(2, Duration::from_secs(60))),
            )
        };
        let a = limiter();
        let b = limiter();
        a.record("issues").await.unwrap();
        b.record("issues").await.unwrap();
        assert!(!a.can_proceed("issues").await.unwrap());
        assert_eq!(b.status("issues").await.unwrap().remaining, 0);
    }
}
