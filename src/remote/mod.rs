//! Remote key-value backends.
//!
//! The stores are written against the [`RemoteTable`] trait: a single table with a
//! partition key, sort key, native expiry and conditional writes. [`RemoteBackend`]
//! wraps one table with [`ResilientTable`] and hands out the three stores sharing
//! that wrapper, so one circuit breaker guards every store.
//!
//! [`InMemoryTable`] implements the trait in process for tests and local runs. With the
//! `dynamodb` feature, `DynamoDbTable` talks to a provisioned DynamoDB table and
//! `RemoteBackend::connect` builds one from `region` / `endpoint`.
//!
//! ```rust
//! use comic_vine::remote::{InMemoryTable, RemoteBackend, RemoteConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main] async fn main() -> comic_vine::Result<()> {
//! let backend = RemoteBackend::new(Arc::new(InMemoryTable::new()), RemoteConfig::default())?;
//! let cache = backend.cache_store();
//! let dedupe = backend.dedupe_store();
//! # Ok(()) }
//! ```

mod cache;
mod dedupe;
#[cfg(feature = "dynamodb")]
mod dynamodb;
pub mod error_code;
pub mod keys;
mod memory_table;
mod request_log;
mod resilient;
pub mod table;

pub use cache::RemoteCacheStore;
pub use dedupe::RemoteDedupeStore;
#[cfg(feature = "dynamodb")]
pub use dynamodb::DynamoDbTable;
pub use memory_table::InMemoryTable;
pub use request_log::RemoteRequestLog;
pub use resilient::ResilientTable;
pub use table::{Condition, Item, ItemKey, Page, RemoteTable, ITEM_SIZE_LIMIT, MAX_BATCH_SIZE};

use crate::rate_limit::{RateLimiterConfig, WindowedRateLimiter};
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerSnapshot, RetryPolicy};
use crate::{Error, ErrorContext, Result};
use std::sync::Arc;
use std::time::Duration;
use table::{QueryRequest, ScanRequest};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub table_name: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    /// Secondary index keyed by `entityType` / `ttl` used for expiry sweeps.
    pub expiry_index: String,
    /// Total attempts per operation, including the first.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Keys per batch delete, at most [`MAX_BATCH_SIZE`].
    pub batch_size: usize,
    pub cleanup_interval: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-attempt timeout.
    pub operation_timeout: Duration,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    /// Native expiry applied to rate-limit records.
    pub record_retention: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            table_name: "comic-vine-cache".to_string(),
            region: None,
            endpoint: None,
            expiry_index: "expiry-index".to_string(),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            batch_size: MAX_BATCH_SIZE,
            cleanup_interval: Duration::from_secs(5 * 60),
            circuit_breaker: CircuitBreakerConfig::default(),
            operation_timeout: Duration::from_secs(5),
            job_timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_millis(250),
            max_wait: Duration::from_secs(30),
            record_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl RemoteConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `COMIC_VINE_TABLE`, `COMIC_VINE_REGION` (or `AWS_REGION`),
    /// `COMIC_VINE_ENDPOINT` and `COMIC_VINE_EXPIRY_INDEX`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(table) = std::env::var("COMIC_VINE_TABLE") {
            config.table_name = table;
        }
        config.region = std::env::var("COMIC_VINE_REGION")
            .or_else(|_| std::env::var("AWS_REGION"))
            .ok();
        config.endpoint = std::env::var("COMIC_VINE_ENDPOINT").ok();
        if let Ok(index) = std::env::var("COMIC_VINE_EXPIRY_INDEX") {
            config.expiry_index = index;
        }
        config
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_expiry_index(mut self, index: impl Into<String>) -> Self {
        self.expiry_index = index.into();
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
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

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::configuration_with_context(
                format!("batch size must be between 1 and {MAX_BATCH_SIZE}"),
                ErrorContext::new()
                    .with_field_path("remote.batch_size")
                    .with_details(self.batch_size.to_string()),
            ));
        }
        if self.table_name.is_empty() {
            return Err(Error::configuration_with_context(
                "table name must not be empty",
                ErrorContext::new().with_field_path("remote.table_name"),
            ));
        }
        if self.expiry_index.is_empty() {
            return Err(Error::configuration_with_context(
                "expiry index name must not be empty",
                ErrorContext::new().with_field_path("remote.expiry_index"),
            ));
        }
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base_delay).with_max_delay(self.retry_max_delay)
    }
}

pub type RemoteRateLimitStore = WindowedRateLimiter<RemoteRequestLog>;

/// One resilient table shared by the remote stores.
#[derive(Clone)]
pub struct RemoteBackend {
    table: Arc<ResilientTable<Arc<dyn RemoteTable>>>,
    config: RemoteConfig,
}

impl RemoteBackend {
    /// Wrap an externally supplied table. Closing the stores never closes `table`.
    pub fn new(table: Arc<dyn RemoteTable>, config: RemoteConfig) -> Result<Self> {
        config.validate()?;
        info!(
            table = %config.table_name,
            region = config.region.as_deref().unwrap_or("default"),
            endpoint = config.endpoint.as_deref().unwrap_or("default"),
            backend = table.name(),
            "remote store backend ready"
        );
        let table = Arc::new(ResilientTable::new(
            table,
            config.retry_policy(),
            config.circuit_breaker.clone(),
            config.operation_timeout,
        ));
        Ok(Self { table, config })
    }

    /// Connect to DynamoDB using the default credential chain.
    #[cfg(feature = "dynamodb")]
    pub async fn connect(config: RemoteConfig) -> Result<Self> {
        config.validate()?;
        let table = DynamoDbTable::connect(&config).await;
        Self::new(Arc::new(table), config)
    }

    pub fn table(&self) -> Arc<dyn RemoteTable> {
        self.table.clone()
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn breaker(&self) -> Option<CircuitBreakerSnapshot> {
        self.table.breaker()
    }

    pub fn cache_store(&self) -> RemoteCacheStore {
        RemoteCacheStore::new(self.table(), self.config.clone())
    }

    pub fn dedupe_store(&self) -> RemoteDedupeStore {
        RemoteDedupeStore::new(self.table(), self.config.clone())
    }

    pub fn rate_limit_store(&self, config: RateLimiterConfig) -> RemoteRateLimitStore {
        WindowedRateLimiter::new(
            RemoteRequestLog::new(self.table(), self.config.clone()),
            config,
        )
    }
}

pub(crate) async fn scan_all(table: &dyn RemoteTable, mut request: ScanRequest) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    loop {
        let page = table.scan(&request).await?;
        items.extend(page.items);
        match page.last_key {
            Some(key) => request.start_after = Some(key),
            None => return Ok(items),
        }
    }
}

pub(crate) async fn query_all(
    table: &dyn RemoteTable,
    mut request: QueryRequest,
) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    loop {
        let page = table.query(&request).await?;
        items.extend(page.items);
        match page.last_key {
            Some(key) => request.start_after = Some(key),
            None => return Ok(items),
        }
    }
}

const UNPROCESSED_ROUNDS: u32 = 3;

/// Delete `keys` in batches of `batch_size`, re-submitting unprocessed keys a few
/// times before giving up on them.
pub(crate) async fn delete_keys(
    table: &dyn RemoteTable,
    keys: Vec<ItemKey>,
    batch_size: usize,
) -> Result<u64> {
    let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
    let mut deleted = 0u64;
    for chunk in keys.chunks(batch_size) {
        let mut pending = chunk.to_vec();
        for round in 0..UNPROCESSED_ROUNDS {
            let submitted = pending.len();
            let unprocessed = table.batch_delete(&pending).await?;
            deleted += (submitted - unprocessed.len()) as u64;
            if unprocessed.is_empty() {
                break;
            }
            pending = unprocessed;
            if round + 1 == UNPROCESSED_ROUNDS {
                warn!(count = pending.len(), "giving up on unprocessed deletes");
            } else {
                tokio::time::sleep(Duration::from_millis(50 << round)).await;
            }
        }
    }
    Ok(deleted)
}

pub(crate) fn epoch_secs(ms: i64) -> i64 {
    ms.div_euclid(1000)
}
