use super::error_code::{RemoteError, RemoteErrorCode};
use super::table::{
    conditional_check_failed, Condition, Item, ItemKey, Page, QueryRequest, RemoteTable,
    ScanFilter, ScanRequest, SortKeyFilter, ITEM_SIZE_LIMIT, MAX_BATCH_SIZE,
};
use crate::stores::lock;
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-process [`RemoteTable`] with the same conditional-write, paging and size
/// semantics as the hosted table.
///
/// Faults and latency can be injected to exercise retry, timeout and breaker paths.
#[derive(Default)]
pub struct InMemoryTable {
    items: Mutex<BTreeMap<ItemKey, Item>>,
    faults: Mutex<VecDeque<RemoteErrorCode>>,
    latency: Mutex<Duration>,
    calls: AtomicU64,
}

impl InMemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls with `code`.
    pub fn inject_failures(&self, code: RemoteErrorCode, count: usize) {
        lock(&self.faults).extend(std::iter::repeat(code).take(count));
    }

    pub fn clear_failures(&self) {
        lock(&self.faults).clear();
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Calls received so far, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw access for tests that need to plant malformed items.
    pub fn insert_raw(&self, item: Item) {
        lock(&self.items).insert(item.key.clone(), item);
    }

    async fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match lock(&self.faults).pop_front() {
            Some(code) => Err(RemoteError::new(code, "injected failure").into()),
            None => Ok(()),
        }
    }
}

fn page<'a>(
    matches: impl Iterator<Item = &'a Item>,
    start_after: Option<&ItemKey>,
    limit: Option<usize>,
    ascending: bool,
) -> Page {
    // Continuation keys are exclusive and need not refer to a surviving item.
    let past_start = |key: &ItemKey| match start_after {
        None => true,
        Some(start) if ascending => key > start,
        Some(start) => key < start,
    };
    let mut items = Vec::new();
    let mut last_key = None;
    for item in matches.filter(|item| past_start(&item.key)) {
        if limit.is_some_and(|l| items.len() >= l) {
            last_key = items.last().map(|i: &Item| i.key.clone());
            break;
        }
        items.push(item.clone());
    }
    Page { items, last_key }
}

#[async_trait]
impl RemoteTable for InMemoryTable {
    async fn get_item(&self, key: &ItemKey) -> Result<Option<Item>> {
        self.enter().await?;
        Ok(lock(&self.items).get(key).cloned())
    }

    async fn put_item(&self, item: &Item, condition: Option<&Condition>) -> Result<()> {
        self.enter().await?;
        let size = item.size();
        if size > ITEM_SIZE_LIMIT {
            return Err(RemoteError::new(
                RemoteErrorCode::Validation,
                format!("item size {size} exceeds {ITEM_SIZE_LIMIT} bytes"),
            )
            .into());
        }
        let mut items = lock(&self.items);
        if let Some(condition) = condition {
            if !condition.evaluate(items.get(&item.key)) {
                return Err(conditional_check_failed(&item.key));
            }
        }
        items.insert(item.key.clone(), item.clone());
        Ok(())
    }

    async fn delete_item(&self, key: &ItemKey, condition: Option<&Condition>) -> Result<()> {
        self.enter().await?;
        let mut items = lock(&self.items);
        if let Some(condition) = condition {
            if !condition.evaluate(items.get(key)) {
                return Err(conditional_check_failed(key));
            }
        }
        items.remove(key);
        Ok(())
    }

    async fn query(&self, request: &QueryRequest) -> Result<Page> {
        self.enter().await?;
        let items = lock(&self.items);
        let start = ItemKey::new(request.pk.clone(), "");
        let in_partition = items
            .range(start..)
            .map(|(_, item)| item)
            .take_while(|item| item.key.pk == request.pk)
            .filter(|item| match &request.sk {
                SortKeyFilter::Any => true,
                SortKeyFilter::BeginsWith(prefix) => item.key.sk.starts_with(prefix.as_str()),
                SortKeyFilter::Between(low, high) => {
                    item.key.sk.as_str() >= low.as_str() && item.key.sk.as_str() <= high.as_str()
                }
            });
        let result = if request.ascending {
            page(in_partition, request.start_after.as_ref(), request.limit, true)
        } else {
            let reversed: Vec<&Item> = in_partition.collect();
            page(
                reversed.into_iter().rev(),
                request.start_after.as_ref(),
                request.limit,
                false,
            )
        };
        Ok(result)
    }

    async fn scan(&self, request: &ScanRequest) -> Result<Page> {
        self.enter().await?;
        let items = lock(&self.items);
        let matches = items.values().filter(|item| match &request.filter {
            ScanFilter::PartitionPrefix(prefix) => item.key.pk.starts_with(prefix.as_str()),
            ScanFilter::ExpiredBefore {
                pk_prefix,
                ttl_secs,
            } => {
                item.key.pk.starts_with(pk_prefix.as_str())
                    && item.ttl.is_some_and(|ttl| ttl <= *ttl_secs)
            }
        });
        Ok(page(matches, request.start_after.as_ref(), request.limit, true))
    }

    async fn batch_delete(&self, keys: &[ItemKey]) -> Result<Vec<ItemKey>> {
        self.enter().await?;
        if keys.len() > MAX_BATCH_SIZE {
            return Err(RemoteError::new(
                RemoteErrorCode::Validation,
                format!("batch of {} exceeds {MAX_BATCH_SIZE} keys", keys.len()),
            )
            .into());
        }
        let mut items = lock(&self.items);
        for key in keys {
            items.remove(key);
        }
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "in_memory_table"
    }
}
