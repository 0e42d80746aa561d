//! The key-value table seam the remote stores are written against.
//!
//! The model is a single table with a string partition key (`pk`), a string sort key
//! (`sk`), an optional native expiry attribute (`ttl`, epoch seconds) and free-form
//! JSON attributes. Writes may carry a [`Condition`]; a false condition fails with
//! [`RemoteErrorCode::ConditionalCheckFailed`].

use crate::remote::error_code::{RemoteError, RemoteErrorCode};
use crate::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Per-item size ceiling enforced by the table.
pub const ITEM_SIZE_LIMIT: usize = 400 * 1024;

/// Most keys accepted by one [`RemoteTable::batch_delete`] call.
pub const MAX_BATCH_SIZE: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub pk: String,
    pub sk: String,
}

impl ItemKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub key: ItemKey,
    /// Native expiry, epoch seconds. Tables may delete expired items lazily.
    pub ttl: Option<i64>,
    pub attributes: Map<String, Value>,
}

impl Item {
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            ttl: None,
            attributes: Map::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl = Some(ttl_secs);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    /// Approximate stored size in bytes.
    pub fn size(&self) -> usize {
        let attrs: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum();
        self.key.pk.len() + self.key.sk.len() + attrs + if self.ttl.is_some() { 11 } else { 0 }
    }
}

/// Write precondition evaluated against the stored item.
///
/// Against a missing item only [`Condition::NotExists`] holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    NotExists,
    Equals(String, Value),
    NotEquals(String, Value),
    /// Numeric attribute strictly below the bound.
    LessThan(String, i64),
    Or(Vec<Condition>),
    And(Vec<Condition>),
}

impl Condition {
    pub fn equals(name: &str, value: impl Into<Value>) -> Self {
        Condition::Equals(name.to_string(), value.into())
    }

    pub fn not_equals(name: &str, value: impl Into<Value>) -> Self {
        Condition::NotEquals(name.to_string(), value.into())
    }

    pub fn less_than(name: &str, bound: i64) -> Self {
        Condition::LessThan(name.to_string(), bound)
    }

    pub fn evaluate(&self, item: Option<&Item>) -> bool {
        match (self, item) {
            (Condition::NotExists, existing) => existing.is_none(),
            (Condition::Or(all), existing) => all.iter().any(|c| c.evaluate(existing)),
            (Condition::And(all), existing) => all.iter().all(|c| c.evaluate(existing)),
            (_, None) => false,
            (Condition::Equals(name, value), Some(item)) => item.get(name) == Some(value),
            (Condition::NotEquals(name, value), Some(item)) => {
                item.get(name).is_some_and(|v| v != value)
            }
            (Condition::LessThan(name, bound), Some(item)) => {
                item.get_i64(name).is_some_and(|v| v < *bound)
            }
        }
    }
}

/// Sort-key restriction for [`RemoteTable::query`].
#[derive(Debug, Clone, PartialEq)]
pub enum SortKeyFilter {
    Any,
    BeginsWith(String),
    /// Inclusive on both ends.
    Between(String, String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub pk: String,
    pub sk: SortKeyFilter,
    pub ascending: bool,
    pub limit: Option<usize>,
    pub start_after: Option<ItemKey>,
}

impl QueryRequest {
    pub fn partition(pk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: SortKeyFilter::Any,
            ascending: true,
            limit: None,
            start_after: None,
        }
    }

    pub fn sort_key(mut self, filter: SortKeyFilter) -> Self {
        self.sk = filter;
        self
    }

    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanFilter {
    /// Items whose partition key starts with the prefix.
    PartitionPrefix(String),
    /// Items under the prefix whose `ttl` is at or before the given epoch second.
    /// Served by the table's expiry index.
    ExpiredBefore { pk_prefix: String, ttl_secs: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub filter: ScanFilter,
    pub limit: Option<usize>,
    pub start_after: Option<ItemKey>,
}

impl ScanRequest {
    pub fn new(filter: ScanFilter) -> Self {
        Self {
            filter,
            limit: None,
            start_after: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Item>,
    /// Continuation token; `None` when the result set is exhausted.
    pub last_key: Option<ItemKey>,
}

#[async_trait]
pub trait RemoteTable: Send + Sync {
    async fn get_item(&self, key: &ItemKey) -> Result<Option<Item>>;
    async fn put_item(&self, item: &Item, condition: Option<&Condition>) -> Result<()>;
    async fn delete_item(&self, key: &ItemKey, condition: Option<&Condition>) -> Result<()>;
    async fn query(&self, request: &QueryRequest) -> Result<Page>;
    async fn scan(&self, request: &ScanRequest) -> Result<Page>;
    /// Delete up to [`MAX_BATCH_SIZE`] keys, returning the keys left unprocessed.
    async fn batch_delete(&self, keys: &[ItemKey]) -> Result<Vec<ItemKey>>;
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T: RemoteTable + ?Sized> RemoteTable for Arc<T> {
    async fn get_item(&self, key: &ItemKey) -> Result<Option<Item>> {
        (**self).get_item(key).await
    }

    async fn put_item(&self, item: &Item, condition: Option<&Condition>) -> Result<()> {
        (**self).put_item(item, condition).await
    }

    async fn delete_item(&self, key: &ItemKey, condition: Option<&Condition>) -> Result<()> {
        (**self).delete_item(key, condition).await
    }

    async fn query(&self, request: &QueryRequest) -> Result<Page> {
        (**self).query(request).await
    }

    async fn scan(&self, request: &ScanRequest) -> Result<Page> {
        (**self).scan(request).await
    }

    async fn batch_delete(&self, keys: &[ItemKey]) -> Result<Vec<ItemKey>> {
        (**self).batch_delete(keys).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

pub(crate) fn conditional_check_failed(key: &ItemKey) -> crate::Error {
    RemoteError::new(
        RemoteErrorCode::ConditionalCheckFailed,
        format!("condition failed for {}/{}", key.pk, key.sk),
    )
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_item(status: &str, created: i64) -> Item {
        Item::new(ItemKey::new("DEDUPE#x", "LOCK"))
            .with("status", status)
            .with("createdAt", created)
    }

    #[test]
    fn test_conditions_against_missing_item() {
        assert!(Condition::NotExists.evaluate(None));
        assert!(!Condition::equals("status", "pending").evaluate(None));
        assert!(!Condition::not_equals("status", "pending").evaluate(None));
        assert!(Condition::Or(vec![Condition::NotExists, Condition::less_than("createdAt", 5)])
            .evaluate(None));
    }

    #[test]
    fn test_conditions_against_item() {
        let item = lock_item("pending", 100);
        assert!(!Condition::NotExists.evaluate(Some(&item)));
        assert!(Condition::equals("status", "pending").evaluate(Some(&item)));
        assert!(Condition::not_equals("status", "completed").evaluate(Some(&item)));
        assert!(Condition::less_than("createdAt", 101).evaluate(Some(&item)));
        assert!(!Condition::less_than("createdAt", 100).evaluate(Some(&item)));
        assert!(!Condition::And(vec![
            Condition::equals("status", "pending"),
            Condition::less_than("createdAt", 50),
        ])
        .evaluate(Some(&item)));
    }

    #[test]
    fn test_item_size_grows_with_payload() {
        let small = Item::new(ItemKey::new("CACHE#a", "DATA")).with("value", "x");
        let big = Item::new(ItemKey::new("CACHE#a", "DATA")).with("value", "x".repeat(1000));
        assert!(big.size() > small.size() + 900);
        assert_eq!(small.get_str("value"), Some("x"));
        assert_eq!(small.get("missing"), None);
        assert_eq!(lock_item("pending", 7).get_i64("createdAt"), Some(7));
    }
}
