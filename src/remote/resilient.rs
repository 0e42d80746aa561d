use super::table::{Condition, Item, ItemKey, Page, QueryRequest, RemoteTable, ScanRequest};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, RetryPolicy};
use crate::{Error, Result};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Wraps a [`RemoteTable`] with a circuit breaker, per-attempt timeouts and retries.
///
/// Per attempt:
/// 1. an open breaker fails fast with [`Error::CircuitOpen`]
/// 2. the call is bounded by `timeout` ([`Error::OperationTimeout`])
/// 3. severe failures count toward the breaker, other failures leave it untouched
/// 4. retryable failures back off and retry; throttling that outlasts the retry
///    budget surfaces as [`Error::ThrottlingExhausted`]
pub struct ResilientTable<T> {
    inner: T,
    retry: RetryPolicy,
    breaker: Option<CircuitBreaker>,
    timeout: Duration,
}

impl<T: RemoteTable> ResilientTable<T> {
    pub fn new(
        inner: T,
        retry: RetryPolicy,
        breaker: CircuitBreakerConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            retry,
            breaker: breaker.enabled.then(|| CircuitBreaker::new(breaker)),
            timeout,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn breaker(&self) -> Option<CircuitBreakerSnapshot> {
        self.breaker.as_ref().map(CircuitBreaker::snapshot)
    }

    async fn run<R, F, Fut>(&self, operation: &'static str, call: F) -> Result<R>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let mut attempt: u32 = 0;
        loop {
            // Held across the call so a cancelled attempt still releases a trial slot.
            let permit = match &self.breaker {
                Some(breaker) => Some(breaker.allow()?),
                None => None,
            };
            attempt += 1;

            let outcome = match tokio::time::timeout(self.timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(Error::OperationTimeout {
                    operation: operation.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
            };

            let err = match outcome {
                Ok(value) => {
                    if let Some(permit) = permit {
                        permit.success();
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if let Some(permit) = permit {
                if err.is_severe() {
                    permit.failure();
                } else {
                    permit.neutral();
                }
            }

            if err.is_retryable() && attempt < self.retry.max_attempts {
                let delay = self.retry.backoff(attempt - 1);
                debug!(
                    table = self.inner.name(),
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying remote operation"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if err.is_throttling() {
                warn!(table = self.inner.name(), operation, attempts = attempt, "throttling exhausted retries");
                return Err(Error::ThrottlingExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                });
            }
            return Err(err);
        }
    }
}

#[async_trait]
impl<T: RemoteTable> RemoteTable for ResilientTable<T> {
    async fn get_item(&self, key: &ItemKey) -> Result<Option<Item>> {
        self.run("get_item", || self.inner.get_item(key)).await
    }

    async fn put_item(&self, item: &Item, condition: Option<&Condition>) -> Result<()> {
        self.run("put_item", || self.inner.put_item(item, condition))
            .await
    }

    async fn delete_item(&self, key: &ItemKey, condition: Option<&Condition>) -> Result<()> {
        self.run("delete_item", || self.inner.delete_item(key, condition))
            .await
    }

    async fn query(&self, request: &QueryRequest) -> Result<Page> {
        self.run("query", || self.inner.query(request)).await
    }

    async fn scan(&self, request: &ScanRequest) -> Result<Page> {
        self.run("scan", || self.inner.scan(request)).await
    }

    async fn batch_delete(&self, keys: &[ItemKey]) -> Result<Vec<ItemKey>> {
        self.run("batch_delete", || self.inner.batch_delete(keys))
            .await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::error_code::RemoteErrorCode;
    use crate::remote::InMemoryTable;
    use crate::resilience::CircuitState;
    use std::sync::Arc;

    fn wrap(table: Arc<InMemoryTable>, breaker: bool) -> ResilientTable<Arc<InMemoryTable>> {
        ResilientTable::new(
            table,
            RetryPolicy::new(3, Duration::from_millis(1)).with_max_delay(Duration::from_millis(5)),
            CircuitBreakerConfig::new()
                .enabled(breaker)
                .with_failure_threshold(2)
                .with_recovery_timeout(Duration::from_millis(50)),
            Duration::from_millis(100),
        )
    }

    fn key() -> ItemKey {
        ItemKey::new("CACHE#a", "DATA")
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let table = Arc::new(InMemoryTable::new());
        table.inject_failures(RemoteErrorCode::ServiceUnavailable, 2);
        let wrapped = wrap(table.clone(), false);
        assert_eq!(wrapped.get_item(&key()).await.unwrap(), None);
        assert_eq!(table.calls(), 3);
    }

    #[tokio::test]
    async fn test_throttling_exhausts() {
        let table = Arc::new(InMemoryTable::new());
        table.inject_failures(RemoteErrorCode::ProvisionedThroughputExceeded, 10);
        let wrapped = wrap(table.clone(), false);
        let err = wrapped.get_item(&key()).await.unwrap_err();
        assert!(matches!(err, Error::ThrottlingExhausted { attempts: 3, .. }));
        assert_eq!(table.calls(), 3);
    }

    #[tokio::test]
    async fn test_validation_fails_without_retry() {
        let table = Arc::new(InMemoryTable::new());
        table.inject_failures(RemoteErrorCode::Validation, 1);
        let wrapped = wrap(table.clone(), true);
        let err = wrapped.get_item(&key()).await.unwrap_err();
        assert_eq!(err.remote_code(), Some(RemoteErrorCode::Validation));
        assert_eq!(table.calls(), 1);
        assert_eq!(wrapped.breaker().unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_timeout() {
        let table = Arc::new(InMemoryTable::new());
        table.set_latency(Duration::from_millis(500));
        let wrapped = ResilientTable::new(
            table,
            RetryPolicy::new(1, Duration::from_millis(1)),
            CircuitBreakerConfig::default(),
            Duration::from_millis(20),
        );
        let err = wrapped.get_item(&key()).await.unwrap_err();
        assert!(matches!(err, Error::OperationTimeout { .. }));
    }

    #[tokio::test]
    async fn test_breaker_opens_and_recovers() {
        let table = Arc::new(InMemoryTable::new());
        table.inject_failures(RemoteErrorCode::InternalServerError, 3);
        let wrapped = wrap(table.clone(), true);

        // Two severe failures within one call's retries open the breaker.
        assert!(wrapped.get_item(&key()).await.is_err());
        assert_eq!(wrapped.breaker().unwrap().state, CircuitState::Open);

        let calls = table.calls();
        assert!(matches!(
            wrapped.get_item(&key()).await,
            Err(Error::CircuitOpen { .. })
        ));
        assert_eq!(table.calls(), calls, "open breaker must not reach the table");

        table.clear_failures();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(wrapped.get_item(&key()).await.is_ok());
        assert_eq!(wrapped.breaker().unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_trial_does_not_wedge_breaker() {
        let table = Arc::new(InMemoryTable::new());
        let wrapped = ResilientTable::new(
            table.clone(),
            RetryPolicy::new(1, Duration::from_millis(1)),
            CircuitBreakerConfig::new()
                .enabled(true)
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_millis(20)),
            Duration::from_secs(1),
        );
        table.inject_failures(RemoteErrorCode::ServiceUnavailable, 1);
        assert!(wrapped.get_item(&key()).await.is_err());
        assert_eq!(wrapped.breaker().unwrap().state, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        table.set_latency(Duration::from_millis(200));
        let cancelled = tokio::time::timeout(Duration::from_millis(10), wrapped.get_item(&key())).await;
        assert!(cancelled.is_err());
        assert_eq!(wrapped.breaker().unwrap().state, CircuitState::HalfOpen);

        table.set_latency(Duration::ZERO);
        assert_eq!(wrapped.get_item(&key()).await.unwrap(), None);
        assert_eq!(wrapped.breaker().unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_conflicts_do_not_trip_breaker() {
        let table = Arc::new(InMemoryTable::new());
        let wrapped = wrap(table, true);
        let item = Item::new(key());
        wrapped.put_item(&item, None).await.unwrap();
        for _ in 0..5 {
            let err = wrapped
                .put_item(&item, Some(&Condition::NotExists))
                .await
                .unwrap_err();
            assert!(err.is_conflict());
        }
        assert_eq!(wrapped.breaker().unwrap().state, CircuitState::Closed);
    }
}
