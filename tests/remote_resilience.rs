//! Remote stores under injected faults: retries, breaker, timeouts.

use comic_vine::remote::error_code::RemoteErrorCode;
use comic_vine::remote::{InMemoryTable, RemoteBackend, RemoteConfig};
use comic_vine::resilience::{CircuitBreakerConfig, CircuitState};
use comic_vine::{CacheStore, DedupeStore, Error};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn config() -> RemoteConfig {
    RemoteConfig::new("resilience")
        .with_retries(3, Duration::from_millis(1))
        .with_operation_timeout(Duration::from_secs(1))
}

fn backend(config: RemoteConfig) -> (Arc<InMemoryTable>, RemoteBackend) {
    let table = Arc::new(InMemoryTable::new());
    let backend = RemoteBackend::new(table.clone(), config).unwrap();
    (table, backend)
}

#[tokio::test]
async fn test_throttling_is_absorbed_by_retries() {
    let (table, backend) = backend(config());
    let cache = backend.cache_store();

    table.inject_failures(RemoteErrorCode::ProvisionedThroughputExceeded, 2);
    cache
        .set("k", &json!({"id": 1}), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(table.calls(), 3);
    assert_eq!(cache.get("k").await.unwrap(), Some(json!({"id": 1})));
}

#[tokio::test]
async fn test_throttling_exhausts_retry_budget() {
    let (table, backend) = backend(config());
    let cache = backend.cache_store();

    table.inject_failures(RemoteErrorCode::Throttling, 10);
    let err = cache.get("k").await.unwrap_err();
    assert!(
        matches!(err, Error::ThrottlingExhausted { attempts: 3, .. }),
        "{err:?}"
    );
    table.clear_failures();
    assert_eq!(cache.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let (table, backend) = backend(config());
    let cache = backend.cache_store();

    table.inject_failures(RemoteErrorCode::Validation, 1);
    let err = cache.get("k").await.unwrap_err();
    assert_eq!(err.remote_code(), Some(RemoteErrorCode::Validation));
    assert_eq!(table.calls(), 1);
}

#[tokio::test]
async fn test_breaker_opens_and_recovers() {
    let breaker = CircuitBreakerConfig::new()
        .enabled(true)
        .with_failure_threshold(2)
        .with_recovery_timeout(Duration::from_millis(50));
    let (table, backend) = backend(
        config()
            .with_retries(1, Duration::from_millis(1))
            .with_circuit_breaker(breaker),
    );
    let cache = backend.cache_store();

    table.inject_failures(RemoteErrorCode::InternalServerError, 2);
    assert!(cache.get("k").await.is_err());
    assert!(cache.get("k").await.is_err());
    assert_eq!(backend.breaker().unwrap().state, CircuitState::Open);

    let calls = table.calls();
    assert!(matches!(
        cache.get("k").await,
        Err(Error::CircuitOpen { .. })
    ));
    assert_eq!(table.calls(), calls, "open breaker must not reach the table");

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(cache.get("k").await.unwrap(), None);
    assert_eq!(backend.breaker().unwrap().state, CircuitState::Closed);
}

#[tokio::test]
async fn test_cancelled_half_open_call_lets_the_next_one_through() {
    let breaker = CircuitBreakerConfig::new()
        .enabled(true)
        .with_failure_threshold(1)
        .with_recovery_timeout(Duration::from_millis(20));
    let (table, backend) = backend(
        config()
            .with_retries(1, Duration::from_millis(1))
            .with_circuit_breaker(breaker),
    );
    let cache = backend.cache_store();

    table.inject_failures(RemoteErrorCode::ServiceUnavailable, 1);
    assert!(cache.get("k").await.is_err());
    tokio::time::sleep(Duration::from_millis(30)).await;

    // The caller gives up on the trial call while the table is slow.
    table.set_latency(Duration::from_millis(200));
    assert!(tokio::time::timeout(Duration::from_millis(10), cache.get("k"))
        .await
        .is_err());

    table.set_latency(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.get("k").await.unwrap(), None);
    assert_eq!(backend.breaker().unwrap().state, CircuitState::Closed);
}

#[tokio::test]
async fn test_conflicts_do_not_trip_the_breaker() {
    let breaker = CircuitBreakerConfig::new()
        .enabled(true)
        .with_failure_threshold(1);
    let (_table, backend) = backend(config().with_circuit_breaker(breaker));
    let dedupe = backend.dedupe_store();

    // Every follower registration loses a conditional write.
    assert!(dedupe.register("k").await.unwrap().owner);
    for _ in 0..3 {
        assert!(!dedupe.register("k").await.unwrap().owner);
    }
    assert_eq!(backend.breaker().unwrap().state, CircuitState::Closed);
}

#[tokio::test]
async fn test_slow_table_times_out() {
    let (table, backend) = backend(
        config()
            .with_retries(1, Duration::from_millis(1))
            .with_operation_timeout(Duration::from_millis(20)),
    );
    let cache = backend.cache_store();

    table.set_latency(Duration::from_millis(200));
    let err = cache.get("k").await.unwrap_err();
    assert!(matches!(err, Error::OperationTimeout { .. }), "{err:?}");

    table.set_latency(Duration::ZERO);
    assert_eq!(cache.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_dedupe_rides_out_transient_failures() {
    let (table, backend) = backend(config());
    let dedupe = backend.dedupe_store();

    table.inject_failures(RemoteErrorCode::ServiceUnavailable, 1);
    let registration = dedupe.register("k").await.unwrap();
    assert!(registration.owner);

    table.inject_failures(RemoteErrorCode::ConnectionReset, 1);
    dedupe.complete("k", &json!("value")).await.unwrap();
    assert_eq!(dedupe.wait_for("k").await.unwrap(), Some(json!("value")));
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let table = Arc::new(InMemoryTable::new());
    let err = RemoteBackend::new(table.clone(), RemoteConfig::new(""))
        .err()
        .unwrap();
    assert!(matches!(err, Error::Configuration { .. }));

    let err = RemoteBackend::new(table, config().with_batch_size(0))
        .err()
        .unwrap();
    assert!(err.to_string().contains("batch size"));
}
