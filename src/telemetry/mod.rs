//! Store instrumentation.
//!
//! A [`StoreMonitor`] is created by the application and handed to whatever wraps
//! store calls; [`observe`] times one call, logs its start and end with the
//! correlation id, and folds the outcome into the monitor's per-operation counters.
//!
//! ```rust
//! use comic_vine::telemetry::{observe, StoreMonitor};
//!
//! # #[tokio::main] async fn main() {
//! let monitor = StoreMonitor::new();
//! let value = observe(&monitor, "cache.get", "req-1", async { Ok::<_, comic_vine::Error>(42) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, 42);
//! assert_eq!(monitor.snapshot("cache.get").unwrap().calls, 1);
//! # }
//! ```

use crate::stores::lock;
use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

/// Accumulated timings for one operation name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub calls: u64,
    pub errors: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl OperationStats {
    pub fn mean_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.calls as f64
        }
    }
}

/// Per-operation counters. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct StoreMonitor {
    operations: Mutex<HashMap<&'static str, OperationStats>>,
}

impl StoreMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: &'static str, elapsed_ms: u64, failed: bool) {
        let mut operations = lock(&self.operations);
        let stats = operations.entry(operation).or_default();
        stats.calls += 1;
        stats.errors += failed as u64;
        stats.total_ms += elapsed_ms;
        stats.max_ms = stats.max_ms.max(elapsed_ms);
    }

    pub fn snapshot(&self, operation: &str) -> Option<OperationStats> {
        lock(&self.operations).get(operation).copied()
    }

    /// All operations, sorted by name.
    pub fn report(&self) -> Vec<(&'static str, OperationStats)> {
        let mut all: Vec<_> = lock(&self.operations)
            .iter()
            .map(|(op, stats)| (*op, *stats))
            .collect();
        all.sort_by_key(|(op, _)| *op);
        all
    }

    pub fn reset(&self) {
        lock(&self.operations).clear();
    }
}

/// Run `future` as `operation`, logging start and end and recording the timing.
pub async fn observe<T, F>(
    monitor: &StoreMonitor,
    operation: &'static str,
    correlation_id: &str,
    future: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    debug!(op = operation, correlation_id, "store operation started");
    let started = Instant::now();
    let result = future.await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    monitor.record(operation, elapsed_ms, result.is_err());
    match &result {
        Ok(_) => debug!(op = operation, correlation_id, elapsed_ms, "store operation finished"),
        Err(e) => debug!(
            op = operation,
            correlation_id,
            elapsed_ms,
            error = %e,
            "store operation failed"
        ),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::time::Duration;

    #[tokio::test]
    async fn test_observe_records_outcomes() {
        let monitor = StoreMonitor::new();
        observe(&monitor, "cache.get", "a", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        })
        .await
        .unwrap();
        let err = observe(&monitor, "cache.get", "b", async {
            Err::<(), _>(Error::runtime("boom"))
        })
        .await;
        assert!(err.is_err());

        let stats = monitor.snapshot("cache.get").unwrap();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.errors, 1);
        assert!(stats.max_ms >= 5);
        assert!(stats.mean_ms() > 0.0);
        assert!(monitor.snapshot("cache.set").is_none());
    }

    #[test]
    fn test_report_is_sorted() {
        let monitor = StoreMonitor::new();
        monitor.record("rate_limit.record", 1, false);
        monitor.record("cache.get", 2, false);
        let names: Vec<_> = monitor.report().into_iter().map(|(op, _)| op).collect();
        assert_eq!(names, vec!["cache.get", "rate_limit.record"]);
        monitor.reset();
        assert!(monitor.report().is_empty());
    }
}
