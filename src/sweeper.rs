//! Periodic background cleanup for stores.
//!
//! A sweeper owns one tokio task that calls a cleanup closure on an interval. The
//! closure usually holds a `Weak` to store state and returns `Ok(0)` once the store
//! is gone; dropping the [`Sweeper`] aborts the task.

use crate::Result;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct Sweeper {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn a sweeper on the current tokio runtime.
    ///
    /// Returns `None` when `interval` is zero or when called outside a runtime; the
    /// store then relies on lazy expiry and explicit `cleanup()` calls.
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut sweep: F) -> Option<Self>
    where
        F: FnMut() -> Option<Fut> + Send + 'static,
        Fut: Future<Output = Result<u64>> + Send + 'static,
    {
        if interval.is_zero() {
            return None;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(store = name, "no tokio runtime, periodic cleanup disabled");
                return None;
            }
        };

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(task) = sweep() else {
                    debug!(store = name, "store dropped, sweeper exiting");
                    break;
                };
                match task.await {
                    Ok(0) => {}
                    Ok(removed) => debug!(store = name, removed, "periodic cleanup"),
                    Err(e) => warn!(store = name, error = %e, "periodic cleanup failed"),
                }
            }
        });

        Some(Self { name, handle })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
