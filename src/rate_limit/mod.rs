//! Sliding-window rate limiting over a pluggable request log.
//!
//! Every backend stores one row per admitted request; [`WindowedRateLimiter`] turns
//! those rows into admission decisions, and optionally into an adaptive
//! user/background split computed by [`capacity::CapacityCalculator`].

pub mod capacity;
mod windowed;

pub use capacity::{
    ActivityMetrics, ActivityTrend, AdaptiveConfig, CapacityCalculator, DynamicCapacity,
};
pub use windowed::WindowedRateLimiter;

use crate::stores::{Priority, ResourceLimit, ResourceLimits};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Last computed capacity for one resource, shared across processes by backends
/// that can persist it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCapacity {
    pub capacity: DynamicCapacity,
    /// Limit the split was computed for; a changed limit invalidates it.
    pub total_limit: u32,
    pub calculated_at_ms: i64,
    #[serde(default)]
    pub last_user_request_ms: Option<i64>,
}

/// Append-only log of admitted requests, one entry per request.
#[async_trait]
pub trait RequestLog: Send + Sync {
    async fn append(&self, resource: &str, priority: Option<Priority>, at_ms: i64) -> Result<()>;

    /// Timestamps strictly after `since_ms`, ascending. `None` matches every entry,
    /// including entries recorded without a priority.
    async fn timestamps(
        &self,
        resource: &str,
        priority: Option<Priority>,
        since_ms: i64,
    ) -> Result<Vec<i64>>;

    /// Most recent entry of the given priority still retained.
    async fn last_seen(&self, resource: &str, priority: Priority) -> Result<Option<i64>>;

    async fn clear(&self, resource: &str) -> Result<()>;

    /// Drop this resource's entries at or before `before_ms`.
    async fn prune_resource(&self, resource: &str, before_ms: i64) -> Result<u64>;

    /// Drop every entry at or before `before_ms`.
    async fn prune(&self, before_ms: i64) -> Result<u64>;

    async fn load_capacity(&self, _resource: &str) -> Result<Option<CachedCapacity>> {
        Ok(None)
    }

    async fn store_capacity(&self, _resource: &str, _capacity: &CachedCapacity) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub limits: ResourceLimits,
    /// Enables priority-aware capacity splitting.
    pub adaptive: Option<AdaptiveConfig>,
    pub cleanup_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            adaptive: None,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_limit(mut self, limit: ResourceLimit) -> Self {
        self.limits.default = limit;
        self
    }

    pub fn with_limit(mut self, resource: impl Into<String>, limit: ResourceLimit) -> Self {
        self.limits.set(resource, limit);
        self
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveConfig) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}
