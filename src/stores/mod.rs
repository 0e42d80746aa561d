//! Store contracts shared by every backend.
//!
//! The orchestrator only ever sees these traits:
//!
//! | Trait | Operations |
//! |-------|------------|
//! | [`CacheStore`] | `get` / `set` / `delete` / `clear` |
//! | [`DedupeStore`] | `register` / `wait_for` / `complete` / `fail` / `is_in_progress` |
//! | [`RateLimitStore`] | `can_proceed` / `record` / `status` / `reset` / `wait_time`, optionally per [`Priority`] |
//!
//! Backends live in [`crate::memory`], [`crate::sqlite`] and [`crate::remote`].

use crate::rate_limit::capacity::DynamicCapacity;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub items: u64,
    pub memory_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Hash-keyed response cache with per-entry time-to-live.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Expired and undecodable entries read as `None`.
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    /// `Duration::ZERO` stores an entry that is already expired.
    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn stats(&self) -> Result<CacheStats>;
    /// Remove expired entries, returning how many were reclaimed.
    async fn cleanup(&self) -> Result<u64>;
    /// Stop background work and release the backing store. Idempotent.
    async fn close(&self) -> Result<()>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(crate::Error::validation_with_context(
                format!("unknown job status '{other}'"),
                crate::ErrorContext::new().with_source("dedupe_store"),
            )),
        }
    }
}

/// Result of [`DedupeStore::register`].
///
/// Concurrent registrations of a pending fingerprint all receive the same `job_id`;
/// exactly one of them has `owner == true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRegistration {
    pub job_id: String,
    pub owner: bool,
}

/// How a wait on an in-flight job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Completed(Value),
    Failed(String),
    /// No job exists for the fingerprint.
    Missing,
}

/// Tracks in-flight upstream calls so concurrent callers share one result.
#[async_trait]
pub trait DedupeStore: Send + Sync {
    async fn register(&self, key: &str) -> Result<JobRegistration>;

    /// Wait for the current job on `key` to resolve.
    ///
    /// Returns immediately with [`WaitOutcome::Missing`] when no job exists, and
    /// `Err(Error::DedupeTimeout)` when the bounded wait elapses or the job is
    /// reclaimed as abandoned.
    async fn wait_outcome(&self, key: &str) -> Result<WaitOutcome>;

    /// Completed value of the job, or `None` when no job exists or it failed.
    async fn wait_for(&self, key: &str) -> Result<Option<Value>> {
        match self.wait_outcome(key).await? {
            WaitOutcome::Completed(value) => Ok(Some(value)),
            WaitOutcome::Failed(_) | WaitOutcome::Missing => Ok(None),
        }
    }

    /// First resolution wins; resolving a missing or resolved job is a no-op.
    async fn complete(&self, key: &str, value: &Value) -> Result<()>;
    async fn fail(&self, key: &str, error: &str) -> Result<()>;
    /// `false` for jobs older than the configured job timeout.
    async fn is_in_progress(&self, key: &str) -> Result<bool>;
    /// Reclaim abandoned and resolved jobs, returning how many were removed.
    async fn cleanup(&self) -> Result<u64>;
    async fn close(&self) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Traffic class for adaptive rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Foreground requests with reserved capacity.
    User,
    /// Opportunistic requests that may be paused.
    Background,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::User => "user",
            Priority::Background => "background",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Priority::User),
            "background" => Ok(Priority::Background),
            other => Err(crate::Error::validation_with_context(
                format!("unknown priority '{other}'"),
                crate::ErrorContext::new().with_source("rate_limit_store"),
            )),
        }
    }
}

/// Requests allowed per trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimit {
    pub limit: u32,
    pub window: Duration,
}

impl ResourceLimit {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

impl Default for ResourceLimit {
    /// Comic Vine allows 200 requests per resource per hour.
    fn default() -> Self {
        Self {
            limit: 200,
            window: Duration::from_secs(3600),
        }
    }
}

/// Store-wide default plus per-resource overrides.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub default: ResourceLimit,
    overrides: HashMap<String, ResourceLimit>,
}

impl ResourceLimits {
    pub fn new(default: ResourceLimit) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, resource: impl Into<String>, limit: ResourceLimit) -> Self {
        self.overrides.insert(resource.into(), limit);
        self
    }

    pub fn set(&mut self, resource: impl Into<String>, limit: ResourceLimit) {
        self.overrides.insert(resource.into(), limit);
    }

    pub fn remove(&mut self, resource: &str) -> Option<ResourceLimit> {
        self.overrides.remove(resource)
    }

    pub fn get(&self, resource: &str) -> ResourceLimit {
        self.overrides.get(resource).copied().unwrap_or(self.default)
    }

    /// Longest window among the default and all overrides.
    pub fn longest_window(&self) -> Duration {
        self.overrides
            .values()
            .map(|l| l.window)
            .fold(self.default.window, Duration::max)
    }
}

/// Per-priority breakdown attached to adaptive status reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptiveStatus {
    pub capacity: DynamicCapacity,
    pub user_count: u32,
    pub background_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub remaining: u32,
    /// Epoch milliseconds at which one more request becomes admissible.
    pub reset_at_ms: i64,
    pub limit: u32,
    pub adaptive: Option<AdaptiveStatus>,
}

/// Sliding-window admission control keyed by resource name.
///
/// The `*_with` methods take an optional [`Priority`]; `None` measures against the
/// resource's whole limit.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn can_proceed_with(&self, resource: &str, priority: Option<Priority>) -> Result<bool>;
    /// Append-only: callers check admission first.
    async fn record_with(&self, resource: &str, priority: Option<Priority>) -> Result<()>;
    async fn status_with(&self, resource: &str, priority: Option<Priority>)
        -> Result<RateLimitStatus>;
    /// Zero exactly when `can_proceed_with` would admit; never longer than the window.
    async fn wait_time_with(&self, resource: &str, priority: Option<Priority>) -> Result<Duration>;
    async fn reset(&self, resource: &str) -> Result<()>;
    fn set_limit(&self, resource: &str, limit: ResourceLimit);
    fn limit_for(&self, resource: &str) -> ResourceLimit;
    async fn close(&self) -> Result<()>;

    async fn can_proceed(&self, resource: &str) -> Result<bool> {
        self.can_proceed_with(resource, None).await
    }

    async fn record(&self, resource: &str) -> Result<()> {
        self.record_with(resource, None).await
    }

    async fn status(&self, resource: &str) -> Result<RateLimitStatus> {
        self.status_with(resource, None).await
    }

    async fn wait_time(&self, resource: &str) -> Result<Duration> {
        self.wait_time_with(resource, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_limits_fall_back_to_default() {
        let limits = ResourceLimits::new(ResourceLimit::new(10, Duration::from_secs(60)))
            .with_override("issues", ResourceLimit::new(2, Duration::from_secs(600)));
        assert_eq!(limits.get("issues").limit, 2);
        assert_eq!(limits.get("volumes").limit, 10);
        assert_eq!(limits.longest_window(), Duration::from_secs(600));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("done".parse::<JobStatus>().is_err());
        assert_eq!("background".parse::<Priority>().unwrap(), Priority::Background);
        assert_eq!(Priority::User.to_string(), "user");
    }

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_ratio(), 0.75);
        assert_eq!(CacheStats::default().hit_ratio(), 0.0);
    }
}
