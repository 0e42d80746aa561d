//! In-process backends.
//!
//! Nothing here survives a restart or is shared between processes; use
//! [`crate::sqlite`] or [`crate::remote`] for that.

mod cache;
mod dedupe;
mod request_log;

pub use cache::{MemoryCacheConfig, MemoryCacheStore};
pub use dedupe::{MemoryDedupeConfig, MemoryDedupeStore};
pub use request_log::MemoryRequestLog;

use crate::rate_limit::{RateLimiterConfig, WindowedRateLimiter};

pub type MemoryRateLimitStore = WindowedRateLimiter<MemoryRequestLog>;

impl MemoryRateLimitStore {
    pub fn in_memory(config: RateLimiterConfig) -> Self {
        WindowedRateLimiter::new(MemoryRequestLog::new(), config)
    }
}
