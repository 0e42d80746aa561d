use super::{AdaptiveConfig, CachedCapacity, CapacityCalculator, RateLimiterConfig, RequestLog};
use crate::stores::{
    duration_ms, lock, now_ms, AdaptiveStatus, Priority, RateLimitStatus, RateLimitStore,
    ResourceLimit, ResourceLimits,
};
use crate::sweeper::Sweeper;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

struct Adaptive {
    calculator: CapacityCalculator,
    cache: Mutex<HashMap<String, CachedCapacity>>,
    last_user: Mutex<HashMap<String, i64>>,
}

struct Evaluation {
    allowed: bool,
    remaining: u32,
    allowance: u32,
    wait_ms: i64,
    now_ms: i64,
    adaptive: Option<AdaptiveStatus>,
}

/// [`RateLimitStore`] over any [`RequestLog`]: a true sliding window, with an
/// optional adaptive split between user and background traffic.
///
/// In adaptive mode each class is admitted against its own allowance only. When the
/// split moves toward users mid-window, background requests already admitted under
/// the old split still count for background, so the two classes together may exceed
/// the resource limit until those entries slide out.
pub struct WindowedRateLimiter<L: RequestLog + 'static> {
    log: Arc<L>,
    limits: Arc<Mutex<ResourceLimits>>,
    adaptive: Option<Adaptive>,
    closed: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

fn retention(limits: &ResourceLimits, adaptive: Option<&AdaptiveConfig>) -> Duration {
    let window = limits.longest_window();
    adaptive.map_or(window, |cfg| window.max(cfg.lookback()))
}

impl<L: RequestLog + 'static> WindowedRateLimiter<L> {
    pub fn new(log: L, config: RateLimiterConfig) -> Self {
        let log = Arc::new(log);
        let limits = Arc::new(Mutex::new(config.limits));

        let weak = Arc::downgrade(&log);
        let sweep_limits = limits.clone();
        let sweep_adaptive = config.adaptive.clone();
        let sweeper = Sweeper::spawn(log.name(), config.cleanup_interval, move || {
            let log = weak.upgrade()?;
            let horizon = retention(&lock(&sweep_limits), sweep_adaptive.as_ref());
            Some(async move { log.prune(now_ms() - duration_ms(horizon)).await })
        });

        Self {
            log,
            limits,
            adaptive: config.adaptive.map(|cfg| Adaptive {
                calculator: CapacityCalculator::new(cfg),
                cache: Mutex::new(HashMap::new()),
                last_user: Mutex::new(HashMap::new()),
            }),
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(sweeper),
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn is_adaptive(&self) -> bool {
        self.adaptive.is_some()
    }

    /// Drop every entry older than the longest window in use.
    pub async fn cleanup(&self) -> Result<u64> {
        self.ensure_open()?;
        let horizon = retention(
            &lock(&self.limits),
            self.adaptive.as_ref().map(|a| a.calculator.config()),
        );
        self.log.prune(now_ms() - duration_ms(horizon)).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::StoreDestroyed {
                store: self.log.name(),
            })
        } else {
            Ok(())
        }
    }

    async fn capacity(
        &self,
        adaptive: &Adaptive,
        resource: &str,
        total_limit: u32,
        priority: Priority,
        now: i64,
    ) -> Result<CachedCapacity> {
        let cfg = adaptive.calculator.config();
        let interval = duration_ms(cfg.recalculation_interval);
        // A user arriving at a resource that reserved nothing for users forces a recalculation.
        let fresh = |c: &CachedCapacity| {
            c.total_limit == total_limit
                && now - c.calculated_at_ms < interval
                && !(priority == Priority::User && c.capacity.user_reserved == 0)
        };

        if let Some(cached) = lock(&adaptive.cache).get(resource).filter(|c| fresh(c)) {
            return Ok(cached.clone());
        }
        let persisted = self.log.load_capacity(resource).await?;
        if let Some(cached) = persisted.as_ref().filter(|c| fresh(c)) {
            lock(&adaptive.cache).insert(resource.to_string(), cached.clone());
            return Ok(cached.clone());
        }

        let since = now - duration_ms(cfg.monitoring_window);
        let user = self.log.timestamps(resource, Some(Priority::User), since).await?;
        let background = self
            .log
            .timestamps(resource, Some(Priority::Background), since)
            .await?;

        let mut last_user = [
            user.last().copied(),
            lock(&adaptive.last_user).get(resource).copied(),
            persisted.as_ref().and_then(|c| c.last_user_request_ms),
        ]
        .into_iter()
        .flatten()
        .max();
        if last_user.is_none() {
            last_user = self.log.last_seen(resource, Priority::User).await?;
        }
        let mut effective_last_user = last_user;
        if priority == Priority::User {
            if let Some(last) = last_user {
                if now - last > duration_ms(cfg.sustained_inactivity_threshold) {
                    effective_last_user = Some(now);
                }
            }
        }

        let metrics = adaptive
            .calculator
            .metrics(&user, &background, effective_last_user, now);
        let capacity = adaptive
            .calculator
            .calculate(resource, total_limit, &metrics, now);
        debug!(
            resource,
            user_reserved = capacity.user_reserved,
            background_max = capacity.background_max,
            background_paused = capacity.background_paused,
            reason = %capacity.reason,
            "recalculated capacity"
        );

        let cached = CachedCapacity {
            capacity,
            total_limit,
            calculated_at_ms: now,
            last_user_request_ms: last_user,
        };
        lock(&adaptive.cache).insert(resource.to_string(), cached.clone());
        if let Err(e) = self.log.store_capacity(resource, &cached).await {
            warn!(resource, error = %e, "failed to persist adaptive capacity");
        }
        Ok(cached)
    }

    async fn evaluate(&self, resource: &str, priority: Option<Priority>) -> Result<Evaluation> {
        self.ensure_open()?;
        let now = now_ms();
        let limit = self.limit_for(resource);
        let window_ms = duration_ms(limit.window).max(1);
        let since = now - window_ms;

        let (allowance, timestamps, adaptive, resume_at) = match (priority, &self.adaptive) {
            (Some(priority), Some(adaptive)) => {
                let cached = self
                    .capacity(adaptive, resource, limit.limit, priority, now)
                    .await?;
                let user = self.log.timestamps(resource, Some(Priority::User), since).await?;
                let background = self
                    .log
                    .timestamps(resource, Some(Priority::Background), since)
                    .await?;
                let is_background = priority == Priority::Background;
                let resume_at = (is_background && cached.capacity.background_paused).then(|| {
                    cached.calculated_at_ms
                        + duration_ms(adaptive.calculator.config().recalculation_interval)
                });
                let status = AdaptiveStatus {
                    capacity: cached.capacity.clone(),
                    user_count: user.len() as u32,
                    background_count: background.len() as u32,
                };
                let allowance = cached.capacity.allowance(is_background);
                let timestamps = if is_background { background } else { user };
                (allowance, timestamps, Some(status), resume_at)
            }
            _ => {
                let all = self.log.timestamps(resource, None, since).await?;
                (limit.limit, all, None, None)
            }
        };

        let count = timestamps.len() as u32;
        let allowed = count < allowance;
        let wait_ms = if allowed {
            0
        } else if let Some(resume_at) = resume_at {
            (resume_at - now).clamp(1, window_ms)
        } else if allowance == 0 {
            window_ms
        } else {
            // The entry whose expiry brings the count back under the allowance.
            let pivot = timestamps[(count - allowance) as usize];
            (pivot + window_ms - now).clamp(1, window_ms)
        };

        Ok(Evaluation {
            allowed,
            remaining: allowance.saturating_sub(count),
            allowance,
            wait_ms,
            now_ms: now,
            adaptive,
        })
    }
}

#[async_trait]
impl<L: RequestLog + 'static> RateLimitStore for WindowedRateLimiter<L> {
    async fn can_proceed_with(&self, resource: &str, priority: Option<Priority>) -> Result<bool> {
        Ok(self.evaluate(resource, priority).await?.allowed)
    }

    async fn record_with(&self, resource: &str, priority: Option<Priority>) -> Result<()> {
        self.ensure_open()?;
        let now = now_ms();
        self.log.append(resource, priority, now).await?;

        if let (Some(Priority::User), Some(adaptive)) = (priority, &self.adaptive) {
            lock(&adaptive.last_user).insert(resource.to_string(), now);
        }

        let horizon = {
            let limits = lock(&self.limits);
            let window = limits.get(resource).window;
            self.adaptive
                .as_ref()
                .map_or(window, |a| window.max(a.calculator.config().lookback()))
        };
        if let Err(e) = self
            .log
            .prune_resource(resource, now - duration_ms(horizon))
            .await
        {
            debug!(resource, error = %e, "lazy prune failed");
        }
        Ok(())
    }

    async fn status_with(
        &self,
        resource: &str,
        priority: Option<Priority>,
    ) -> Result<RateLimitStatus> {
        let eval = self.evaluate(resource, priority).await?;
        Ok(RateLimitStatus {
            remaining: eval.remaining,
            reset_at_ms: eval.now_ms + eval.wait_ms,
            limit: eval.allowance,
            adaptive: eval.adaptive,
        })
    }

    async fn wait_time_with(&self, resource: &str, priority: Option<Priority>) -> Result<Duration> {
        let eval = self.evaluate(resource, priority).await?;
        Ok(Duration::from_millis(eval.wait_ms.max(0) as u64))
    }

    async fn reset(&self, resource: &str) -> Result<()> {
        self.ensure_open()?;
        self.log.clear(resource).await?;
        if let Some(adaptive) = &self.adaptive {
            lock(&adaptive.cache).remove(resource);
            lock(&adaptive.last_user).remove(resource);
        }
        Ok(())
    }

    fn set_limit(&self, resource: &str, limit: ResourceLimit) {
        lock(&self.limits).set(resource, limit);
    }

    fn limit_for(&self, resource: &str) -> ResourceLimit {
        lock(&self.limits).get(resource)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        lock(&self.sweeper).take();
        self.log.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRequestLog;
    use crate::rate_limit::AdaptiveConfig;

    fn limiter(limit: u32, window: Duration) -> WindowedRateLimiter<MemoryRequestLog> {
        WindowedRateLimiter::new(
            MemoryRequestLog::new(),
            RateLimiterConfig::new().with_default_limit(ResourceLimit::new(limit, window)),
        )
    }

    #[tokio::test]
    async fn test_admits_up_to_limit() {
        let rl = limiter(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(rl.can_proceed("issues").await.unwrap());
            rl.record("issues").await.unwrap();
        }
        assert!(!rl.can_proceed("issues").await.unwrap());
        let wait = rl.wait_time("issues").await.unwrap();
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(60));

        let status = rl.status("issues").await.unwrap();
        assert_eq!(status.remaining, 0);
        assert_eq!(status.limit, 3);
        assert!(status.adaptive.is_none());

        assert!(rl.can_proceed("volumes").await.unwrap());
        assert_eq!(rl.wait_time("volumes").await.unwrap(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let rl = limiter(2, Duration::from_millis(80));
        rl.record("issues").await.unwrap();
        rl.record("issues").await.unwrap();
        assert!(!rl.can_proceed("issues").await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rl.can_proceed("issues").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_limit_never_admits() {
        let rl = limiter(0, Duration::from_secs(5));
        assert!(!rl.can_proceed("issues").await.unwrap());
        assert_eq!(rl.wait_time("issues").await.unwrap(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_set_limit_applies_immediately() {
        let rl = limiter(1, Duration::from_secs(60));
        rl.record("issues").await.unwrap();
        assert!(!rl.can_proceed("issues").await.unwrap());
        rl.set_limit("issues", ResourceLimit::new(5, Duration::from_secs(60)));
        assert!(rl.can_proceed("issues").await.unwrap());
        assert_eq!(rl.limit_for("issues").limit, 5);
        assert_eq!(rl.limit_for("volumes").limit, 1);
    }

    #[tokio::test]
    async fn test_reset_clears_history() {
        let rl = limiter(1, Duration::from_secs(60));
        rl.record("issues").await.unwrap();
        rl.reset("issues").await.unwrap();
        assert!(rl.can_proceed("issues").await.unwrap());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let rl = limiter(1, Duration::from_secs(60));
        rl.close().await.unwrap();
        rl.close().await.unwrap();
        assert!(matches!(
            rl.can_proceed("issues").await,
            Err(Error::StoreDestroyed { .. })
        ));
    }

    #[tokio::test]
    async fn test_adaptive_initial_split() {
        let rl = WindowedRateLimiter::new(
            MemoryRequestLog::new(),
            RateLimiterConfig::new()
                .with_default_limit(ResourceLimit::new(10, Duration::from_secs(60)))
                .with_adaptive(AdaptiveConfig::default().with_min_user_reserved(1)),
        );
        let status = rl.status_with("issues", Some(Priority::User)).await.unwrap();
        let adaptive = status.adaptive.unwrap();
        assert_eq!(adaptive.capacity.user_reserved, 3);
        assert_eq!(adaptive.capacity.background_max, 7);
        assert_eq!(status.limit, 3);

        for _ in 0..7 {
            assert!(rl.can_proceed_with("issues", Some(Priority::Background)).await.unwrap());
            rl.record_with("issues", Some(Priority::Background)).await.unwrap();
        }
        assert!(!rl.can_proceed_with("issues", Some(Priority::Background)).await.unwrap());
        // User capacity is untouched by background traffic.
        assert!(rl.can_proceed_with("issues", Some(Priority::User)).await.unwrap());
    }

    #[tokio::test]
    async fn test_adaptive_classes_are_admitted_independently() {
        let rl = WindowedRateLimiter::new(
            MemoryRequestLog::new(),
            RateLimiterConfig::new()
                .with_default_limit(ResourceLimit::new(10, Duration::from_secs(60)))
                .with_adaptive(
                    AdaptiveConfig::default()
                        .with_min_user_reserved(1)
                        .with_recalculation_interval(Duration::ZERO),
                ),
        );
        let mut background = 0;
        while rl.can_proceed_with("issues", Some(Priority::Background)).await.unwrap() {
            rl.record_with("issues", Some(Priority::Background)).await.unwrap();
            background += 1;
        }
        assert_eq!(background, 7);

        // Rising user activity grows the user share past what background left over.
        let mut users = 0;
        while users < 20 && rl.can_proceed_with("issues", Some(Priority::User)).await.unwrap() {
            rl.record_with("issues", Some(Priority::User)).await.unwrap();
            users += 1;
        }
        assert!(users > 3, "user share should have grown, got {users}");
        assert!(background + users > 10);

        let status = rl.status_with("issues", Some(Priority::User)).await.unwrap();
        let adaptive = status.adaptive.unwrap();
        assert_eq!(adaptive.background_count, 7);
        assert_eq!(adaptive.user_count, users);
    }
}
