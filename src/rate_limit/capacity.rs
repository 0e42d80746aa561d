//! Dynamic split of a resource's limit between user and background traffic.
//!
//! [`CapacityCalculator::calculate`] is pure: it looks only at the activity metrics
//! it is handed and the clock value passed in.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::stores::duration_ms;

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    /// Lookback used to classify user activity.
    pub monitoring_window: Duration,
    /// User requests in the window at or above which activity is "high".
    pub high_activity_threshold: u32,
    /// User requests in the window at or above which activity is "moderate".
    pub moderate_activity_threshold: u32,
    /// Quiet period after which background traffic gets the whole limit.
    pub sustained_inactivity_threshold: Duration,
    pub min_user_reserved: u32,
    pub max_user_scaling: f64,
    pub background_pause_on_increasing_trend: bool,
    /// Minimum spacing between recalculations for one resource.
    pub recalculation_interval: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            monitoring_window: Duration::from_secs(15 * 60),
            high_activity_threshold: 10,
            moderate_activity_threshold: 3,
            sustained_inactivity_threshold: Duration::from_secs(30 * 60),
            min_user_reserved: 5,
            max_user_scaling: 2.0,
            background_pause_on_increasing_trend: true,
            recalculation_interval: Duration::from_secs(30),
        }
    }
}

impl AdaptiveConfig {
    pub fn with_monitoring_window(mut self, window: Duration) -> Self {
        self.monitoring_window = window;
        self
    }

    pub fn with_activity_thresholds(mut self, high: u32, moderate: u32) -> Self {
        self.high_activity_threshold = high.max(1);
        self.moderate_activity_threshold = moderate.min(self.high_activity_threshold);
        self
    }

    pub fn with_sustained_inactivity(mut self, threshold: Duration) -> Self {
        self.sustained_inactivity_threshold = threshold;
        self
    }

    pub fn with_min_user_reserved(mut self, reserved: u32) -> Self {
        self.min_user_reserved = reserved;
        self
    }

    pub fn with_max_user_scaling(mut self, scaling: f64) -> Self {
        self.max_user_scaling = scaling.max(1.0);
        self
    }

    pub fn with_background_pause(mut self, pause: bool) -> Self {
        self.background_pause_on_increasing_trend = pause;
        self
    }

    pub fn with_recalculation_interval(mut self, interval: Duration) -> Self {
        self.recalculation_interval = interval;
        self
    }

    /// How far back request history must be kept to evaluate the ladder.
    pub fn lookback(&self) -> Duration {
        self.monitoring_window.max(self.sustained_inactivity_threshold)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityTrend {
    Increasing,
    Stable,
    Decreasing,
    #[default]
    None,
}

/// Snapshot of recent traffic for one resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityMetrics {
    /// User request timestamps inside the monitoring window, ascending.
    pub recent_user_requests: Vec<i64>,
    pub recent_background_requests: Vec<i64>,
    pub user_activity_trend: ActivityTrend,
    pub last_user_request_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicCapacity {
    pub user_reserved: u32,
    pub background_max: u32,
    pub background_paused: bool,
    pub reason: String,
}

impl DynamicCapacity {
    /// Admission ceiling for one priority class.
    pub fn allowance(&self, background: bool) -> u32 {
        match (background, self.background_paused) {
            (false, _) => self.user_reserved,
            (true, true) => 0,
            (true, false) => self.background_max,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapacityCalculator {
    config: AdaptiveConfig,
}

impl CapacityCalculator {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Build metrics from raw timestamps, trimming them to the monitoring window.
    pub fn metrics(
        &self,
        user: &[i64],
        background: &[i64],
        last_user_request_ms: Option<i64>,
        now_ms: i64,
    ) -> ActivityMetrics {
        let since = now_ms - duration_ms(self.config.monitoring_window);
        let recent_user_requests: Vec<i64> = user.iter().copied().filter(|t| *t > since).collect();
        let recent_background_requests =
            background.iter().copied().filter(|t| *t > since).collect();
        let user_activity_trend = self.trend(&recent_user_requests, now_ms);
        ActivityMetrics {
            recent_user_requests,
            recent_background_requests,
            user_activity_trend,
            last_user_request_ms,
        }
    }

    /// Compare the newest third of the monitoring window against the third before it.
    pub fn trend(&self, timestamps: &[i64], now_ms: i64) -> ActivityTrend {
        let third = (duration_ms(self.config.monitoring_window) / 3).max(1);
        let recent_start = now_ms - third;
        let previous_start = recent_start - third;

        let recent = timestamps.iter().filter(|t| **t > recent_start).count();
        let previous = timestamps
            .iter()
            .filter(|t| **t > previous_start && **t <= recent_start)
            .count();

        match (previous, recent) {
            (0, 0) => ActivityTrend::None,
            (0, _) => ActivityTrend::Increasing,
            (p, r) if r as f64 > p as f64 * 1.5 => ActivityTrend::Increasing,
            (p, r) if (r as f64) < p as f64 * 0.5 => ActivityTrend::Decreasing,
            _ => ActivityTrend::Stable,
        }
    }

    /// Split `total_limit` according to the activity ladder.
    pub fn calculate(
        &self,
        resource: &str,
        total_limit: u32,
        metrics: &ActivityMetrics,
        now_ms: i64,
    ) -> DynamicCapacity {
        let cfg = &self.config;
        let min_reserved = cfg.min_user_reserved.min(total_limit);
        let user_count = metrics.recent_user_requests.len() as u32;
        let trend = metrics.user_activity_trend;

        let reserve = |share: f64| -> u32 {
            // Epsilon absorbs float noise such as 200 * 0.7 = 139.99...
            let share = (total_limit as f64 * share + 1e-9).floor() as u32;
            share.max(min_reserved).min(total_limit)
        };

        if total_limit == 0 {
            return DynamicCapacity {
                user_reserved: 0,
                background_max: 0,
                background_paused: false,
                reason: format!("{resource}: no capacity configured"),
            };
        }

        if user_count >= cfg.high_activity_threshold {
            let user_reserved = reserve((0.5 * cfg.max_user_scaling).min(0.9));
            let background_paused =
                cfg.background_pause_on_increasing_trend && trend == ActivityTrend::Increasing;
            return DynamicCapacity {
                user_reserved,
                background_max: total_limit - user_reserved,
                background_paused,
                reason: format!(
                    "{resource}: high user activity ({user_count} requests, trend {trend:?})"
                ),
            };
        }

        if user_count >= cfg.moderate_activity_threshold {
            let base = 1.0 + user_count as f64 / cfg.high_activity_threshold.max(1) as f64;
            let mut scaling = base.min(cfg.max_user_scaling);
            scaling *= match trend {
                ActivityTrend::Increasing => 1.2,
                ActivityTrend::Decreasing => 0.8,
                _ => 1.0,
            };
            // Never below the base share, even when activity is tailing off.
            let scaling = scaling.min(cfg.max_user_scaling).max(1.0);
            let user_reserved = reserve((0.4 * scaling).min(0.7));
            return DynamicCapacity {
                user_reserved,
                background_max: total_limit - user_reserved,
                background_paused: false,
                reason: format!(
                    "{resource}: moderate user activity ({user_count} requests, scaling {scaling:.2})"
                ),
            };
        }

        if user_count == 0 {
            if let Some(last) = metrics.last_user_request_ms {
                let idle_ms = now_ms - last;
                if idle_ms > duration_ms(cfg.sustained_inactivity_threshold) {
                    return DynamicCapacity {
                        user_reserved: 0,
                        background_max: total_limit,
                        background_paused: false,
                        reason: format!("{resource}: no user activity for {idle_ms}ms"),
                    };
                }
                return DynamicCapacity {
                    user_reserved: min_reserved,
                    background_max: total_limit - min_reserved,
                    background_paused: false,
                    reason: format!("{resource}: user activity paused for {idle_ms}ms"),
                };
            }
        }

        let user_reserved = reserve(0.3);
        DynamicCapacity {
            user_reserved,
            background_max: total_limit - user_reserved,
            background_paused: false,
            reason: format!("{resource}: low user activity, default split"),
        }
    }
}
