use crate::{Error, Result};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast until the recovery timeout elapses.
    Open,
    /// One trial call is allowed to test recovery.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set how long the breaker stays open before allowing a trial call
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

/// Three-state circuit breaker.
///
/// - Counts consecutive severe failures while closed
/// - Opens for `recovery_timeout` once the threshold is reached
/// - Half-open admits exactly one trial; its success closes, its failure reopens
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_until: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask permission for one call. Fails fast with `Error::CircuitOpen` while open.
    ///
    /// The permit should be settled with its outcome. A permit dropped unsettled
    /// (the call was cancelled) releases a half-open trial slot without changing state.
    pub fn allow(&self) -> Result<CircuitPermit<'_>> {
        let mut st = self.lock();
        let trial = match st.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let now = Instant::now();
                match st.open_until {
                    Some(until) if now < until => {
                        return Err(Error::CircuitOpen {
                            retry_in_ms: (until - now).as_millis() as u64,
                        })
                    }
                    _ => {
                        info!("circuit breaker half-open, allowing trial call");
                        st.state = CircuitState::HalfOpen;
                        st.open_until = None;
                        st.trial_in_flight = true;
                        true
                    }
                }
            }
            CircuitState::HalfOpen => {
                if st.trial_in_flight {
                    return Err(Error::CircuitOpen { retry_in_ms: 0 });
                }
                st.trial_in_flight = true;
                true
            }
        };
        Ok(CircuitPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    pub fn on_success(&self) {
        let mut st = self.lock();
        if st.state != CircuitState::Closed {
            info!("circuit breaker closed");
        }
        st.state = CircuitState::Closed;
        st.consecutive_failures = 0;
        st.open_until = None;
        st.trial_in_flight = false;
    }

    /// Record a severe failure.
    pub fn on_failure(&self) {
        let mut st = self.lock();
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        st.trial_in_flight = false;
        let reopen = st.state == CircuitState::HalfOpen
            || st.consecutive_failures >= self.cfg.failure_threshold;
        if reopen && st.state != CircuitState::Open {
            warn!(
                failures = st.consecutive_failures,
                recovery_ms = self.cfg.recovery_timeout.as_millis() as u64,
                "circuit breaker opened"
            );
        }
        if reopen {
            st.state = CircuitState::Open;
            st.open_until = Some(Instant::now() + self.cfg.recovery_timeout);
        }
    }

    /// Record a non-severe outcome: frees the half-open trial slot without changing state.
    pub fn on_neutral(&self) {
        self.lock().trial_in_flight = false;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let st = self.lock();
        let open_remaining_ms = st
            .open_until
            .filter(|until| *until > now)
            .map(|until| (until - now).as_millis() as u64);
        CircuitBreakerSnapshot {
            state: st.state,
            failure_threshold: self.cfg.failure_threshold,
            recovery_timeout_ms: self.cfg.recovery_timeout.as_millis() as u64,
            consecutive_failures: st.consecutive_failures,
            open_remaining_ms,
        }
    }
}

/// Permission for one call, returned by [`CircuitBreaker::allow`].
#[must_use = "settle the permit with the call's outcome"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// Whether this permit holds the half-open trial slot.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure();
    }

    pub fn neutral(mut self) {
        self.settled = true;
        self.breaker.on_neutral();
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            debug!("half-open trial abandoned, releasing slot");
            self.breaker.on_neutral();
        }
    }
}
