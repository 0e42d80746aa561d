//! Resilience primitives used around the remote table.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Closed / open / half-open breaker counting severe failures |
//! | [`retry`] | Exponential backoff with jitter |
//!
//! ```rust
//! use comic_vine::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new()
//!         .enabled(true)
//!         .with_failure_threshold(3)
//!         .with_recovery_timeout(Duration::from_secs(30)),
//! );
//! if let Ok(permit) = breaker.allow() {
//!     // call the backend...
//!     permit.success();
//! };
//! ```

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitPermit, CircuitState,
};
pub use retry::RetryPolicy;
