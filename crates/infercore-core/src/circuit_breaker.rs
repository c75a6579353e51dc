//! Circuit breaker. Per-runner CLOSED/OPEN/HALF_OPEN state
//! machine guarding the orchestrator's retry loop.
//!
//! An explicit state machine guarded by one lock rather than scattered
//! atomics, matching the state-enum-plus-counter bookkeeping used for
//! health/slot tracking elsewhere in this crate.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::ResilienceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// One breaker per runner. Transitions:
/// CLOSED -[consecutive_failures >= failure_threshold]-> OPEN
/// OPEN -[reset_timeout_secs elapsed]-> HALF_OPEN (on next probe attempt)
/// HALF_OPEN -[consecutive_successes >= success_threshold]-> CLOSED
/// HALF_OPEN -[any failure]-> OPEN
pub struct CircuitBreaker {
    config: ResilienceConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner { state: CircuitState::Closed, consecutive_failures: 0, consecutive_successes: 0, opened_at: None }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call is currently allowed through. OPEN transitions
    /// itself to HALF_OPEN here once the reset timeout has elapsed, so
    /// the very next `allow()` call both performs the transition and
    /// admits the probe request.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let reset_after = Duration::from_secs(self.config.reset_timeout_secs);
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= reset_after {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ResilienceConfig {
        ResilienceConfig { max_attempts: 3, backoff_base_ms: 1, failure_threshold: 2, reset_timeout_secs: 0, success_threshold: 2 }
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(cfg());
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(cfg());
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new(cfg());
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow()); // reset_timeout_secs = 0, transitions to half-open
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(cfg());
        breaker.on_failure();
        breaker.on_failure();
        breaker.allow();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
