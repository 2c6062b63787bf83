use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Suppresses health-driven actions after a failure streak, retrying
/// gradually via HALF_OPEN (§4.11). Background reconnection work in the
/// connection pool continues regardless of circuit state — only
/// scheduled health checks are gated.
pub struct CircuitBreaker {
    failure_threshold: u32,
    timeout: Duration,
    half_open_max_calls: u32,

    state: AtomicU32,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    opened_at_millis: AtomicU64,
}

fn state_tag(state: CircuitState) -> u32 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::Open => 1,
        CircuitState::HalfOpen => 2,
    }
}

fn state_from_tag(tag: u32) -> CircuitState {
    match tag {
        0 => CircuitState::Closed,
        1 => CircuitState::Open,
        _ => CircuitState::HalfOpen,
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold,
            timeout,
            half_open_max_calls,
            state: AtomicU32::new(state_tag(CircuitState::Closed)),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        state_from_tag(self.state.load(Ordering::Acquire))
    }

    /// Call before running a scheduled health check. `OPEN` transitions
    /// to `HALF_OPEN` automatically once `timeout` has elapsed; while
    /// still `OPEN`, the caller should skip the check entirely.
    pub fn allow_check(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.opened_at_millis.load(Ordering::Acquire);
                let elapsed = now_millis().saturating_sub(opened_at);
                if elapsed >= self.timeout.as_millis() as u64 {
                    self.transition_to(CircuitState::HalfOpen);
                    info!("circuit breaker transitioning OPEN -> HALF_OPEN");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.half_open_max_calls {
                    self.transition_to(CircuitState::Closed);
                    info!("circuit breaker transitioning HALF_OPEN -> CLOSED");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.failure_threshold {
                    self.transition_to(CircuitState::Open);
                    warn!(failures, "circuit breaker transitioning CLOSED -> OPEN");
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to(CircuitState::Open);
                warn!("circuit breaker transitioning HALF_OPEN -> OPEN on failure");
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to(&self, state: CircuitState) {
        if state == CircuitState::Open {
            self.opened_at_millis.store(now_millis(), Ordering::Release);
        }
        if state == CircuitState::HalfOpen {
            self.half_open_successes.store(0, Ordering::Release);
        }
        if state == CircuitState::Closed {
            self.consecutive_failures.store(0, Ordering::Release);
        }
        self.state.store(state_tag(state), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_consecutive_failures() {
        let cb = CircuitBreaker::new(5, Duration::from_secs(60), 3);
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn stays_open_before_timeout_elapses() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(60), 3);
        cb.record_failure();
        assert!(!cb.allow_check());
    }

    #[test]
    fn half_open_closes_after_enough_successes() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(0), 2);
        cb.record_failure();
        assert!(cb.allow_check());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn any_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(0), 3);
        cb.record_failure();
        cb.allow_check();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
