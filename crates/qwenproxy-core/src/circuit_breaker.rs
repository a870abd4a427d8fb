use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
    half_open_tries: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub half_open_max_tries: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_tries: 3,
        }
    }
}

/// Guards admission into the streaming path. A single atomic-ish state word
/// (behind a short-held mutex) plus counters; admission is effectively a
/// compare-and-set on the state transition.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                last_success_time: None,
                half_open_tries: 0,
            }),
        }
    }

    /// Returns whether the request is admitted. Transitions `Open ->
    /// HalfOpen` when the reset timeout has lapsed, as a side effect of the
    /// admission check.
    pub fn try_admit(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed_enough = inner
                    .last_failure_time
                    .is_none_or(|last| last.elapsed() >= self.config.reset_timeout);
                if elapsed_enough {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_tries = 0;
                    inner.success_count = 0;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_tries < self.config.half_open_max_tries {
                    inner.half_open_tries += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.last_success_time = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_tries {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.max_failures {
                    inner.state = BreakerState::Open;
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.failure_count = self.config.max_failures;
                inner.success_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("circuit breaker lock poisoned").state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(max_failures: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            max_failures,
            reset_timeout: Duration::from_millis(20),
            half_open_max_tries: 3,
        })
    }

    #[test]
    fn trips_open_after_max_failures() {
        let cb = breaker(3);
        for _ in 0..3 {
            assert!(cb.try_admit());
            cb.record_failure();
        }
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.try_admit());
    }

    #[test]
    fn closed_success_resets_failure_count() {
        let cb = breaker(3);
        assert!(cb.try_admit());
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_reset_timeout_then_closes_on_successes() {
        let cb = breaker(1);
        assert!(cb.try_admit());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.try_admit());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let cb = breaker(1);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.try_admit());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_admits_at_most_max_tries_concurrently() {
        let cb = breaker(1);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert!(cb.try_admit());
        assert!(cb.try_admit());
        assert!(cb.try_admit());
        assert!(!cb.try_admit());
    }
}
