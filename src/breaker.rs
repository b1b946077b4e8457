#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Per-endpoint failure guard: `closed -> open -> half_open -> closed`.
///
/// Transitions are serialized behind one mutex per endpoint so concurrent
/// callers can never apply conflicting transitions; reads are point-in-time
/// snapshots.
#[derive(Clone, Copy, Debug)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Error)]
#[error("circuit for endpoint `{endpoint}` is open; retry after {retry_after:?}")]
pub struct CircuitOpen {
    pub endpoint: String,
    pub retry_after: Duration,
}

#[derive(Debug)]
enum Inner {
    Closed {
        consecutive_failures: u32,
    },
    Open {
        since: Instant,
    },
    HalfOpen {
        admitted: u32,
        successes: u32,
    },
}

pub struct CircuitBreaker {
    endpoint: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            endpoint: endpoint.into(),
            settings,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        match &*self.inner.lock().expect("breaker state") {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Asks to place one call through the breaker. An `Err` means the call
    /// must be short-circuited without attempting delivery.
    pub fn try_admit(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().expect("breaker state");
        match &mut *inner {
            Inner::Closed { .. } => Ok(()),
            Inner::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.settings.recovery_timeout {
                    *inner = Inner::HalfOpen {
                        admitted: 1,
                        successes: 0,
                    };
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        endpoint: self.endpoint.clone(),
                        retry_after: self.settings.recovery_timeout - elapsed,
                    })
                }
            }
            Inner::HalfOpen { admitted, .. } => {
                if *admitted < self.settings.half_open_max_calls {
                    *admitted += 1;
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        endpoint: self.endpoint.clone(),
                        retry_after: self.settings.recovery_timeout,
                    })
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker state");
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
            } => *consecutive_failures = 0,
            Inner::HalfOpen {
                admitted: _,
                successes,
            } => {
                *successes += 1;
                if *successes >= self.settings.half_open_max_calls {
                    *inner = Inner::Closed {
                        consecutive_failures: 0,
                    };
                }
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker state");
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.settings.failure_threshold {
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                }
            }
            // Any trial failure reopens immediately.
            Inner::HalfOpen { .. } => {
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }
}

/// One breaker per endpoint, created on first use.
#[derive(Clone, Default)]
pub struct BreakerBoard {
    settings: BreakerSettings,
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl BreakerBoard {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Arc::default(),
        }
    }

    pub fn breaker(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("breaker board");
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.settings)))
            .clone()
    }

    pub fn state(&self, endpoint: &str) -> Option<BreakerState> {
        self.breakers
            .lock()
            .expect("breaker board")
            .get(endpoint)
            .map(|breaker| breaker.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
            half_open_max_calls: 1,
        }
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("svc", settings());
        for _ in 0..2 {
            breaker.try_admit().expect("closed");
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.try_admit().expect("still closed");
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_admit().is_err());
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let breaker = CircuitBreaker::new("svc", settings());
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_bounded_trials_then_closes() {
        let breaker = CircuitBreaker::new("svc", settings());
        for _ in 0..3 {
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        breaker.try_admit().expect("trial call admitted");
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Only one trial is allowed before the breaker commits.
        assert!(breaker.try_admit().is_err());

        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn trial_failure_reopens() {
        let breaker = CircuitBreaker::new("svc", settings());
        for _ in 0..3 {
            breaker.on_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        breaker.try_admit().expect("trial call admitted");
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
