//! Circuit breaker guarding a failing dependency.
//!
//! CLOSED counts consecutive failures; at the threshold it trips to OPEN and
//! short-circuits every call until the cooldown elapses. The first call after
//! the cooldown runs in HALF_OPEN: one success closes the breaker, one
//! failure reopens it. Scoped per protected resource so one instrument's
//! outage never throttles another's.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the protected operation was not attempted.
    #[error("circuit breaker '{0}' is open")]
    Open(String),
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_transition: Instant,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    /// Current state, advancing OPEN to HALF_OPEN once the cooldown elapsed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::Open && inner.last_transition.elapsed() >= self.cooldown {
            inner.state = BreakerState::HalfOpen;
            inner.last_transition = Instant::now();
        }
        inner.state
    }

    /// Runs `op` under the breaker. While OPEN, returns `BreakerError::Open`
    /// immediately without attempting the operation; the caller supplies the
    /// fallback behavior for that case.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.state() == BreakerState::Open {
            return Err(BreakerError::Open(self.name.clone()));
        }

        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != BreakerState::Closed {
            log::info!("circuit breaker '{}' closed", self.name);
            inner.last_transition = Instant::now();
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        let trip = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if trip && inner.state != BreakerState::Open {
            log::warn!(
                "circuit breaker '{}' opened after {} consecutive failures",
                self.name,
                inner.consecutive_failures
            );
            inner.state = BreakerState::Open;
            inner.last_transition = Instant::now();
        }
    }
}
