use serde::Serialize;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum BreakerError<E: std::error::Error> {
    #[error("circuit open; backend call rejected")]
    Open,
    #[error(transparent)]
    Service(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    failures: u32,
    next_attempt: Instant,
    trial_in_flight: bool,
}

/// Guards calls into the queue backend. Validation and dedup failures never
/// touch this; only infrastructure failures count toward the threshold.
///
/// closed -> (failures >= threshold) -> open -> (cool-down elapsed) ->
/// half-open (exactly one trial call) -> closed on success, open again on
/// failure with a fresh cool-down.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: &'static str,
    pub failures: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failures: 0,
                next_attempt: Instant::now(),
                trial_in_flight: false,
            }),
        }
    }

    /// Runs `op` if the breaker admits the call, recording the outcome.
    /// While open and before `next_attempt`, fails immediately without
    /// invoking `op`.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(BreakerError::Open);
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Service(err))
            }
        }
    }

    fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            State::Closed => true,
            State::Open => {
                if Instant::now() >= inner.next_attempt {
                    inner.state = State::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("circuit breaker half-open; allowing one trial call");
                    true
                } else {
                    false
                }
            }
            // One trial at a time while half-open.
            State::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state != State::Closed {
            tracing::info!("circuit breaker closed");
        }
        inner.state = State::Closed;
        inner.failures = 0;
        inner.trial_in_flight = false;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.trial_in_flight = false;
        match inner.state {
            State::HalfOpen => {
                inner.state = State::Open;
                inner.next_attempt = Instant::now() + self.cooldown;
                tracing::warn!("circuit breaker re-opened after failed trial");
            }
            State::Closed => {
                inner.failures += 1;
                if inner.failures >= self.threshold {
                    inner.state = State::Open;
                    inner.next_attempt = Instant::now() + self.cooldown;
                    tracing::warn!(
                        failures = inner.failures,
                        cooldown_secs = self.cooldown.as_secs(),
                        "circuit breaker opened"
                    );
                }
            }
            State::Open => {}
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let state = match inner.state {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        };
        BreakerSnapshot {
            state,
            failures: inner.failures,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}
