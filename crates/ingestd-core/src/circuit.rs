// ABOUTME: Three-state circuit breaker guarding calls to the storage backend.
// ABOUTME: Opens after consecutive failures, fails fast while open, and lets one trial call through at a time when half-open.

use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Failure of a guarded call: either rejected by the breaker without
/// running, or the operation's own error.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker is open")]
    Open,

    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of the breaker for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Milliseconds since the breaker last opened, while it is not closed.
    pub open_for_ms: Option<u64>,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
    total_rejections: AtomicU64,
}

/// Permission to run one guarded call. Dropping an unfinished trial
/// releases the half-open slot so a cancelled call cannot wedge the breaker.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    finished: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.finished {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner::closed()),
            total_rejections: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `operation` if the breaker allows it and record the outcome.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(mut permit) = self.acquire() else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(CircuitError::Open);
        };

        let result = operation().await;
        permit.finished = true;
        match &result {
            Ok(_) => self.on_success(permit.trial),
            Err(_) => self.on_failure(permit.trial),
        }
        result.map_err(CircuitError::Inner)
    }

    fn acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(Permit {
                breaker: self,
                trial: false,
                finished: false,
            }),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| Instant::now().duration_since(at))
                    .unwrap_or_default();
                if elapsed < self.config.timeout() {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.trial_in_flight = true;
                info!(circuit = %self.name, "circuit breaker half-open, probing");
                Some(Permit {
                    breaker: self,
                    trial: true,
                    finished: false,
                })
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                Some(Permit {
                    breaker: self,
                    trial: true,
                    finished: false,
                })
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if !trial || inner.state != CircuitState::HalfOpen {
            return;
        }
        inner.trial_in_flight = false;
        inner.consecutive_successes += 1;
        if inner.consecutive_successes >= self.config.success_threshold {
            *inner = CircuitInner::closed();
            info!(circuit = %self.name, "circuit breaker closed");
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    error!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        timeout_ms = self.config.timeout_ms,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
                inner.trial_in_flight = false;
                warn!(circuit = %self.name, "trial call failed, circuit breaker re-opened");
            }
            // A call admitted while closed finished after the breaker opened
            _ => {}
        }
    }

    /// Current state as callers would experience it: an open breaker whose
    /// timeout has elapsed reports HALF_OPEN even before the next call
    /// performs the transition.
    pub fn state(&self) -> CircuitState {
        self.effective_state(&self.lock())
    }

    fn effective_state(&self, inner: &CircuitInner) -> CircuitState {
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) if Instant::now().duration_since(at) >= self.config.timeout() => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: self.effective_state(&inner),
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            open_for_ms: match inner.state {
                CircuitState::Closed => None,
                _ => inner
                    .opened_at
                    .map(|at| Instant::now().duration_since(at).as_millis() as u64),
            },
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        *self.lock() = CircuitInner::closed();
        info!(circuit = %self.name, "circuit breaker reset");
    }
}
