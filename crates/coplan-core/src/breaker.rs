//! Circuit breaker for bus publishes.
//!
//! States:
//! - **Closed**: calls go through. Failures are counted, a success resets the count.
//! - **Open**: calls are skipped without touching the network until the cooldown passes.
//! - **HalfOpen**: exactly one probe call is in flight. Success closes the
//!   circuit, failure re-opens it with a fresh cooldown.
//!
//! Every admitted call is bounded by a timeout, and a timeout counts as a failure.

use crate::clock::Clock;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub cooldown: Duration,
    /// Upper bound for a single guarded call.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            call_timeout: Duration::from_secs(3),
        }
    }
}

/// Why a guarded call did not succeed.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Circuit is open; the call was skipped.
    #[error("Circuit open, call skipped")]
    Open,

    /// The call exceeded the configured timeout.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The call itself failed.
    #[error("Call failed: {0}")]
    Inner(#[source] E),
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    next_retry: Option<Instant>,
}

enum Admission {
    Call,
    Probe,
    Reject,
}

/// A circuit breaker guarding one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                next_retry: None,
            }),
            config,
            clock,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Current consecutive failure count.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// When the next probe is allowed, if the circuit is open.
    #[must_use]
    pub fn next_retry(&self) -> Option<Instant> {
        self.lock().next_retry
    }

    /// Run `op` under breaker protection.
    ///
    /// `op` is only invoked when the call is admitted, so a skipped call does
    /// no work at all.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::Open`] when skipped, [`BreakerError::Timeout`]
    /// when the call overran, or [`BreakerError::Inner`] when it failed.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let probe = match self.admit() {
            Admission::Reject => return Err(BreakerError::Open),
            Admission::Call => false,
            Admission::Probe => true,
        };

        let mut guard = ProbeGuard {
            breaker: self,
            armed: probe,
        };

        let result = tokio::time::timeout(self.config.call_timeout, op()).await;
        guard.armed = false;

        match result {
            Ok(Ok(value)) => {
                self.record_success(probe);
                Ok(value)
            }
            Ok(Err(error)) => {
                self.record_failure(probe);
                Err(BreakerError::Inner(error))
            }
            Err(_elapsed) => {
                self.record_failure(probe);
                Err(BreakerError::Timeout(self.config.call_timeout))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Admission::Call,
            BreakerState::HalfOpen => {
                debug!("Circuit half-open, probe in flight, skipping call");
                Admission::Reject
            }
            BreakerState::Open => {
                let now = self.clock.now();
                match inner.next_retry {
                    Some(deadline) if now < deadline => {
                        debug!(
                            retry_in_ms = (deadline - now).as_millis() as u64,
                            "Circuit open, skipping call"
                        );
                        Admission::Reject
                    }
                    _ => {
                        info!("Circuit cooldown elapsed, sending probe");
                        inner.state = BreakerState::HalfOpen;
                        Admission::Probe
                    }
                }
            }
        }
    }

    fn record_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            info!("Probe succeeded, circuit closed");
            inner.state = BreakerState::Closed;
            inner.next_retry = None;
            inner.failures = 0;
        } else if inner.state == BreakerState::Closed {
            inner.failures = 0;
        }
    }

    fn record_failure(&self, probe: bool) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);

        if probe {
            warn!(
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Probe failed, circuit re-opened"
            );
            self.open(&mut inner);
        } else if inner.state == BreakerState::Closed {
            if inner.failures >= self.config.failure_threshold {
                warn!(
                    failures = inner.failures,
                    threshold = self.config.failure_threshold,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "Circuit opened"
                );
                self.open(&mut inner);
            } else {
                warn!(
                    failures = inner.failures,
                    threshold = self.config.failure_threshold,
                    "Guarded call failed"
                );
            }
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.next_retry = Some(self.clock.now() + self.config.cooldown);
    }
}

/// Re-opens the circuit if a probe is dropped before it completes.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.record_failure(true);
        }
    }
}
