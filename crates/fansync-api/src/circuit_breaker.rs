//! Three-state circuit breaker wrapping any fallible async call.
//!
//! # State transitions
//! ```text
//! Closed   → Open:     failure_count >= failure_threshold
//! Open     → HalfOpen: cooldown elapsed since the last failure
//! HalfOpen → Closed:   half_open_attempts successful trials
//! HalfOpen → Open:     any trial failure
//! ```
//!
//! Only one trial runs at a time while half-open; concurrent callers are
//! rejected as if the circuit were still open.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Current breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit. At least 1.
    pub failure_threshold: u32,
    /// Cooldown after the last failure before a trial is allowed.
    pub timeout: Duration,
    /// Successful trials needed to close again. At least 1.
    pub half_open_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_attempts: 1,
        }
    }
}

/// Returned instead of running the call while the circuit is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit open, retry after {retry_after:?}")]
pub struct CircuitOpen {
    pub retry_after: Duration,
}

/// Serializable view for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub seconds_since_last_failure: Option<f64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_successes: u32,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            half_open_successes: 0,
            trial_in_flight: false,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let config = BreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            half_open_attempts: config.half_open_attempts.max(1),
            ..config
        };
        Self {
            config,
            inner: Mutex::new(BreakerInner::closed()),
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Run `op` through the breaker.
    ///
    /// Rejections are converted into `E` via `From<CircuitOpen>`; the
    /// error produced by `op` is recorded and then returned unchanged.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpen>,
    {
        let mut trial = self.admit()?;
        let result = op().await;
        trial.settle(result.is_ok());
        result
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Force the breaker closed with all counters zeroed.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::closed();
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_successes: inner.half_open_successes,
            seconds_since_last_failure: inner
                .last_failure
                .map(|at| at.elapsed().as_secs_f64()),
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    fn admit(&self) -> Result<Trial<'_>, CircuitOpen> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Trial::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(self.config.timeout, |at| at.elapsed());
                if elapsed < self.config.timeout {
                    return Err(CircuitOpen {
                        retry_after: self.config.timeout.saturating_sub(elapsed),
                    });
                }
                tracing::info!("circuit breaker entering half-open");
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                inner.trial_in_flight = true;
                Ok(Trial::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(CircuitOpen {
                        retry_after: Duration::ZERO,
                    });
                }
                inner.trial_in_flight = true;
                Ok(Trial::new(self, true))
            }
        }
    }

    fn on_success(&self, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_attempts {
                    tracing::info!("circuit breaker closed after successful trial");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_successes = 0;
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut BreakerInner) {
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!("circuit breaker trial failed, reopening");
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                tracing::warn!(
                    failures = inner.failure_count,
                    "circuit breaker opened"
                );
                inner.state = CircuitState::Open;
            }
            _ => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

/// Admission ticket for one call. Releases the half-open trial slot if
/// the call future is dropped before it settles.
struct Trial<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Trial<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    fn settle(&mut self, success: bool) {
        let mut inner = self.breaker.inner.lock();
        if self.probe {
            inner.trial_in_flight = false;
        }
        if success {
            self.breaker.on_success(&mut inner);
        } else {
            self.breaker.on_failure(&mut inner);
        }
        self.settled = true;
    }
}

impl Drop for Trial<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}
