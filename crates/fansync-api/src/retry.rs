//! Declarative retry policy.
//!
//! One policy type drives the handshake retries, the one-shot resend of a
//! request whose socket turned out to be closed, the read loop's reconnect
//! backoff, and the confirmation polling in `fansync-core`.

use std::future::Future;
use std::time::Duration;

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `0` is treated as `1`.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Growth factor applied per retry. `1.0` gives a fixed delay.
    pub multiplier: f64,

    /// Spread delays by up to +-25% to avoid synchronized retries.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Fixed delay between a bounded number of attempts.
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay doubling from `initial` up to `max`.
    pub const fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: initial,
            max_delay: max,
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Enable deterministic jitter.
    pub const fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the failed attempt `retry` (0-based).
    ///
    /// `delay = min(initial * multiplier^retry, max)`, optionally with jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let secs = if self.jitter {
            // Deterministic "jitter" seeded from the retry number.
            let factor = 1.0 + 0.25 * (f64::from(retry) * 7.3).sin();
            (capped * factor).max(0.0)
        } else {
            capped.max(0.0)
        };

        Duration::from_secs_f64(secs)
    }

    /// Run `op` until it succeeds, `should_retry` rejects the error, or
    /// attempts are exhausted. The last error is returned.
    ///
    /// `op` receives the 0-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut op: F, should_retry: impl Fn(&E) -> bool) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.attempts();
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt + 1 >= attempts || !should_retry(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
