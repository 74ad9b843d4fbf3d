//! Connection quality counters and a bounded latency window.
//!
//! Counters only ever grow; rates and latency aggregates are computed
//! on read from the current window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

pub const DEFAULT_MAX_LATENCY_SAMPLES: usize = 20;

/// Timeout share above which the user should be warned.
const WARN_TIMEOUT_RATE: f64 = 0.3;
/// Average latency above which the user should be warned.
const WARN_AVG_LATENCY_MS: f64 = 5000.0;

/// Metrics shared between the client facade and the connection task.
pub type SharedMetrics = Arc<Mutex<ConnectionMetrics>>;

#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub total_commands: u64,
    pub failed_commands: u64,
    pub timed_out_commands: u64,
    pub websocket_reconnects: u64,
    pub websocket_errors: u64,
    pub push_updates_received: u64,
    pub token_refreshes: u64,
    pub is_connected: bool,
    pub consecutive_failures: u32,
    recent_latencies: VecDeque<f64>,
    max_latency_samples: usize,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LATENCY_SAMPLES)
    }
}

impl ConnectionMetrics {
    pub fn new(max_latency_samples: usize) -> Self {
        let max_latency_samples = max_latency_samples.max(1);
        Self {
            total_commands: 0,
            failed_commands: 0,
            timed_out_commands: 0,
            websocket_reconnects: 0,
            websocket_errors: 0,
            push_updates_received: 0,
            token_refreshes: 0,
            is_connected: false,
            consecutive_failures: 0,
            recent_latencies: VecDeque::with_capacity(max_latency_samples),
            max_latency_samples,
        }
    }

    pub fn shared(max_latency_samples: usize) -> SharedMetrics {
        Arc::new(Mutex::new(Self::new(max_latency_samples)))
    }

    // ── Recording ────────────────────────────────────────────────────

    pub fn record_command(&mut self, success: bool, latency: Option<Duration>) {
        self.total_commands += 1;
        if success {
            self.consecutive_failures = 0;
        } else {
            self.failed_commands += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        if let Some(latency) = latency {
            self.push_latency(millis_f64(latency));
        }
    }

    /// A command that hit its response deadline. Counts as a failure too.
    pub fn record_timeout(&mut self, latency: Option<Duration>) {
        self.timed_out_commands += 1;
        self.record_command(false, latency);
    }

    pub fn record_reconnect(&mut self) {
        self.websocket_reconnects += 1;
    }

    pub fn record_websocket_error(&mut self) {
        self.websocket_errors += 1;
    }

    pub fn record_push_update(&mut self) {
        self.push_updates_received += 1;
    }

    pub fn record_token_refresh(&mut self) {
        self.token_refreshes += 1;
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.is_connected = connected;
    }

    fn push_latency(&mut self, ms: f64) {
        while self.recent_latencies.len() >= self.max_latency_samples {
            self.recent_latencies.pop_front();
        }
        self.recent_latencies.push_back(ms);
    }

    // ── Computed on read ─────────────────────────────────────────────

    pub fn latencies(&self) -> impl Iterator<Item = f64> + '_ {
        self.recent_latencies.iter().copied()
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.recent_latencies.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.recent_latencies.iter().sum();
        sum / count_f64(self.recent_latencies.len())
    }

    pub fn max_latency_ms(&self) -> f64 {
        self.recent_latencies.iter().copied().fold(0.0, f64::max)
    }

    pub fn failure_rate(&self) -> f64 {
        ratio(self.failed_commands, self.total_commands)
    }

    pub fn timeout_rate(&self) -> f64 {
        ratio(self.timed_out_commands, self.total_commands)
    }

    /// Whether connection quality is poor enough to surface to a user.
    pub fn should_warn_user(&self) -> bool {
        self.timeout_rate() > WARN_TIMEOUT_RATE || self.avg_latency_ms() > WARN_AVG_LATENCY_MS
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_commands: self.total_commands,
            failed_commands: self.failed_commands,
            timed_out_commands: self.timed_out_commands,
            failure_rate: round_to(self.failure_rate(), 3),
            timeout_rate: round_to(self.timeout_rate(), 3),
            avg_latency_ms: round_to(self.avg_latency_ms(), 1),
            max_latency_ms: round_to(self.max_latency_ms(), 1),
            latency_samples: self.recent_latencies.len(),
            websocket_reconnects: self.websocket_reconnects,
            websocket_errors: self.websocket_errors,
            push_updates_received: self.push_updates_received,
            token_refreshes: self.token_refreshes,
            is_connected: self.is_connected,
            consecutive_failures: self.consecutive_failures,
            should_warn_user: self.should_warn_user(),
        }
    }
}

/// Rounded, serializable view of [`ConnectionMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_commands: u64,
    pub failed_commands: u64,
    pub timed_out_commands: u64,
    pub failure_rate: f64,
    pub timeout_rate: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub latency_samples: usize,
    pub websocket_reconnects: u64,
    pub websocket_errors: u64,
    pub push_updates_received: u64,
    pub token_refreshes: u64,
    pub is_connected: bool,
    pub consecutive_failures: u32,
    pub should_warn_user: bool,
}

#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub(crate) fn millis_f64(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn count_f64(n: usize) -> f64 {
    n as f64
}

#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10_f64.powi(places);
    (value * factor).round() / factor
}
