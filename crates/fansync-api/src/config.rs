// ── Client tuning ──
//
// Endpoints, timeouts, and retry knobs for one `Client`. Built by the
// caller; this crate never reads configuration files.

use std::time::Duration;

use url::Url;

use crate::circuit_breaker::BreakerConfig;
use crate::metrics::DEFAULT_MAX_LATENCY_SAMPLES;
use crate::retry::RetryPolicy;
use crate::transport::TlsMode;

pub const DEFAULT_SESSION_URL: &str = "https://fanimation.apps.exosite.io/api:1/session";
pub const DEFAULT_WS_URL: &str = "wss://fanimation.apps.exosite.io/api:1/phone";

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_WS_TIMEOUT: Duration = Duration::from_secs(30);

/// Round-trips slower than this are logged as a warning.
pub const SLOW_RESPONSE_WARNING: Duration = Duration::from_secs(5);
/// Full connects slower than this are logged as a warning.
pub const SLOW_CONNECTION_WARNING: Duration = Duration::from_secs(10);
/// Every Nth push frame logs a heartbeat summary.
pub const PUSH_LOG_EVERY: u64 = 100;

/// Login credentials for the session endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: secrecy::SecretString,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP session (login) endpoint.
    pub session_url: Url,
    /// WebSocket RPC endpoint.
    pub ws_url: Url,
    /// TLS verification for the session endpoint.
    pub tls: TlsMode,
    /// Per-request timeout of the session login.
    pub http_timeout: Duration,
    /// Bound on every WebSocket wait (connect, ack, idle read).
    pub ws_timeout: Duration,
    /// Deliver unsolicited status frames to the push callback.
    pub enable_push: bool,
    /// Attempts for connect + login + device list.
    pub handshake_retry: RetryPolicy,
    /// Backoff between read-loop reconnect attempts.
    pub reconnect_backoff: RetryPolicy,
    /// Resend policy for a request whose socket turned out closed.
    pub resend: RetryPolicy,
    /// Consecutive idle read timeouts before the socket is replaced.
    pub timeouts_before_reconnect: u32,
    pub breaker: BreakerConfig,
    pub max_latency_samples: usize,
    /// Bound of the queue between the reader and the push consumer.
    pub push_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session_url: Url::parse(DEFAULT_SESSION_URL).expect("default session URL is valid"),
            ws_url: Url::parse(DEFAULT_WS_URL).expect("default WebSocket URL is valid"),
            tls: TlsMode::System,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            ws_timeout: DEFAULT_WS_TIMEOUT,
            enable_push: true,
            handshake_retry: RetryPolicy::fixed(2, Duration::from_secs(1)),
            reconnect_backoff: RetryPolicy::exponential(
                u32::MAX,
                Duration::from_millis(500),
                Duration::from_secs(5),
            ),
            resend: RetryPolicy::fixed(2, Duration::ZERO),
            timeouts_before_reconnect: 3,
            breaker: BreakerConfig::default(),
            max_latency_samples: DEFAULT_MAX_LATENCY_SAMPLES,
            push_queue_capacity: 256,
        }
    }
}
