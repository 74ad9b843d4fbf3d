use std::time::Duration;

use thiserror::Error;

use crate::circuit_breaker::CircuitOpen;

/// Stage of the WebSocket handshake that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum HandshakeStage {
    Connect,
    Login,
    DeviceList,
}

/// Top-level error type for the `fansync-api` crate.
///
/// Covers every failure mode of the cloud relay: HTTP session login,
/// the WebSocket handshake, request/response transport, and the
/// circuit breaker gate. `fansync-core` maps these into user-facing
/// diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Session login failed (wrong credentials, account locked, no token).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Handshake ───────────────────────────────────────────────────
    /// The WebSocket login frame was answered with a non-ok status.
    #[error("WebSocket login rejected (status {status})")]
    LoginRejected { status: String },

    /// The handshake could not be completed after all retries.
    #[error("Handshake failed during {stage}: {message}")]
    Handshake {
        stage: HandshakeStage,
        message: String,
    },

    /// The account's device list is empty.
    #[error("No devices registered to this account")]
    NoDevices,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A bounded wait elapsed.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// The socket was closed while a request was using it.
    #[error("WebSocket closed")]
    Closed,

    /// No session is established.
    #[error("Not connected")]
    NotConnected,

    // ── Protocol ────────────────────────────────────────────────────
    /// The server answered a request with a non-ok status.
    #[error("{request} request rejected by server (status {status})")]
    Rejected { request: String, status: String },

    /// No device id was given and none is known from the device list.
    #[error("No device id available")]
    NoDevice,

    // ── Data ────────────────────────────────────────────────────────
    /// JSON (de)serialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Circuit breaker ─────────────────────────────────────────────
    /// Calls are short-circuited until the cooldown elapses.
    #[error("Circuit open -- retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },
}

impl Error {
    pub(crate) fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: duration_ms(timeout),
        }
    }

    /// Returns `true` if re-authenticating might resolve this error.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::LoginRejected { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::WebSocketConnect(_) | Self::Closed | Self::NoDevices => {
                true
            }
            _ => false,
        }
    }

    /// Returns `true` if the socket is known to be unusable.
    pub fn is_socket_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::NotConnected | Self::WebSocketConnect(_))
    }

    /// Returns `true` for a bounded-wait expiry.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Short, stable name of the variant for diagnostics records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "authentication",
            Self::LoginRejected { .. } => "login_rejected",
            Self::Handshake { .. } => "handshake",
            Self::NoDevices => "no_devices",
            Self::Transport(_) => "transport",
            Self::InvalidUrl(_) => "invalid_url",
            Self::Timeout { .. } => "timeout",
            Self::Tls(_) => "tls",
            Self::WebSocketConnect(_) => "websocket_connect",
            Self::Closed => "closed",
            Self::NotConnected => "not_connected",
            Self::Rejected { .. } => "rejected",
            Self::NoDevice => "no_device",
            Self::Deserialization { .. } => "deserialization",
            Self::CircuitOpen { .. } => "circuit_open",
        }
    }
}

impl From<CircuitOpen> for Error {
    fn from(open: CircuitOpen) -> Self {
        Self::CircuitOpen {
            retry_after_ms: duration_ms(open.retry_after),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            WsError::Io(ref io) if io.kind() == std::io::ErrorKind::BrokenPipe => Self::Closed,
            other => Self::WebSocketConnect(other.to_string()),
        }
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
