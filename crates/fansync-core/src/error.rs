// ── Core error types ──
//
// User-facing errors from fansync-core. Transport details are folded
// into a handful of variants a CLI can explain; the `From` impl below is
// the only place that looks inside `fansync_api::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Cannot reach FanSync cloud: {reason}")]
    ConnectionFailed { reason: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Not connected")]
    NotConnected,

    #[error("Too many recent failures; retry in {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Device not found: {identifier}")]
    DeviceNotFound { identifier: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Command rejected by device: {message}")]
    Rejected { message: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    // ── Wrapped API errors ───────────────────────────────────────────
    #[error("API error: {message}")]
    Api { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CoreError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }
}

impl From<fansync_api::Error> for CoreError {
    fn from(err: fansync_api::Error) -> Self {
        use fansync_api::Error as Api;
        match err {
            Api::Authentication { message } => Self::AuthenticationFailed { message },
            Api::LoginRejected { status } => Self::AuthenticationFailed {
                message: format!("WebSocket login rejected (status {status})"),
            },
            Api::Handshake { stage, message } => Self::ConnectionFailed {
                reason: format!("handshake failed during {stage}: {message}"),
            },
            Api::NoDevices => Self::DeviceNotFound {
                identifier: "<any>: no devices registered to this account".into(),
            },
            Api::NoDevice => Self::DeviceNotFound {
                identifier: "<default>".into(),
            },
            Api::Transport(ref e) if e.is_timeout() => Self::Timeout {
                operation: "session login".into(),
                timeout_ms: 0,
            },
            Api::Transport(e) => Self::ConnectionFailed {
                reason: e.to_string(),
            },
            Api::InvalidUrl(e) => Self::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::Timeout {
                operation,
                timeout_ms,
            } => Self::Timeout {
                operation,
                timeout_ms,
            },
            Api::Tls(msg) => Self::ConnectionFailed {
                reason: format!("TLS error: {msg}"),
            },
            Api::WebSocketConnect(reason) => Self::ConnectionFailed {
                reason: format!("WebSocket connection failed: {reason}"),
            },
            Api::Closed => Self::ConnectionFailed {
                reason: "WebSocket closed".into(),
            },
            Api::NotConnected => Self::NotConnected,
            Api::Rejected { request, status } => Self::Rejected {
                message: format!("{request} answered with status {status}"),
            },
            Api::Deserialization { message, body: _ } => Self::Api { message },
            Api::CircuitOpen { retry_after_ms } => Self::CircuitOpen { retry_after_ms },
        }
    }
}
