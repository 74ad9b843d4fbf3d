// fansync-api: Async Rust client for the FanSync ceiling-fan cloud relay.
//
// An HTTP session login yields a token; a single WebSocket then carries
// login, device enumeration, get/set requests, and unsolicited status
// pushes. `Client` owns the whole connection lifecycle.

pub mod auth;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod correlator;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod retry;
pub mod transport;

mod recv_loop;
mod session;

// ── Primary re-exports ──────────────────────────────────────────────
pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitOpen, CircuitState};
pub use client::{Client, ConnectionState, PushCallback, PushSource, PushUpdate};
pub use config::{ClientConfig, Credentials};
pub use device::{DeviceInfo, DeviceProfile};
pub use diagnostics::{DiagnosticsSnapshot, TokenMetadata};
pub use error::{Error, HandshakeStage};
pub use metrics::{ConnectionMetrics, MetricsSnapshot};
pub use protocol::Status;
pub use retry::RetryPolicy;
pub use session::ConnectTiming;
pub use transport::TlsMode;
