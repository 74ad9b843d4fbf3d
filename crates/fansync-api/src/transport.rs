// Shared transport configuration for building the reqwest::Client
// used by the session login.
//
// Timeouts are applied per request (see `Timeouts`) so they can be
// changed at runtime without rebuilding the client.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{duration_ms, Error};

/// TLS verification mode for the HTTP session endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsMode {
    /// Use the system certificate store.
    #[default]
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate.
    DangerAcceptInvalid,
}

impl TlsMode {
    /// Map the `verify_ssl` switch used by configuration files.
    pub fn from_verify(verify_ssl: bool) -> Self {
        if verify_ssl {
            Self::System
        } else {
            Self::DangerAcceptInvalid
        }
    }

    pub fn verifies(&self) -> bool {
        !matches!(self, Self::DangerAcceptInvalid)
    }
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(concat!("fansync-rs/", env!("CARGO_PKG_VERSION")));

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }
}

// ── Runtime-adjustable timeouts ──────────────────────────────────────

/// HTTP and WebSocket timeouts shared between the client facade and
/// the background connection task.
#[derive(Debug)]
pub struct Timeouts {
    http_ms: AtomicU64,
    ws_ms: AtomicU64,
}

impl Timeouts {
    pub fn new(http: Duration, ws: Duration) -> Self {
        Self {
            http_ms: AtomicU64::new(duration_ms(http).max(1)),
            ws_ms: AtomicU64::new(duration_ms(ws).max(1)),
        }
    }

    pub fn http(&self) -> Duration {
        Duration::from_millis(self.http_ms.load(Ordering::Relaxed))
    }

    pub fn ws(&self) -> Duration {
        Duration::from_millis(self.ws_ms.load(Ordering::Relaxed))
    }

    /// Replace either timeout; `None` leaves the current value in place.
    pub fn apply(&self, http: Option<Duration>, ws: Option<Duration>) {
        if let Some(http) = http {
            self.http_ms.store(duration_ms(http).max(1), Ordering::Relaxed);
        }
        if let Some(ws) = ws {
            self.ws_ms.store(duration_ms(ws).max(1), Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_switch_maps_to_tls_mode() {
        assert_eq!(TlsMode::from_verify(true), TlsMode::System);
        assert_eq!(TlsMode::from_verify(false), TlsMode::DangerAcceptInvalid);
        assert!(!TlsMode::DangerAcceptInvalid.verifies());
    }

    #[test]
    fn apply_only_touches_given_timeouts() {
        let t = Timeouts::new(Duration::from_secs(20), Duration::from_secs(30));
        t.apply(None, Some(Duration::from_secs(5)));
        assert_eq!(t.http(), Duration::from_secs(20));
        assert_eq!(t.ws(), Duration::from_secs(5));
    }

    #[test]
    fn missing_ca_file_is_a_tls_error() {
        let config = TransportConfig {
            tls: TlsMode::CustomCa("/nonexistent/ca.pem".into()),
            ..TransportConfig::default()
        };
        assert!(matches!(config.build_client(), Err(Error::Tls(_))));
    }
}
