// ── Runtime controller configuration ──
//
// Everything the controller needs to run. Carries credentials and
// tuning but never touches disk; `fansync-config` builds one from the
// config file and environment.

use std::time::Duration;

use fansync_api::{ClientConfig, Credentials, RetryPolicy};

/// How long an optimistic value holds without confirmation.
pub const DEFAULT_GUARD_WINDOW: Duration = Duration::from_secs(12);

/// Polls after a write whose ack carried no confirming status.
pub const DEFAULT_CONFIRM_POLICY: RetryPolicy =
    RetryPolicy::fixed(20, Duration::from_millis(250));

pub const DEFAULT_FALLBACK_POLL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub credentials: Credentials,
    pub client: ClientConfig,

    pub guard_window: Duration,

    /// Active polling after a write, tried before falling back to the
    /// guard window.
    pub confirm: RetryPolicy,

    /// Periodic refresh of every device. `None` relies on pushes alone.
    pub fallback_poll: Option<Duration>,
}

impl ControllerConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            client: ClientConfig::default(),
            guard_window: DEFAULT_GUARD_WINDOW,
            confirm: DEFAULT_CONFIRM_POLICY,
            fallback_poll: Some(DEFAULT_FALLBACK_POLL),
        }
    }
}
