//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and a stable exit code each.

use miette::Diagnostic;
use thiserror::Error;

use fansync_config::ConfigError;
use fansync_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach the FanSync cloud")]
    #[diagnostic(
        code(fansync::connection_failed),
        help(
            "{reason}\n\
             Check your network connection, or point session_url / ws_url at a reachable relay."
        )
    )]
    ConnectionFailed { reason: String },

    #[error("Connection is not established")]
    #[diagnostic(code(fansync::not_connected))]
    NotConnected,

    #[error("Too many recent failures")]
    #[diagnostic(
        code(fansync::circuit_open),
        help("Requests are paused after repeated failures. Retry in {retry_after_ms}ms.")
    )]
    CircuitOpen { retry_after_ms: u64 },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(fansync::auth_failed),
        help("Verify the email and password of the profile in use.")
    )]
    AuthFailed { message: String },

    #[error("No credentials configured for profile '{profile}'")]
    #[diagnostic(
        code(fansync::no_credentials),
        help(
            "Set FANSYNC_EMAIL and FANSYNC_PASSWORD, or add email and password_env\n\
             to the profile in {path}"
        )
    )]
    NoCredentials { profile: String, path: String },

    // ── Resources ────────────────────────────────────────────────────
    #[error("Device '{identifier}' not found")]
    #[diagnostic(
        code(fansync::not_found),
        help("Run: fansync devices to see available devices")
    )]
    DeviceNotFound { identifier: String },

    // ── Device ───────────────────────────────────────────────────────
    #[error("Command rejected: {message}")]
    #[diagnostic(code(fansync::rejected))]
    Rejected { message: String },

    #[error("API error: {message}")]
    #[diagnostic(code(fansync::api_error))]
    Api { message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(fansync::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(fansync::profile_not_found),
        help("Available profiles: {available}")
    )]
    ProfileNotFound { name: String, available: String },

    #[error("Configuration error: {message}")]
    #[diagnostic(code(fansync::config))]
    Config { message: String },

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("{operation} timed out after {timeout_ms}ms")]
    #[diagnostic(
        code(fansync::timeout),
        help("Increase the timeout with --ws-timeout / --http-timeout.")
    )]
    Timeout { operation: String, timeout_ms: u64 },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render JSON: {0}")]
    #[diagnostic(code(fansync::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::NotConnected | Self::CircuitOpen { .. } => {
                exit_code::CONNECTION
            }
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::DeviceNotFound { .. } => exit_code::NOT_FOUND,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::ProfileNotFound { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::AuthenticationFailed { message } => Self::AuthFailed { message },
            CoreError::ConnectionFailed { reason } => Self::ConnectionFailed { reason },
            CoreError::Timeout {
                operation,
                timeout_ms,
            } => Self::Timeout {
                operation,
                timeout_ms,
            },
            CoreError::NotConnected => Self::NotConnected,
            CoreError::CircuitOpen { retry_after_ms } => Self::CircuitOpen { retry_after_ms },
            CoreError::DeviceNotFound { identifier } => Self::DeviceNotFound { identifier },
            CoreError::Rejected { message } => Self::Rejected { message },
            CoreError::Validation { message } => Self::Validation {
                field: "input".into(),
                reason: message,
            },
            CoreError::Api { message } => Self::Api { message },
            CoreError::Config { message } => Self::Config { message },
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoCredentials { profile } => Self::NoCredentials {
                profile,
                path: fansync_config::config_path().display().to_string(),
            },
            ConfigError::UnknownProfile { profile } => Self::ProfileNotFound {
                name: profile,
                available: "(none)".into(),
            },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_distinct_exit_codes() {
        let auth: CliError = CoreError::AuthenticationFailed {
            message: "bad password".into(),
        }
        .into();
        assert_eq!(auth.exit_code(), exit_code::AUTH);

        let missing: CliError = CoreError::DeviceNotFound {
            identifier: "dev-9".into(),
        }
        .into();
        assert_eq!(missing.exit_code(), exit_code::NOT_FOUND);

        let slow: CliError = CoreError::Timeout {
            operation: "set".into(),
            timeout_ms: 30_000,
        }
        .into();
        assert_eq!(slow.exit_code(), exit_code::TIMEOUT);

        let open: CliError = CoreError::CircuitOpen { retry_after_ms: 10 }.into();
        assert_eq!(open.exit_code(), exit_code::CONNECTION);

        let rejected: CliError = CoreError::Rejected {
            message: "nope".into(),
        }
        .into();
        assert_eq!(rejected.exit_code(), exit_code::GENERAL);
    }

    #[test]
    fn missing_credentials_is_an_auth_failure() {
        let err: CliError = ConfigError::NoCredentials {
            profile: "home".into(),
        }
        .into();
        assert_eq!(err.exit_code(), exit_code::AUTH);
        assert!(err.to_string().contains("home"));
    }
}
