//! Shared configuration for FanSync tools.
//!
//! TOML profiles, credential resolution (env + plaintext), and
//! translation to `fansync_core::ControllerConfig`. Loading only:
//! nothing here writes credentials back to disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use fansync_core::{ClientConfig, ControllerConfig, Credentials, RetryPolicy, TlsMode};

/// Environment prefix for every override.
pub const ENV_PREFIX: &str = "FANSYNC_";
pub const PASSWORD_ENV: &str = "FANSYNC_PASSWORD";
pub const EMAIL_ENV: &str = "FANSYNC_EMAIL";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no credentials configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("profile '{profile}' not found")]
    UnknownProfile { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named account profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_true")]
    pub verify_ssl: bool,

    /// Seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,

    /// Seconds.
    #[serde(default = "default_ws_timeout")]
    pub ws_timeout: u64,

    #[serde(default = "default_true")]
    pub enable_push: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            verify_ssl: true,
            http_timeout: default_http_timeout(),
            ws_timeout: default_ws_timeout(),
            enable_push: true,
        }
    }
}

fn default_output() -> String {
    "table".into()
}
fn default_true() -> bool {
    true
}
fn default_http_timeout() -> u64 {
    20
}
fn default_ws_timeout() -> u64 {
    30
}

/// A named FanSync account.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Profile {
    pub email: Option<String>,

    /// Password in plaintext. Prefer `password_env`.
    pub password: Option<String>,

    /// Name of an environment variable holding the password.
    pub password_env: Option<String>,

    /// Session endpoint override.
    pub session_url: Option<String>,

    /// WebSocket endpoint override.
    pub ws_url: Option<String>,

    pub verify_ssl: Option<bool>,

    /// PEM file with an extra CA for the session endpoint.
    pub ca_cert: Option<PathBuf>,

    /// Seconds.
    pub http_timeout: Option<u64>,

    /// Seconds.
    pub ws_timeout: Option<u64>,

    pub enable_push: Option<bool>,

    /// Seconds optimistic values hold without confirmation.
    pub guard_window: Option<u64>,

    pub confirm_attempts: Option<u32>,

    pub confirm_delay_ms: Option<u64>,

    /// Seconds between background refreshes; `0` disables them.
    pub fallback_poll: Option<u64>,
}

impl Config {
    /// Profile `name`, or the default profile.
    ///
    /// When no profile is named and none is configured, an empty profile
    /// is returned so credentials can come from the environment alone.
    pub fn profile(&self, name: Option<&str>) -> Result<(String, Profile), ConfigError> {
        let default_name = self.default_profile.as_deref().unwrap_or("default");
        let profile_name = name.unwrap_or(default_name);
        match self.profiles.get(profile_name) {
            Some(profile) => Ok((profile_name.to_owned(), profile.clone())),
            None if name.is_none() => Ok((profile_name.to_owned(), Profile::default())),
            None => Err(ConfigError::UnknownProfile {
                profile: profile_name.to_owned(),
            }),
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "fansync", "fansync").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("fansync");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` merged with `FANSYNC_`-prefixed environment variables.
///
/// Nested keys use a double underscore, e.g.
/// `FANSYNC_DEFAULTS__WS_TIMEOUT=10`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if loading fails.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve credentials from the process environment and the profile.
pub fn resolve_credentials(profile: &Profile, profile_name: &str) -> Result<Credentials, ConfigError> {
    resolve_credentials_with(profile, profile_name, |name| std::env::var(name).ok())
}

/// Like [`resolve_credentials`] with an explicit environment lookup.
///
/// Email: profile, then `FANSYNC_EMAIL`. Password: the variable named by
/// `password_env`, then `FANSYNC_PASSWORD`, then plaintext.
pub fn resolve_credentials_with(
    profile: &Profile,
    profile_name: &str,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Credentials, ConfigError> {
    let no_credentials = || ConfigError::NoCredentials {
        profile: profile_name.into(),
    };

    let email = profile
        .email
        .clone()
        .or_else(|| env(EMAIL_ENV))
        .filter(|e| !e.is_empty())
        .ok_or_else(no_credentials)?;

    let password = profile
        .password_env
        .as_deref()
        .and_then(&env)
        .or_else(|| env(PASSWORD_ENV))
        .or_else(|| profile.password.clone())
        .filter(|p| !p.is_empty())
        .ok_or_else(no_credentials)?;

    Ok(Credentials {
        email,
        password: SecretString::from(password),
    })
}

fn parse_url(field: &str, raw: &str) -> Result<Url, ConfigError> {
    raw.parse().map_err(|e| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL '{raw}': {e}"),
    })
}

/// Build a `ControllerConfig` from a profile and the global defaults.
pub fn profile_to_controller_config(
    profile: &Profile,
    profile_name: &str,
    defaults: &Defaults,
) -> Result<ControllerConfig, ConfigError> {
    let credentials = resolve_credentials(profile, profile_name)?;
    build_controller_config(profile, defaults, credentials)
}

/// Build a `ControllerConfig` around already-resolved credentials.
pub fn build_controller_config(
    profile: &Profile,
    defaults: &Defaults,
    credentials: Credentials,
) -> Result<ControllerConfig, ConfigError> {
    let mut client = ClientConfig::default();
    if let Some(raw) = &profile.session_url {
        client.session_url = parse_url("session_url", raw)?;
    }
    if let Some(raw) = &profile.ws_url {
        client.ws_url = parse_url("ws_url", raw)?;
    }

    client.tls = match (&profile.ca_cert, profile.verify_ssl.unwrap_or(defaults.verify_ssl)) {
        (_, false) => TlsMode::DangerAcceptInvalid,
        (Some(ca), true) => TlsMode::CustomCa(ca.clone()),
        (None, true) => TlsMode::System,
    };

    let ws_timeout = profile.ws_timeout.unwrap_or(defaults.ws_timeout);
    if ws_timeout == 0 {
        return Err(ConfigError::Validation {
            field: "ws_timeout".into(),
            reason: "must be at least 1 second".into(),
        });
    }
    client.http_timeout = Duration::from_secs(profile.http_timeout.unwrap_or(defaults.http_timeout).max(1));
    client.ws_timeout = Duration::from_secs(ws_timeout);
    client.enable_push = profile.enable_push.unwrap_or(defaults.enable_push);

    let mut config = ControllerConfig::new(credentials);
    config.client = client;
    if let Some(secs) = profile.guard_window {
        config.guard_window = Duration::from_secs(secs);
    }
    if profile.confirm_attempts.is_some() || profile.confirm_delay_ms.is_some() {
        config.confirm = RetryPolicy::fixed(
            profile
                .confirm_attempts
                .unwrap_or(config.confirm.max_attempts),
            profile
                .confirm_delay_ms
                .map_or(config.confirm.initial_delay, Duration::from_millis),
        );
    }
    if let Some(secs) = profile.fallback_poll {
        config.fallback_poll = (secs > 0).then(|| Duration::from_secs(secs));
    }
    Ok(config)
}
