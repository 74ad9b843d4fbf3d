//! Resolve the controller configuration from file, environment and flags.
//!
//! Flag overrides are folded into the selected profile before it is handed
//! to `fansync_config`, so validation happens in one place.

use fansync_config::{Config, Profile};
use fansync_core::ControllerConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Selected profile with CLI flag overrides applied.
pub fn active_profile(global: &GlobalOpts, cfg: &Config) -> Result<(String, Profile), CliError> {
    let (name, mut profile) = cfg.profile(global.profile.as_deref()).map_err(|_| {
        let mut available: Vec<&str> = cfg.profiles.keys().map(String::as_str).collect();
        available.sort_unstable();
        CliError::ProfileNotFound {
            name: global.profile.clone().unwrap_or_default(),
            available: if available.is_empty() {
                "(none)".into()
            } else {
                available.join(", ")
            },
        }
    })?;

    if let Some(email) = &global.email {
        profile.email = Some(email.clone());
    }
    if global.insecure {
        profile.verify_ssl = Some(false);
    }
    if let Some(secs) = global.http_timeout {
        profile.http_timeout = Some(secs);
    }
    if let Some(secs) = global.ws_timeout {
        profile.ws_timeout = Some(secs);
    }
    Ok((name, profile))
}

/// Build a `ControllerConfig` from the config file, profile, and CLI overrides.
pub fn controller_config(global: &GlobalOpts) -> Result<ControllerConfig, CliError> {
    let cfg = fansync_config::load_config()?;
    let (name, profile) = active_profile(global, &cfg)?;
    Ok(fansync_config::profile_to_controller_config(
        &profile,
        &name,
        &cfg.defaults,
    )?)
}

/// Profile rendered for display, with secrets replaced.
pub fn redacted(profile: &Profile) -> Profile {
    let mut shown = profile.clone();
    if shown.password.is_some() {
        shown.password = Some("********".into());
    }
    shown
}
