// Session login
//
// One POST of `{email, password}` to the session endpoint returns
// `{"token": ...}`. The token is the only credential the WebSocket login
// frame needs.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::config::Credentials;
use crate::error::Error;

#[derive(Deserialize)]
struct SessionResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Exchange credentials for a session token.
///
/// 401/403 map to [`Error::Authentication`]; other non-success statuses
/// surface as [`Error::Transport`].
pub async fn login(
    http: &reqwest::Client,
    session_url: &Url,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<SecretString, Error> {
    debug!(url = %session_url, "logging in");

    let body = json!({
        "email": credentials.email,
        "password": credentials.password.expose_secret(),
    });

    let resp = http
        .post(session_url.clone())
        .timeout(timeout)
        .json(&body)
        .send()
        .await
        .map_err(Error::Transport)?;

    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(Error::Authentication {
            message: format!("login rejected (HTTP {status})"),
        });
    }
    let resp = resp.error_for_status().map_err(Error::Transport)?;

    let text = resp.text().await.map_err(Error::Transport)?;
    let parsed: SessionResponse =
        serde_json::from_str(&text).map_err(|e| Error::Deserialization {
            message: format!("invalid session response: {e}"),
            body: String::new(),
        })?;

    match parsed.token {
        Some(token) if !token.is_empty() => {
            debug!("login successful");
            Ok(SecretString::from(token))
        }
        _ => Err(Error::Authentication {
            message: "session response did not include a token".into(),
        }),
    }
}
