// Authenticated transport: HTTP session token + WebSocket handshake.
//
// A handshake is connect, login frame (id 1), device list (id 2). Any
// failure closes the partial socket before the error is returned, so a
// caller never ends up holding a half-initialized connection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth;
use crate::config::{ClientConfig, Credentials};
use crate::device::DeviceInfo;
use crate::error::{duration_ms, Error, HandshakeStage};
use crate::protocol::{Ack, Request, RequestKind};
use crate::retry::RetryPolicy;
use crate::transport::{Timeouts, TransportConfig};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Per-phase durations of the most recent connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectTiming {
    pub http_login_ms: u64,
    pub ws_connect_ms: u64,
    pub ws_login_ms: u64,
    pub device_list_ms: u64,
    pub total_ms: u64,
}

/// A socket that completed login and device enumeration.
pub(crate) struct Handshake {
    pub socket: WsStream,
    pub devices: Vec<DeviceInfo>,
    pub timing: ConnectTiming,
    /// A new HTTP token was fetched to complete this handshake.
    pub token_refreshed: bool,
}

/// Handshake failure tagged with the step it happened in.
struct StageError {
    stage: HandshakeStage,
    error: Error,
}

impl StageError {
    fn at(stage: HandshakeStage) -> impl FnOnce(Error) -> Self {
        move |error| Self { stage, error }
    }
}

pub(crate) struct TransportSession {
    http: reqwest::Client,
    session_url: Url,
    ws_url: Url,
    credentials: Credentials,
    token: Option<SecretString>,
    timeouts: Arc<Timeouts>,
    handshake_retry: RetryPolicy,
}

impl TransportSession {
    pub fn new(
        config: &ClientConfig,
        credentials: Credentials,
        timeouts: Arc<Timeouts>,
    ) -> Result<Self, Error> {
        let http = TransportConfig {
            tls: config.tls.clone(),
            connect_timeout: config.http_timeout,
        }
        .build_client()?;

        Ok(Self {
            http,
            session_url: config.session_url.clone(),
            ws_url: config.ws_url.clone(),
            credentials,
            token: None,
            timeouts,
            handshake_retry: config.handshake_retry,
        })
    }

    pub fn token(&self) -> Option<&SecretString> {
        self.token.as_ref()
    }

    /// Fetch a fresh session token over HTTP.
    pub async fn authenticate(&mut self) -> Result<Duration, Error> {
        let started = Instant::now();
        let token = auth::login(
            &self.http,
            &self.session_url,
            &self.credentials,
            self.timeouts.http(),
        )
        .await?;
        self.token = Some(token);
        Ok(started.elapsed())
    }

    /// HTTP login followed by the WebSocket handshake.
    pub async fn connect(&mut self) -> Result<Handshake, Error> {
        let started = Instant::now();
        let login_elapsed = self.authenticate().await?;
        let mut handshake = self.open().await?;
        handshake.timing.http_login_ms = duration_ms(login_elapsed);
        handshake.timing.total_ms = duration_ms(started.elapsed());
        Ok(handshake)
    }

    /// Handshake again with the cached token. A rejected login triggers
    /// one token refresh before giving up.
    pub async fn reopen(&mut self) -> Result<Handshake, Error> {
        match self.open().await {
            Err(Error::LoginRejected { status }) => {
                info!(status = %status, "WebSocket login rejected, refreshing session token");
                let login_elapsed = self.authenticate().await?;
                let mut handshake = self.open().await?;
                handshake.timing.http_login_ms = duration_ms(login_elapsed);
                handshake.token_refreshed = true;
                Ok(handshake)
            }
            other => other,
        }
    }

    /// WebSocket handshake with retry on transient failures.
    pub async fn open(&self) -> Result<Handshake, Error> {
        let token = self.token.clone().ok_or_else(|| Error::Authentication {
            message: "no session token; log in first".into(),
        })?;

        let result = self
            .handshake_retry
            .run(
                |attempt| {
                    let token = token.clone();
                    async move {
                        if attempt > 0 {
                            debug!(attempt, "retrying WebSocket handshake");
                        }
                        self.open_once(&token).await
                    }
                },
                |e: &StageError| e.error.is_transient(),
            )
            .await;

        result.map_err(|StageError { stage, error }| {
            if error.is_transient() {
                warn!(stage = %stage, error = %error, "handshake retries exhausted");
                Error::Handshake {
                    stage,
                    message: error.to_string(),
                }
            } else {
                error
            }
        })
    }

    async fn open_once(&self, token: &SecretString) -> Result<Handshake, StageError> {
        let ws_timeout = self.timeouts.ws();
        let started = Instant::now();

        debug!(url = %self.ws_url, "connecting WebSocket");
        let (mut socket, _response) =
            tokio::time::timeout(ws_timeout, tokio_tungstenite::connect_async(self.ws_url.as_str()))
                .await
                .map_err(|_| Error::timeout("websocket connect", ws_timeout))
                .and_then(|r| r.map_err(|e| Error::WebSocketConnect(e.to_string())))
                .map_err(StageError::at(HandshakeStage::Connect))?;
        let ws_connect = started.elapsed();

        match login_and_list(&mut socket, token, ws_timeout).await {
            Ok((devices, ws_login, device_list)) => {
                info!(devices = devices.len(), "WebSocket handshake complete");
                Ok(Handshake {
                    socket,
                    devices,
                    timing: ConnectTiming {
                        http_login_ms: 0,
                        ws_connect_ms: duration_ms(ws_connect),
                        ws_login_ms: duration_ms(ws_login),
                        device_list_ms: duration_ms(device_list),
                        total_ms: duration_ms(started.elapsed()),
                    },
                    token_refreshed: false,
                })
            }
            Err(e) => {
                let _ = socket.close(None).await;
                Err(e)
            }
        }
    }
}

async fn login_and_list(
    socket: &mut WsStream,
    token: &SecretString,
    ws_timeout: Duration,
) -> Result<(Vec<DeviceInfo>, Duration, Duration), StageError> {
    let started = Instant::now();
    let login = exchange(socket, &Request::login(token), ws_timeout)
        .await
        .map_err(StageError::at(HandshakeStage::Login))?;
    if !login.is_ok() {
        return Err(StageError {
            stage: HandshakeStage::Login,
            error: Error::LoginRejected {
                status: login.status.unwrap_or_else(|| "missing".into()),
            },
        });
    }
    let ws_login = started.elapsed();

    let started = Instant::now();
    let list = exchange(socket, &Request::list_devices(), ws_timeout)
        .await
        .map_err(StageError::at(HandshakeStage::DeviceList))?;
    let devices = DeviceInfo::parse_list(list.data.as_ref());
    if devices.is_empty() {
        return Err(StageError {
            stage: HandshakeStage::DeviceList,
            error: Error::NoDevices,
        });
    }
    Ok((devices, ws_login, started.elapsed()))
}

/// Send one control frame and wait for its answer, skipping anything else
/// the relay interleaves.
async fn exchange(socket: &mut WsStream, request: &Request, timeout: Duration) -> Result<Ack, Error> {
    socket.send(Message::text(request.encode()?)).await?;

    let wait = async {
        loop {
            let text = match socket.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => return Err(Error::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Error::from(e)),
            };
            match serde_json::from_str::<Value>(text.as_str()) {
                Ok(value) => {
                    if let Some(ack) = control_ack(&value, request) {
                        return Ok(ack);
                    }
                    debug!(request = %request.request, "ignoring frame during handshake");
                }
                Err(e) => debug!(error = %e, "malformed frame during handshake"),
            }
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| Error::timeout(request.request.to_string(), timeout))?
}

/// Match an answer to a control request: same id, or no id and a
/// `response` naming the request. Login answers must carry a status; the
/// device-list answer must carry a `data` list.
fn control_ack(value: &Value, request: &Request) -> Option<Ack> {
    let obj = value.as_object()?;
    let response = obj.get("response").and_then(Value::as_str);
    let matches = match obj.get("id").and_then(Value::as_u64) {
        Some(id) => id == request.id,
        None => response.is_none_or(|r| r == <&str>::from(request.request)),
    };
    if !matches {
        return None;
    }

    let data = obj.get("data").cloned();
    let shaped = match request.request {
        RequestKind::Login => obj.get("status").is_some_and(Value::is_string),
        RequestKind::ListDevices => data.as_ref().is_some_and(Value::is_array),
        RequestKind::Get | RequestKind::Set => true,
    };
    shaped.then(|| Ack {
        id: request.id,
        status: obj.get("status").and_then(Value::as_str).map(String::from),
        response: response.map(String::from),
        data,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn login_answer_matches_by_id_or_response() {
        let req = Request::list_devices();
        let login = Request::login(&SecretString::from("t".to_string()));
        assert!(control_ack(&json!({"id": 1, "status": "ok"}), &login).is_some());
        assert!(control_ack(&json!({"response": "login", "status": "ok"}), &login).is_some());
        assert!(control_ack(&json!({"status": "ok"}), &login).is_some());
        assert!(control_ack(&json!({"id": 2, "status": "ok"}), &login).is_none());
        assert!(control_ack(&json!({"response": "lst_device", "status": "ok"}), &login).is_none());
        assert!(control_ack(&json!({"id": 2, "status": "ok"}), &req).is_none());
    }

    #[test]
    fn device_list_answer_needs_a_list() {
        let req = Request::list_devices();
        assert!(control_ack(&json!({"id": 2, "status": "ok"}), &req).is_none());
        let ack = control_ack(&json!({"id": 2, "status": "ok", "data": [{"device": "d"}]}), &req)
            .unwrap();
        assert_eq!(ack.id, 2);
    }

    #[test]
    fn push_during_handshake_is_not_a_login_answer() {
        let login = Request::login(&SecretString::from("t".to_string()));
        assert!(control_ack(&json!({"event": "device_change", "data": {}}), &login).is_none());
    }
}
