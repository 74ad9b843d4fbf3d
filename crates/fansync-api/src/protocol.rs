//! WebSocket frame codec.
//!
//! Outbound requests are typed [`Request`] values. Inbound text is
//! classified once into a [`Frame`] so routing code never has to poke at
//! raw JSON keys.
//!
//! ```text
//! out: {"id": 7, "request": "set", "device": "dev-1", "data": {"H00": 1}}
//! ack: {"id": 7, "status": "ok", "response": "set", "data": {"status": {...}}}
//! push: {"data": {"changes": {"status": {"H02": 40}}}, "event": "device_change"}
//! ```

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::Error;

/// Fixed id of the login frame.
pub const LOGIN_REQUEST_ID: u64 = 1;
/// Fixed id of the device-list frame.
pub const LIST_DEVICES_REQUEST_ID: u64 = 2;
/// First id handed out for get/set traffic.
pub const FIRST_DYNAMIC_REQUEST_ID: u64 = 3;

/// Device status keyed by short field codes (`H00`, `H02`, ...).
pub type Status = Map<String, Value>;

// ── Outbound ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::IntoStaticStr)]
pub enum RequestKind {
    #[serde(rename = "login")]
    #[strum(serialize = "login")]
    Login,
    #[serde(rename = "lst_device")]
    #[strum(serialize = "lst_device")]
    ListDevices,
    #[serde(rename = "get")]
    #[strum(serialize = "get")]
    Get,
    #[serde(rename = "set")]
    #[strum(serialize = "set")]
    Set,
}

/// One outbound request frame.
#[derive(Clone, Serialize)]
pub struct Request {
    pub id: u64,
    pub request: RequestKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// The login frame carries the session token.
impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub fn login(token: &SecretString) -> Self {
        Self {
            id: LOGIN_REQUEST_ID,
            request: RequestKind::Login,
            device: None,
            data: Some(json!({ "token": token.expose_secret() })),
        }
    }

    pub fn list_devices() -> Self {
        Self {
            id: LIST_DEVICES_REQUEST_ID,
            request: RequestKind::ListDevices,
            device: None,
            data: None,
        }
    }

    pub fn get(id: u64, device: impl Into<String>) -> Self {
        Self {
            id,
            request: RequestKind::Get,
            device: Some(device.into()),
            data: None,
        }
    }

    pub fn set(id: u64, device: impl Into<String>, fields: Status) -> Self {
        Self {
            id,
            request: RequestKind::Set,
            device: Some(device.into()),
            data: Some(Value::Object(fields)),
        }
    }

    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::Deserialization {
            message: format!("failed to encode {} request: {e}", self.request),
            body: String::new(),
        })
    }
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Response to one of our requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub id: u64,
    pub status: Option<String>,
    pub response: Option<String>,
    pub data: Option<Value>,
}

impl Ack {
    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some("ok")
    }

    /// Turn a non-ok status into [`Error::Rejected`].
    pub fn ensure_ok(self, request: RequestKind) -> Result<Self, Error> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::Rejected {
                request: request.to_string(),
                status: self.status.unwrap_or_else(|| "missing".into()),
            })
        }
    }

    /// Fresh device status embedded in the ack (`data.status`), if any.
    pub fn embedded_status(&self) -> Option<Status> {
        self.data
            .as_ref()
            .and_then(|d| d.get("status"))
            .and_then(Value::as_object)
            .cloned()
    }
}

/// Unsolicited device status update.
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    pub device: Option<String>,
    pub event: Option<String>,
    pub status: Status,
}

/// One classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Answers a request that is still waiting.
    Ack(Ack),
    /// Response-shaped frame whose waiter is already gone.
    Stale(Ack),
    /// Unsolicited status update.
    Push(Push),
    /// Anything else.
    Unknown(Value),
}

impl Frame {
    /// Parse and classify one text frame.
    ///
    /// `is_pending` decides whether a frame id belongs to an outstanding
    /// request; only such frames become [`Frame::Ack`].
    pub fn parse(text: &str, is_pending: impl Fn(u64) -> bool) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::classify(value, is_pending))
    }

    pub fn classify(value: Value, is_pending: impl Fn(u64) -> bool) -> Self {
        let obj = match value {
            Value::Object(obj) => obj,
            other => return Self::Unknown(other),
        };

        let id = obj.get("id").and_then(Value::as_u64);
        if let Some(id) = id {
            if is_pending(id) {
                return Self::Ack(ack_from(id, &obj));
            }
        }

        if let Some(status) = push_status(&obj) {
            let device = obj
                .get("device")
                .or_else(|| obj.get("data").and_then(|d| d.get("device")))
                .and_then(Value::as_str)
                .map(String::from);
            let event = obj.get("event").and_then(Value::as_str).map(String::from);
            return Self::Push(Push {
                device,
                event,
                status,
            });
        }

        match id {
            Some(id) if obj.contains_key("response") => Self::Stale(ack_from(id, &obj)),
            _ => Self::Unknown(Value::Object(obj)),
        }
    }
}

fn ack_from(id: u64, obj: &Map<String, Value>) -> Ack {
    Ack {
        id,
        status: obj.get("status").and_then(Value::as_str).map(String::from),
        response: obj.get("response").and_then(Value::as_str).map(String::from),
        data: obj.get("data").cloned(),
    }
}

/// Status carried by a push: `data.status`, `data.changes.status`, or the
/// same paths at the top level.
fn push_status(obj: &Map<String, Value>) -> Option<Status> {
    let nested = |root: &Value| {
        root.get("status")
            .and_then(Value::as_object)
            .or_else(|| {
                root.get("changes")
                    .and_then(|c| c.get("status"))
                    .and_then(Value::as_object)
            })
            .cloned()
    };

    obj.get("data")
        .and_then(&nested)
        .or_else(|| nested(&Value::Object(obj.clone())))
}
