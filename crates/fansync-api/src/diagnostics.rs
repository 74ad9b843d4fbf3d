//! Rolling history for troubleshooting a live client.
//!
//! Nothing here affects control flow. The log is filled by the client and
//! the read loop and rendered on demand by [`crate::Client::diagnostics`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;

use crate::circuit_breaker::BreakerSnapshot;
use crate::metrics::MetricsSnapshot;
use crate::protocol::{RequestKind, Status};
use crate::session::ConnectTiming;

const MAX_COMMAND_HISTORY: usize = 50;
const MAX_FAILURES: usize = 10;

/// Push bucket for frames that name no device.
const UNKNOWN_DEVICE: &str = "unknown";

pub type SharedDiagnostics = Arc<Mutex<DiagnosticsLog>>;

/// One completed get/set round-trip.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub at: DateTime<Utc>,
    pub request: RequestKind,
    pub request_id: u64,
    pub device: String,
    /// Status keys written by a set, sorted. Empty for gets.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    pub latency_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub operation: String,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PushStats {
    pub total: u64,
    pub last_at: Option<DateTime<Utc>>,
    pub by_device: HashMap<String, u64>,
    /// Status keys carried by the latest push for each device.
    pub last_keys: HashMap<String, Vec<String>>,
}

/// Claims read from the session token. The token itself is never kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenMetadata {
    pub length: usize,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub issuer: Option<String>,
}

impl TokenMetadata {
    /// Inspect a JWT-shaped token. Opaque tokens yield only the length.
    pub fn from_token(token: &SecretString) -> Self {
        let raw = token.expose_secret();
        let mut meta = Self {
            length: raw.len(),
            ..Self::default()
        };

        let Some(claims) = raw
            .split('.')
            .nth(1)
            .and_then(|payload| URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok())
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        else {
            return meta;
        };

        let timestamp = |key: &str| {
            claims
                .get(key)
                .and_then(Value::as_i64)
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        };
        meta.issued_at = timestamp("iat");
        meta.expires_at = timestamp("exp");
        meta.issuer = claims.get("iss").and_then(Value::as_str).map(String::from);
        meta
    }
}

#[derive(Debug, Default)]
pub struct DiagnosticsLog {
    history: VecDeque<CommandRecord>,
    last_get: HashMap<String, CommandRecord>,
    last_set: HashMap<String, CommandRecord>,
    failures: VecDeque<FailureRecord>,
    push: PushStats,
    timing: Option<ConnectTiming>,
    token: Option<TokenMetadata>,
}

impl DiagnosticsLog {
    pub fn shared() -> SharedDiagnostics {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn record_command(&mut self, record: CommandRecord) {
        let latest = match record.request {
            RequestKind::Get => Some(&mut self.last_get),
            RequestKind::Set => Some(&mut self.last_set),
            RequestKind::Login | RequestKind::ListDevices => None,
        };
        if let Some(latest) = latest {
            latest.insert(record.device.clone(), record.clone());
        }
        if self.history.len() == MAX_COMMAND_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn record_failure(&mut self, operation: impl Into<String>, error: &crate::Error) {
        if self.failures.len() == MAX_FAILURES {
            self.failures.pop_front();
        }
        self.failures.push_back(FailureRecord {
            at: Utc::now(),
            operation: operation.into(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    pub fn record_push(&mut self, device: Option<&str>, status: &Status) {
        self.push.total += 1;
        self.push.last_at = Some(Utc::now());
        let device = device.unwrap_or(UNKNOWN_DEVICE);
        *self.push.by_device.entry(device.to_owned()).or_default() += 1;
        self.push.last_keys.insert(device.to_owned(), sorted_keys(status));
    }

    pub fn record_connect(&mut self, timing: ConnectTiming, token: Option<TokenMetadata>) {
        self.timing = Some(timing);
        if token.is_some() {
            self.token = token;
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &CommandRecord> {
        self.history.iter()
    }

    pub fn push_stats(&self) -> &PushStats {
        &self.push
    }

    pub fn timing(&self) -> Option<ConnectTiming> {
        self.timing
    }

    pub fn last_get(&self, device: &str) -> Option<&CommandRecord> {
        self.last_get.get(device)
    }

    pub fn last_set(&self, device: &str) -> Option<&CommandRecord> {
        self.last_set.get(device)
    }
}

pub(crate) fn sorted_keys(status: &Status) -> Vec<String> {
    let mut keys: Vec<String> = status.keys().cloned().collect();
    keys.sort_unstable();
    keys
}

/// Point-in-time view of everything the client knows about itself.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub session_url: String,
    pub ws_url: String,
    pub verify_ssl: bool,
    pub push_enabled: bool,
    pub http_timeout_ms: u64,
    pub ws_timeout_ms: u64,
    pub connection_state: String,
    pub device_ids: Vec<String>,
    pub pending_requests: usize,
    pub metrics: MetricsSnapshot,
    pub circuit_breaker: BreakerSnapshot,
    pub push: PushStats,
    pub last_get: HashMap<String, CommandRecord>,
    pub last_set: HashMap<String, CommandRecord>,
    pub command_history: Vec<CommandRecord>,
    pub recent_failures: Vec<FailureRecord>,
    pub connect_timing: Option<ConnectTiming>,
    pub token: Option<TokenMetadata>,
}

/// Parts of the snapshot that do not live in the log.
pub(crate) struct SnapshotContext {
    pub session_url: String,
    pub ws_url: String,
    pub verify_ssl: bool,
    pub push_enabled: bool,
    pub http_timeout_ms: u64,
    pub ws_timeout_ms: u64,
    pub connection_state: String,
    pub device_ids: Vec<String>,
    pub pending_requests: usize,
    pub metrics: MetricsSnapshot,
    pub circuit_breaker: BreakerSnapshot,
}

impl DiagnosticsLog {
    pub(crate) fn snapshot(&self, ctx: SnapshotContext) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            generated_at: Utc::now(),
            session_url: ctx.session_url,
            ws_url: ctx.ws_url,
            verify_ssl: ctx.verify_ssl,
            push_enabled: ctx.push_enabled,
            http_timeout_ms: ctx.http_timeout_ms,
            ws_timeout_ms: ctx.ws_timeout_ms,
            connection_state: ctx.connection_state,
            device_ids: ctx.device_ids,
            pending_requests: ctx.pending_requests,
            metrics: ctx.metrics,
            circuit_breaker: ctx.circuit_breaker,
            push: self.push.clone(),
            last_get: self.last_get.clone(),
            last_set: self.last_set.clone(),
            command_history: self.history.iter().cloned().collect(),
            recent_failures: self.failures.iter().cloned().collect(),
            connect_timing: self.timing,
            token: self.token.clone(),
        }
    }
}
