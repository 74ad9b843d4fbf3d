// ── FanSync client ──
//
// Composes the session, the connection task, the correlator, the breaker
// and the metrics into connect/disconnect/get/set. Cheaply cloneable;
// clones share one connection.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{ClientConfig, Credentials, SLOW_CONNECTION_WARNING, SLOW_RESPONSE_WARNING};
use crate::correlator::RequestCorrelator;
use crate::device::{DeviceDirectory, DeviceInfo, DeviceProfile};
use crate::diagnostics::{
    sorted_keys, CommandRecord, DiagnosticsLog, DiagnosticsSnapshot, SharedDiagnostics,
    SnapshotContext, TokenMetadata,
};
use crate::error::{duration_ms, Error};
use crate::metrics::{ConnectionMetrics, MetricsSnapshot, SharedMetrics};
use crate::protocol::{Ack, Request, RequestKind, Status};
use crate::recv_loop::{LinkHandle, LinkShared, LoopTuning, RecvLoop};
use crate::session::TransportSession;
use crate::transport::Timeouts;

// ── Public types ─────────────────────────────────────────────────────

/// Lifecycle of the client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(tag = "state", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnecting stopped after an authentication failure.
    Failed,
}

/// Where a status update delivered to the push callback came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PushSource {
    /// Unsolicited frame from the relay.
    Event,
    /// Fresh status embedded in a `set` acknowledgement.
    SetAck,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushUpdate {
    pub device: Option<String>,
    pub status: Status,
    pub source: PushSource,
}

pub type PushCallback = Arc<dyn Fn(PushUpdate) + Send + Sync>;

type CallbackSlot = Arc<RwLock<Option<PushCallback>>>;

// ── Client ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    credentials: Credentials,
    timeouts: Arc<Timeouts>,
    correlator: Arc<RequestCorrelator>,
    metrics: SharedMetrics,
    breaker: CircuitBreaker,
    devices: Arc<ArcSwap<DeviceDirectory>>,
    diagnostics: SharedDiagnostics,
    callback: CallbackSlot,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Cancels an in-progress handshake.
    connecting: SyncMutex<Option<CancellationToken>>,
    connection: Mutex<Option<Connection>>,
}

/// Handles of a live connection.
struct Connection {
    link: LinkHandle,
    push_tx: mpsc::Sender<PushUpdate>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    pub fn new(config: ClientConfig, credentials: Credentials) -> Self {
        let timeouts = Arc::new(Timeouts::new(config.http_timeout, config.ws_timeout));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                metrics: ConnectionMetrics::shared(config.max_latency_samples),
                breaker: CircuitBreaker::new(config.breaker),
                config,
                credentials,
                timeouts,
                correlator: Arc::new(RequestCorrelator::new()),
                devices: Arc::new(ArcSwap::from_pointee(DeviceDirectory::default())),
                diagnostics: DiagnosticsLog::shared(),
                callback: Arc::new(RwLock::new(None)),
                state: Arc::new(state),
                connecting: SyncMutex::new(None),
                connection: Mutex::new(None),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Log in, complete the handshake, and start the connection task.
    ///
    /// A no-op when already connected. On failure nothing is retained.
    pub async fn connect(&self) -> Result<(), Error> {
        let mut connection = self.inner.connection.lock().await;
        if connection.is_some() {
            return Ok(());
        }

        let abort = CancellationToken::new();
        *self.inner.connecting.lock() = Some(abort.clone());
        self.inner.state.send_replace(ConnectionState::Connecting);

        let result = tokio::select! {
            biased;
            () = abort.cancelled() => Err(Error::NotConnected),
            result = self.establish() => result,
        };
        self.inner.connecting.lock().take();

        match result {
            Ok(conn) => {
                *connection = Some(conn);
                self.inner.state.send_replace(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.inner.diagnostics.lock().record_failure("connect", &e);
                self.inner.state.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<Connection, Error> {
        let inner = &self.inner;
        let started = Instant::now();

        let mut session = TransportSession::new(
            &inner.config,
            inner.credentials.clone(),
            Arc::clone(&inner.timeouts),
        )?;
        let handshake = session.connect().await?;

        let elapsed = started.elapsed();
        if elapsed > SLOW_CONNECTION_WARNING {
            warn!(elapsed_ms = duration_ms(elapsed), "slow connection to FanSync cloud");
        }

        let devices = handshake.devices.clone();
        inner
            .devices
            .rcu(|current| Arc::new(current.with_devices(devices.clone())));
        inner.diagnostics.lock().record_connect(
            handshake.timing,
            session.token().map(TokenMetadata::from_token),
        );
        inner.metrics.lock().set_connected(true);

        let cancel = CancellationToken::new();
        let (push_tx, push_rx) = mpsc::channel(inner.config.push_queue_capacity.max(1));
        let shared = LinkShared {
            correlator: Arc::clone(&inner.correlator),
            metrics: Arc::clone(&inner.metrics),
            diagnostics: Arc::clone(&inner.diagnostics),
            devices: Arc::clone(&inner.devices),
            state: Arc::clone(&inner.state),
            timeouts: Arc::clone(&inner.timeouts),
        };
        let tuning = LoopTuning {
            enable_push: inner.config.enable_push,
            timeouts_before_reconnect: inner.config.timeouts_before_reconnect,
            reconnect_backoff: inner.config.reconnect_backoff,
        };
        let (recv_loop, link) = RecvLoop::new(
            session,
            handshake,
            push_tx.clone(),
            shared,
            tuning,
            cancel.clone(),
        );

        let tasks = vec![
            tokio::spawn(recv_loop.run()),
            tokio::spawn(dispatch_pushes(
                push_rx,
                Arc::clone(&inner.callback),
                cancel.clone(),
            )),
        ];

        info!(
            devices = devices.len(),
            device = devices.first().map_or("", |d| d.device.as_str()),
            elapsed_ms = duration_ms(elapsed),
            "connected to FanSync cloud"
        );

        Ok(Connection {
            link,
            push_tx,
            cancel,
            tasks,
        })
    }

    /// Stop the connection task and fail outstanding requests.
    ///
    /// Safe to call from any state, any number of times.
    pub async fn disconnect(&self) {
        if let Some(abort) = self.inner.connecting.lock().take() {
            abort.cancel();
        }

        let conn = self.inner.connection.lock().await.take();
        if let Some(conn) = conn {
            conn.cancel.cancel();
            drop(conn.link);
            drop(conn.push_tx);
            for task in conn.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "background task failed during shutdown");
                }
            }
            info!("disconnected");
        }

        self.inner.correlator.fail_all(|| Error::NotConnected);
        self.inner.metrics.lock().set_connected(false);
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Current status of `device` (or the default device).
    pub async fn get_status(&self, device: Option<&str>) -> Result<Status, Error> {
        let device = self.resolve_device(device)?;
        let id = self.inner.correlator.next_id();
        let ack = self.round_trip(Request::get(id, device.clone())).await?;

        let data = ack.data.unwrap_or(Value::Null);
        if let Some(profile) = data.get("profile") {
            let profile = DeviceProfile::from_value(profile);
            self.inner
                .devices
                .rcu(|current| Arc::new(current.with_profile(&device, profile.clone())));
        }

        match data.get("status").and_then(Value::as_object) {
            Some(status) => Ok(status.clone()),
            None => Err(Error::Deserialization {
                message: "get response did not include a status".into(),
                body: data.to_string(),
            }),
        }
    }

    /// Write `fields` to `device` (or the default device).
    ///
    /// Returns the status embedded in the ack, if the relay sent one. That
    /// status is also delivered to the push callback, exactly once.
    pub async fn set(&self, device: Option<&str>, fields: Status) -> Result<Option<Status>, Error> {
        let device = self.resolve_device(device)?;
        let id = self.inner.correlator.next_id();
        let ack = self.round_trip(Request::set(id, device.clone(), fields)).await?;

        let status = ack.embedded_status();
        if let Some(status) = &status {
            let push_tx = self.inner.connection.lock().await.as_ref().map(|c| c.push_tx.clone());
            if let Some(push_tx) = push_tx {
                let update = PushUpdate {
                    device: Some(device),
                    status: status.clone(),
                    source: PushSource::SetAck,
                };
                if push_tx.send(update).await.is_err() {
                    debug!("push consumer gone, set status not delivered");
                }
            }
        }
        Ok(status)
    }

    /// Send one request and wait for its ack. Every outcome, including a
    /// missing connection or an open circuit, lands in metrics and history.
    async fn round_trip(&self, request: Request) -> Result<Ack, Error> {
        let inner = &self.inner;
        let id = request.id;
        let kind = request.request;
        let device = request.device.clone().unwrap_or_default();
        let keys = match (kind, &request.data) {
            (RequestKind::Set, Some(Value::Object(fields))) => sorted_keys(fields),
            _ => Vec::new(),
        };
        let timeout = inner.timeouts.ws();
        let resend = inner.config.resend;

        let started = Instant::now();
        let link = inner
            .connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.link.clone());
        let result = match link {
            None => Err(Error::NotConnected),
            Some(link) => {
                inner
                    .breaker
                    .call(|| async {
                        inner
                            .correlator
                            .send_and_await(&link, request, timeout, resend)
                            .await
                            .and_then(|ack| ack.ensure_ok(kind))
                    })
                    .await
            }
        };
        let elapsed = started.elapsed();

        match &result {
            Err(e) if e.is_timeout() => inner.metrics.lock().record_timeout(Some(elapsed)),
            Err(_) => inner.metrics.lock().record_command(false, Some(elapsed)),
            Ok(_) => inner.metrics.lock().record_command(true, Some(elapsed)),
        }
        if elapsed > SLOW_RESPONSE_WARNING {
            warn!(request = %kind, request_id = id, elapsed_ms = duration_ms(elapsed), "slow response");
        }

        {
            let mut diagnostics = inner.diagnostics.lock();
            diagnostics.record_command(CommandRecord {
                at: Utc::now(),
                request: kind,
                request_id: id,
                device,
                keys,
                latency_ms: duration_ms(elapsed),
                success: result.is_ok(),
                error_kind: result.as_ref().err().map(Error::kind),
                error: result.as_ref().err().map(ToString::to_string),
            });
            if let Err(e) = &result {
                diagnostics.record_failure(kind.to_string(), e);
            }
        }

        result
    }

    fn resolve_device(&self, device: Option<&str>) -> Result<String, Error> {
        match device {
            Some(id) => Ok(id.to_owned()),
            None => self
                .inner
                .devices
                .load()
                .default_id()
                .map(String::from)
                .ok_or(Error::NoDevice),
        }
    }

    // ── Push ─────────────────────────────────────────────────────────

    /// Install the push callback, replacing any previous one.
    ///
    /// Invoked from a single task, in receipt order, never concurrently.
    pub fn register_push_callback(&self, callback: impl Fn(PushUpdate) + Send + Sync + 'static) {
        *self.inner.callback.write() = Some(Arc::new(callback));
    }

    pub fn clear_push_callback(&self) {
        self.inner.callback.write().take();
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Default device id (first entry of the device list).
    pub fn device_id(&self) -> Option<String> {
        self.inner.devices.load().default_id().map(String::from)
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.inner.devices.load().ids()
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.inner.devices.load().devices().to_vec()
    }

    /// Cached list entry for `device`; empty when unknown.
    pub fn device_metadata(&self, device: &str) -> DeviceInfo {
        self.inner
            .devices
            .load()
            .metadata(device)
            .cloned()
            .unwrap_or_default()
    }

    /// Cached hardware profile from the last `get`; empty when unknown.
    pub fn device_profile(&self, device: &str) -> DeviceProfile {
        self.inner
            .devices
            .load()
            .profile(device)
            .cloned()
            .unwrap_or_default()
    }

    // ── Tuning & health ──────────────────────────────────────────────

    /// Change timeouts at runtime. `None` keeps the current value.
    pub fn apply_timeouts(&self, http: Option<Duration>, ws: Option<Duration>) {
        self.inner.timeouts.apply(http, ws);
        debug!(
            http_ms = duration_ms(self.inner.timeouts.http()),
            ws_ms = duration_ms(self.inner.timeouts.ws()),
            "timeouts updated"
        );
    }

    pub fn ws_timeout(&self) -> Duration {
        self.inner.timeouts.ws()
    }

    pub fn http_timeout(&self) -> Duration {
        self.inner.timeouts.http()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.lock().snapshot()
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    pub fn reset_breaker(&self) {
        self.inner.breaker.reset();
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        let inner = &self.inner;
        let ctx = SnapshotContext {
            session_url: inner.config.session_url.to_string(),
            ws_url: inner.config.ws_url.to_string(),
            verify_ssl: inner.config.tls.verifies(),
            push_enabled: inner.config.enable_push,
            http_timeout_ms: duration_ms(inner.timeouts.http()),
            ws_timeout_ms: duration_ms(inner.timeouts.ws()),
            connection_state: self.state().to_string(),
            device_ids: self.device_ids(),
            pending_requests: inner.correlator.pending_count(),
            metrics: inner.metrics.lock().snapshot(),
            circuit_breaker: inner.breaker.snapshot(),
        };
        inner.diagnostics.lock().snapshot(ctx)
    }
}

/// Single consumer of the push queue. Runs the callback serially.
async fn dispatch_pushes(
    mut rx: mpsc::Receiver<PushUpdate>,
    callback: CallbackSlot,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            update = rx.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        let Some(callback) = callback.read().clone() else {
            trace!("no push callback registered, dropping update");
            continue;
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(update))).is_err() {
            warn!("push callback panicked");
        }
    }
    debug!("push dispatcher exiting");
}
