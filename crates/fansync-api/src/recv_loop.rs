// ── Connection task ──
//
// One task per connection owns the socket. It is the only reader, the
// only writer, and the only place a socket is replaced. Callers talk to
// it through `LinkHandle`, which implements `FrameSink` for the
// correlator.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::{ConnectionState, PushSource, PushUpdate};
use crate::config::PUSH_LOG_EVERY;
use crate::correlator::{FrameSink, RequestCorrelator};
use crate::device::DeviceDirectory;
use crate::diagnostics::{SharedDiagnostics, TokenMetadata};
use crate::error::{duration_ms, Error};
use crate::metrics::SharedMetrics;
use crate::protocol::Frame;
use crate::retry::RetryPolicy;
use crate::session::{Handshake, TransportSession, WsStream};
use crate::transport::Timeouts;

/// Requests from callers to the connection task.
pub(crate) enum LinkCommand {
    Send {
        text: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

/// Cloneable write side of a running connection task.
#[derive(Debug, Clone)]
pub(crate) struct LinkHandle {
    commands: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), Error>>) -> LinkCommand,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::Closed)?
    }
}

impl FrameSink for LinkHandle {
    fn send_text(&self, text: String) -> impl Future<Output = Result<(), Error>> + Send {
        self.request(|reply| LinkCommand::Send { text, reply })
    }

    fn reconnect(&self) -> impl Future<Output = Result<(), Error>> + Send {
        self.request(|reply| LinkCommand::Reconnect { reply })
    }
}

/// State shared between the client facade and the connection task.
#[derive(Clone)]
pub(crate) struct LinkShared {
    pub correlator: Arc<RequestCorrelator>,
    pub metrics: SharedMetrics,
    pub diagnostics: SharedDiagnostics,
    pub devices: Arc<ArcSwap<DeviceDirectory>>,
    pub state: Arc<watch::Sender<ConnectionState>>,
    pub timeouts: Arc<Timeouts>,
}

/// Knobs copied out of `ClientConfig`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopTuning {
    pub enable_push: bool,
    pub timeouts_before_reconnect: u32,
    pub reconnect_backoff: RetryPolicy,
}

/// Why the current socket is being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
enum ReconnectReason {
    IdleTimeouts,
    Closed,
    Requested,
    Retry,
}

pub(crate) struct RecvLoop {
    session: TransportSession,
    sink: Option<SplitSink<WsStream, Message>>,
    stream: Option<SplitStream<WsStream>>,
    commands: mpsc::Receiver<LinkCommand>,
    push_tx: mpsc::Sender<PushUpdate>,
    shared: LinkShared,
    tuning: LoopTuning,
    cancel: CancellationToken,
    idle_timeouts: u32,
    failed_reconnects: u32,
    /// Cleared after a fatal authentication failure.
    auto_reconnect: bool,
}

impl RecvLoop {
    /// Wrap a completed handshake. Returns the loop and the handle
    /// callers use to write through it.
    pub fn new(
        session: TransportSession,
        handshake: Handshake,
        push_tx: mpsc::Sender<PushUpdate>,
        shared: LinkShared,
        tuning: LoopTuning,
        cancel: CancellationToken,
    ) -> (Self, LinkHandle) {
        let (commands_tx, commands) = mpsc::channel(32);
        let (sink, stream) = handshake.socket.split();
        let recv_loop = Self {
            session,
            sink: Some(sink),
            stream: Some(stream),
            commands,
            push_tx,
            shared,
            tuning,
            cancel,
            idle_timeouts: 0,
            failed_reconnects: 0,
            auto_reconnect: true,
        };
        (
            recv_loop,
            LinkHandle {
                commands: commands_tx,
            },
        )
    }

    pub async fn run(mut self) {
        let idle = tokio::time::sleep(self.shared.timeouts.ws());
        tokio::pin!(idle);

        loop {
            let may_wake = self.stream.is_some() || self.auto_reconnect;
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => {
                    self.handle_command(command, idle.as_mut()).await;
                }
                frame = next_frame(&mut self.stream) => {
                    self.handle_frame(frame, idle.as_mut()).await;
                }
                () = &mut idle, if may_wake => {
                    self.handle_idle(idle.as_mut()).await;
                }
            }
        }

        self.close_socket().await;
        debug!("connection task exiting");
    }

    // ── Inbound ──────────────────────────────────────────────────────

    async fn handle_frame(
        &mut self,
        frame: Option<Result<Message, tungstenite::Error>>,
        idle: Pin<&mut Sleep>,
    ) {
        match frame {
            Some(Ok(Message::Text(text))) => {
                self.mark_alive(idle);
                self.route(text.as_str());
            }
            Some(Ok(Message::Close(close))) => {
                match close {
                    Some(cf) => info!(code = %cf.code, reason = %cf.reason, "WebSocket close frame received"),
                    None => info!("WebSocket close frame received (no payload)"),
                }
                self.socket_lost(idle).await;
            }
            Some(Ok(_)) => {
                // Ping, pong, binary: still proof of life.
                self.mark_alive(idle);
            }
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket read error");
                self.shared.metrics.lock().record_websocket_error();
                self.socket_lost(idle).await;
            }
            None => {
                info!("WebSocket stream ended");
                self.socket_lost(idle).await;
            }
        }
    }

    fn route(&self, text: &str) {
        let correlator = &self.shared.correlator;
        let frame = match Frame::parse(text, |id| correlator.is_pending(id)) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "malformed frame, skipping");
                return;
            }
        };

        match frame {
            Frame::Ack(ack) => {
                correlator.resolve(ack);
            }
            Frame::Stale(ack) => {
                debug!(request_id = ack.id, "late response discarded");
            }
            Frame::Push(push) => {
                let total = {
                    let mut metrics = self.shared.metrics.lock();
                    metrics.record_push_update();
                    metrics.push_updates_received
                };
                self.shared
                    .diagnostics
                    .lock()
                    .record_push(push.device.as_deref(), &push.status);
                if total % PUSH_LOG_EVERY == 0 {
                    info!(total, "push updates received");
                }
                trace!(device = ?push.device, event = ?push.event, "push frame");

                if !self.tuning.enable_push {
                    return;
                }
                let update = PushUpdate {
                    device: push.device,
                    status: push.status,
                    source: PushSource::Event,
                };
                if let Err(e) = self.push_tx.try_send(update) {
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            warn!("push queue full, dropping update");
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            debug!("push consumer gone, dropping update");
                        }
                    }
                }
            }
            Frame::Unknown(value) => {
                trace!(frame = %value, "ignoring unrecognized frame");
            }
        }
    }

    fn mark_alive(&mut self, idle: Pin<&mut Sleep>) {
        self.idle_timeouts = 0;
        idle.reset(Instant::now() + self.shared.timeouts.ws());
    }

    async fn handle_idle(&mut self, mut idle: Pin<&mut Sleep>) {
        if self.stream.is_none() {
            let _ = self.reconnect(ReconnectReason::Retry, idle).await;
            return;
        }

        self.idle_timeouts += 1;
        debug!(
            consecutive = self.idle_timeouts,
            limit = self.tuning.timeouts_before_reconnect,
            "no frame within read timeout"
        );
        if self.idle_timeouts >= self.tuning.timeouts_before_reconnect.max(1) {
            let _ = self.reconnect(ReconnectReason::IdleTimeouts, idle).await;
        } else {
            idle.as_mut().reset(Instant::now() + self.shared.timeouts.ws());
        }
    }

    /// The reader saw the socket die. Requests already written to it will
    /// never be answered.
    async fn socket_lost(&mut self, idle: Pin<&mut Sleep>) {
        self.drop_socket();
        self.shared.correlator.fail_in_flight(|| Error::Closed);
        if self.auto_reconnect {
            let _ = self.reconnect(ReconnectReason::Closed, idle).await;
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: LinkCommand, idle: Pin<&mut Sleep>) {
        match command {
            LinkCommand::Send { text, reply } => {
                let had_socket = self.sink.is_some();
                let result = self.write(text).await;
                if result.is_err() && had_socket {
                    // The caller resends after asking for a reconnect.
                    warn!("WebSocket send failed, dropping socket");
                    self.drop_socket();
                    self.shared.metrics.lock().record_websocket_error();
                    self.shared.correlator.fail_in_flight(|| Error::Closed);
                }
                let _ = reply.send(result);
            }
            LinkCommand::Reconnect { reply } => {
                let result = if self.stream.is_some() {
                    // Another caller already replaced the socket.
                    Ok(())
                } else {
                    self.reconnect(ReconnectReason::Requested, idle).await
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn write(&mut self, text: String) -> Result<(), Error> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(Error::Closed);
        };
        sink.send(Message::text(text)).await.map_err(Error::from)
    }

    // ── Socket replacement ───────────────────────────────────────────

    async fn reconnect(
        &mut self,
        reason: ReconnectReason,
        mut idle: Pin<&mut Sleep>,
    ) -> Result<(), Error> {
        self.close_socket().await;
        self.shared.metrics.lock().set_connected(false);

        let attempt = self.failed_reconnects + 1;
        self.shared
            .state
            .send_replace(ConnectionState::Reconnecting { attempt });
        info!(reason = %reason, attempt, "reconnecting WebSocket");

        let started = Instant::now();
        // Dropping the handshake future also drops its partial socket.
        let reopened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!("connection closing, reconnect abandoned");
                return Err(Error::NotConnected);
            }
            result = self.session.reopen() => result,
        };
        match reopened {
            Ok(handshake) => {
                self.install(handshake);
                self.failed_reconnects = 0;
                self.idle_timeouts = 0;
                idle.as_mut().reset(Instant::now() + self.shared.timeouts.ws());
                info!(elapsed_ms = duration_ms(started.elapsed()), "WebSocket reconnected");
                Ok(())
            }
            Err(e) => {
                self.shared.diagnostics.lock().record_failure("reconnect", &e);
                if e.is_auth() {
                    warn!(error = %e, "reconnect failed with authentication error, giving up");
                    self.auto_reconnect = false;
                    self.shared.state.send_replace(ConnectionState::Failed);
                } else {
                    let delay = self.tuning.reconnect_backoff.delay_for(self.failed_reconnects);
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = duration_ms(delay),
                        "reconnect failed, backing off"
                    );
                    idle.as_mut().reset(Instant::now() + delay);
                }
                self.failed_reconnects = self.failed_reconnects.saturating_add(1);
                Err(e)
            }
        }
    }

    fn install(&mut self, handshake: Handshake) {
        let Handshake {
            socket,
            devices,
            timing,
            token_refreshed,
        } = handshake;

        let (sink, stream) = socket.split();
        self.sink = Some(sink);
        self.stream = Some(stream);
        self.auto_reconnect = true;

        self.shared
            .devices
            .rcu(|current| Arc::new(current.with_devices(devices.clone())));

        {
            let mut metrics = self.shared.metrics.lock();
            metrics.record_reconnect();
            if token_refreshed {
                metrics.record_token_refresh();
            }
            metrics.set_connected(true);
        }
        let token = token_refreshed
            .then(|| self.session.token().map(TokenMetadata::from_token))
            .flatten();
        self.shared.diagnostics.lock().record_connect(timing, token);
        self.shared.state.send_replace(ConnectionState::Connected);
    }

    fn drop_socket(&mut self) {
        self.sink = None;
        self.stream = None;
    }

    async fn close_socket(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "error closing WebSocket");
            }
        }
        self.stream = None;
    }
}

async fn next_frame(
    stream: &mut Option<SplitStream<WsStream>>,
) -> Option<Result<Message, tungstenite::Error>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
