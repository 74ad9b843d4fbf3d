//! Request id allocation and response matching.
//!
//! The correlator is the only owner of the pending-request table. Writers
//! go through [`FrameSink`]; the read loop hands every frame whose id is
//! pending to [`RequestCorrelator::resolve`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{duration_ms, Error};
use crate::protocol::{Ack, Request, RequestKind, FIRST_DYNAMIC_REQUEST_ID};
use crate::retry::RetryPolicy;

type Waiter = oneshot::Sender<Result<Ack, Error>>;

/// Where encoded request frames are written.
pub trait FrameSink: Send + Sync {
    /// Write one text frame on the current socket.
    fn send_text(&self, text: String) -> impl Future<Output = Result<(), Error>> + Send;

    /// Replace the socket with a freshly handshaken one.
    fn reconnect(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

#[derive(Debug)]
struct Pending {
    kind: RequestKind,
    created_at: Instant,
    /// The frame reached a socket at least once.
    sent: bool,
    waiter: Waiter,
}

#[derive(Debug)]
pub struct RequestCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(FIRST_DYNAMIC_REQUEST_ID),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next request id. Ids are never reused.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Park a waiter for `id`.
    pub fn register(&self, id: u64, kind: RequestKind) -> oneshot::Receiver<Result<Ack, Error>> {
        let (waiter, rx) = oneshot::channel();
        let previous = self.pending.lock().insert(
            id,
            Pending {
                kind,
                created_at: Instant::now(),
                sent: false,
                waiter,
            },
        );
        if previous.is_some() {
            debug!(request_id = id, "replaced an existing waiter");
        }
        rx
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Hand an ack to its waiter. Returns `false` if nobody is waiting
    /// (already resolved, timed out, or never registered).
    pub fn resolve(&self, ack: Ack) -> bool {
        let id = ack.id;
        let Some(pending) = self.pending.lock().remove(&id) else {
            debug!(request_id = id, "no waiter for response, discarding");
            return false;
        };
        debug!(
            request_id = id,
            request = %pending.kind,
            elapsed_ms = duration_ms(pending.created_at.elapsed()),
            "response matched"
        );
        // The receiver is gone if the caller was cancelled.
        pending.waiter.send(Ok(ack)).is_ok()
    }

    pub fn mark_sent(&self, id: u64) {
        if let Some(pending) = self.pending.lock().get_mut(&id) {
            pending.sent = true;
        }
    }

    /// Drop the waiter for `id` without resolving it.
    pub fn cancel(&self, id: u64) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Reject every outstanding waiter. Returns how many were failed.
    pub fn fail_all(&self, make_err: impl Fn() -> Error) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.waiter.send(Err(make_err()));
        }
        if count > 0 {
            debug!(count, "failed outstanding requests");
        }
        count
    }

    /// Reject waiters whose frame was written to a socket that has since
    /// died. Requests still being sent are left for the resend path.
    pub fn fail_in_flight(&self, make_err: impl Fn() -> Error) -> usize {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.sent)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.waiter.send(Err(make_err()));
        }
        if count > 0 {
            debug!(count, "failed requests in flight on a closed socket");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `request` and wait for its ack.
    ///
    /// A send that fails because the socket is closed triggers one
    /// reconnect and a resend of the identical frame (per `resend`).
    /// The waiter is removed on every exit path.
    pub async fn send_and_await<S: FrameSink>(
        &self,
        sink: &S,
        request: Request,
        timeout: Duration,
        resend: RetryPolicy,
    ) -> Result<Ack, Error> {
        let id = request.id;
        let kind = request.request;
        let text = request.encode()?;

        let rx = self.register(id, kind);
        let _guard = PendingGuard {
            correlator: self,
            id,
        };

        resend
            .run(
                |attempt| {
                    let text = text.clone();
                    async move {
                        if attempt > 0 {
                            debug!(request_id = id, attempt, "socket closed, reconnecting before resend");
                            sink.reconnect().await?;
                        }
                        debug!(request_id = id, request = %kind, "send request");
                        sink.send_text(text).await?;
                        self.mark_sent(id);
                        Ok(())
                    }
                },
                Error::is_socket_closed,
            )
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                debug!(request_id = id, request = %kind, "response timed out");
                Err(Error::timeout(kind.to_string(), timeout))
            }
        }
    }
}

/// Removes the pending entry when `send_and_await` returns or is dropped.
struct PendingGuard<'a> {
    correlator: &'a RequestCorrelator,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.cancel(self.id);
    }
}
