// ── Reactive status streams ──
//
// Subscription to one device's visible status.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use fansync_api::Status;

/// A subscription to a device's visible status.
///
/// Provides point-in-time snapshot access and change notification via
/// [`changed`](Self::changed) or by converting to a `Stream`.
pub struct StatusStream {
    current: Arc<Status>,
    receiver: watch::Receiver<Arc<Status>>,
}

impl StatusStream {
    pub(crate) fn new(receiver: watch::Receiver<Arc<Status>>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// Snapshot captured at creation or at the last `changed()`.
    pub fn current(&self) -> &Arc<Status> {
        &self.current
    }

    /// Latest snapshot, which may be newer than `current()`.
    pub fn latest(&self) -> Arc<Status> {
        self.receiver.borrow().clone()
    }

    /// Whether a change is waiting to be picked up by `changed()`.
    pub fn has_changed(&self) -> bool {
        self.receiver.has_changed().unwrap_or(false)
    }

    /// Wait for the next change, returning the new snapshot.
    /// Returns `None` once the store has been dropped.
    pub async fn changed(&mut self) -> Option<Arc<Status>> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = snap.clone();
        Some(snap)
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> StatusWatchStream {
        StatusWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter yielding each new visible status.
pub struct StatusWatchStream {
    inner: WatchStream<Arc<Status>>,
}

impl Stream for StatusWatchStream {
    type Item = Arc<Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
