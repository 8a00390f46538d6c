//! Batch of decoded events plus its single-shot acknowledgement signal.
//!
//! A [`Batch`] is the server-side representation of one window read off a
//! connection. It is cheaply cloneable; all clones share the event list,
//! the source metadata and the ACK signal. The connection's ACK loop holds
//! one clone and waits on [`Batch::acked`], the consumer receives another
//! through the sink channel and calls [`Batch::ack`] once the events are
//! safely handed off.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::tls::TlsState;

/// A single decoded event.
///
/// The server treats events as opaque: whatever the injected decoder
/// returns is stored and forwarded unchanged. v1 key/value frames are
/// materialized as JSON objects with string values.
pub type Event = serde_json::Value;

struct BatchInner {
    events: Vec<Event>,
    remote_addr: Option<String>,
    tls_state: Option<TlsState>,
    ack_tx: watch::Sender<bool>,
    ack_rx: watch::Receiver<bool>,
}

/// An ordered, immutable batch of events awaiting acknowledgement.
#[derive(Clone)]
pub struct Batch {
    inner: Arc<BatchInner>,
}

impl Batch {
    /// Create a batch without source metadata.
    pub fn new(events: Vec<Event>) -> Self {
        Self::with_source(events, None, None)
    }

    /// Create a batch carrying the peer address and TLS snapshot of the
    /// connection it was read from.
    ///
    /// `events` must be non-empty: empty windows never produce a batch.
    pub fn with_source(
        events: Vec<Event>,
        remote_addr: Option<String>,
        tls_state: Option<TlsState>,
    ) -> Self {
        debug_assert!(!events.is_empty(), "a batch carries at least one event");
        let (ack_tx, ack_rx) = watch::channel(false);
        Self {
            inner: Arc::new(BatchInner {
                events,
                remote_addr,
                tls_state,
                ack_tx,
                ack_rx,
            }),
        }
    }

    /// The events of this batch, in wire order.
    #[inline]
    pub fn events(&self) -> &[Event] {
        &self.inner.events
    }

    /// Number of events in this batch. Equals the window size the peer
    /// announced, and the count carried by the eventual ACK frame.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.events.len()
    }

    /// Always false for batches produced by the server; present for
    /// completeness alongside [`len`](Self::len).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.events.is_empty()
    }

    /// Remote address of the peer connection, if known.
    #[inline]
    pub fn remote_addr(&self) -> Option<&str> {
        self.inner.remote_addr.as_deref()
    }

    /// Snapshot of the TLS connection state, if the transport was secured.
    #[inline]
    pub fn tls_state(&self) -> Option<&TlsState> {
        self.inner.tls_state.as_ref()
    }

    /// Acknowledge this batch.
    ///
    /// Single-shot: the first call transitions the signal to *acknowledged*
    /// and releases the pending ACK frame for this connection. Further
    /// calls have no observable effect.
    pub fn ack(&self) {
        self.inner.ack_tx.send_replace(true);
    }

    /// Wait until [`ack`](Self::ack) has been called.
    ///
    /// Completes immediately if the batch is already acknowledged.
    pub async fn acked(&self) {
        let mut rx = self.inner.ack_rx.clone();
        // The sender lives in the same inner, so wait_for cannot fail
        // while `self` is alive.
        let _ = rx.wait_for(|acked| *acked).await;
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("events", &self.inner.events.len())
            .field("remote_addr", &self.inner.remote_addr)
            .field("acked", &*self.inner.ack_rx.borrow())
            .finish()
    }
}
