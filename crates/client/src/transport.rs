//! Transport boundary.
//!
//! The connection manager is the only component that touches this boundary.
//! A `Connector` produces a `TransportLink` per connection attempt: an
//! outbound frame sender plus a receiver of transport events. The actual
//! wire (WebSocket, QUIC, in-memory pair) lives behind the trait; encryption
//! and authentication are the connector's problem.

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error establishing or using a raw transport.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Events surfaced by a transport link.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The link is established and frames can flow.
    Opened,
    /// An inbound frame arrived.
    Frame(Bytes),
    /// The link closed, cleanly or not.
    Closed { code: Option<u16>, reason: String },
    /// The link errored; a `Closed` usually follows.
    Error(String),
}

/// One established (or establishing) transport connection.
pub struct TransportLink {
    /// Frames to put on the wire.
    pub outbound: mpsc::Sender<Bytes>,
    /// Events coming off the wire.
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Factory for transport links. Called once per connection attempt, so each
/// reconnect gets a fresh link.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<TransportLink, TransportError>>;
}

pub mod memory {
    //! In-memory connector used by tests and examples to play the remote side.

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use futures::future::BoxFuture;
    use tokio::sync::mpsc;

    use super::{Connector, TransportError, TransportEvent, TransportLink};

    const CHANNEL_CAPACITY: usize = 256;

    /// The server half of an in-memory link, handed to the test harness on
    /// every successful `connect`.
    pub struct ServerEnd {
        /// Push events (frames, close, errors) toward the client.
        pub to_client: mpsc::Sender<TransportEvent>,
        /// Frames the client put on the wire.
        pub from_client: mpsc::Receiver<Bytes>,
    }

    /// Connector whose links are channel pairs. Each successful connect
    /// delivers a [`ServerEnd`] on the accept channel; `fail_next` makes the
    /// following attempts fail, for exercising the backoff path.
    pub struct MemoryConnector {
        accept_tx: mpsc::UnboundedSender<ServerEnd>,
        fail_remaining: Arc<AtomicU32>,
        /// Emit `Opened` immediately on connect (on by default).
        auto_open: bool,
    }

    impl MemoryConnector {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
            let (accept_tx, accept_rx) = mpsc::unbounded_channel();
            (
                Self {
                    accept_tx,
                    fail_remaining: Arc::new(AtomicU32::new(0)),
                    auto_open: true,
                },
                accept_rx,
            )
        }

        /// Do not emit `Opened` automatically; the harness drives it.
        pub fn manual_open(mut self) -> Self {
            self.auto_open = false;
            self
        }

        /// Make the next `n` connect attempts fail.
        pub fn fail_next(&self, n: u32) {
            self.fail_remaining.store(n, Ordering::SeqCst);
        }
    }

    impl Connector for MemoryConnector {
        fn connect(&self, _url: &str) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
            let accept_tx = self.accept_tx.clone();
            let fail_remaining = self.fail_remaining.clone();
            let auto_open = self.auto_open;
            Box::pin(async move {
                if fail_remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(TransportError("connection refused".to_string()));
                }

                let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
                let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

                if auto_open {
                    let _ = event_tx.send(TransportEvent::Opened).await;
                }

                let _ = accept_tx.send(ServerEnd {
                    to_client: event_tx,
                    from_client: outbound_rx,
                });

                Ok(TransportLink {
                    outbound: outbound_tx,
                    events: event_rx,
                })
            })
        }
    }
}
