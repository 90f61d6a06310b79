use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;

use crate::connection::ConnectionId;
use crate::error::PeerError;

/// Something that happened on a server or client.
#[derive(Debug, Clone)]
pub enum Event<T> {
    /// A connection is established and ready for writes.
    Connected { connection: ConnectionId },
    /// A connection ended. Emitted exactly once per connection.
    Disconnected { connection: ConnectionId },
    /// A complete message arrived.
    MessageReceived { connection: ConnectionId, message: T },
    /// An operation failed. `connection` is `None` for failures not tied
    /// to one connection (accept, connect, reconnect, `NotConnected`).
    ExceptionOccurred {
        connection: Option<ConnectionId>,
        error: PeerError,
    },
}

impl<T> Event<T> {
    /// The connection this event concerns, if any.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Event::Connected { connection }
            | Event::Disconnected { connection }
            | Event::MessageReceived { connection, .. } => Some(*connection),
            Event::ExceptionOccurred { connection, .. } => *connection,
        }
    }
}

/// Receiving end of a server's or client's events.
///
/// Events are queued without bound until taken; keep draining this stream
/// for as long as the owner is running.
pub struct Events<T> {
    rx: mpsc::UnboundedReceiver<Event<T>>,
}

impl<T> Events<T> {
    /// Wait for the next event. `None` once the owner and all of its
    /// connections are gone.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event<T>> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Events<T> {
    type Item = Event<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> std::fmt::Debug for Events<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events").finish_non_exhaustive()
    }
}

pub(crate) struct EventSender<T> {
    tx: mpsc::UnboundedSender<Event<T>>,
}

impl<T> EventSender<T> {
    /// Queue an event. Dropped silently if nobody listens any more.
    pub(crate) fn emit(&self, event: Event<T>) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn exception(&self, connection: Option<ConnectionId>, error: PeerError) {
        self.emit(Event::ExceptionOccurred { connection, error });
    }
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub(crate) fn channel<T>() -> (EventSender<T>, Events<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, Events { rx })
}
