use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use pipelink_format::Formatter;
use pipelink_frame::{FrameReader, FrameWriter};
use pipelink_transport::{IpcReadHalf, IpcStream, IpcWriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ConnectionOptions;
use crate::error::{PeerError, Result};
use crate::events::{self, Event, EventSender, Events};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Life-cycle of a connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Ended by either side closing the stream.
    Disconnected,
    /// Ended by an I/O error or protocol violation.
    Faulted,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Disconnected | ConnectionState::Faulted => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

struct Shared<T> {
    id: ConnectionId,
    writer: FrameWriter<IpcWriteHalf>,
    formatter: Arc<dyn Formatter<T>>,
    events: EventSender<T>,
    state: watch::Sender<ConnectionState>,
    options: ConnectionOptions,
    /// Stops the read loop.
    cancel: CancellationToken,
}

impl<T> Shared<T> {
    fn advance(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if next.rank() > current.rank() {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Emit `error` for this connection and hand it back to the caller.
    fn report(&self, error: PeerError) -> PeerError {
        self.events.exception(Some(self.id), error.clone());
        error
    }
}

/// One live duplex stream to a peer.
///
/// Owns a read task that turns incoming frames into
/// [`Event::MessageReceived`] and a [`FrameWriter`] shared by every sender.
/// A connection never revives: once it reaches a terminal state a new
/// connection must be made.
pub struct Connection<T> {
    shared: Arc<Shared<T>>,
    reader: Mutex<Option<FrameReader<IpcReadHalf>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    peer_pid: Option<u32>,
}

impl<T: Send + 'static> Connection<T> {
    /// Wrap an established stream and start reading from it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        stream: IpcStream,
        formatter: Arc<dyn Formatter<T>>,
        options: ConnectionOptions,
    ) -> (Self, Events<T>) {
        let (tx, rx) = events::channel();
        let connection = Self::establish(stream, formatter, options, tx);
        connection.start();
        (connection, rx)
    }

    /// Wrap a stream without reading from it yet; see [`Connection::start`].
    pub(crate) fn establish(
        stream: IpcStream,
        formatter: Arc<dyn Formatter<T>>,
        options: ConnectionOptions,
        events: EventSender<T>,
    ) -> Self {
        let peer_pid = stream.peer_process_id();
        let (read_half, write_half) = stream.into_split();
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let shared = Arc::new(Shared {
            id: ConnectionId::next(),
            writer: FrameWriter::with_config(write_half, options.frame.clone()),
            formatter,
            events,
            state,
            options,
            cancel: CancellationToken::new(),
        });
        let reader = FrameReader::with_config(read_half, &shared.options.frame);

        Self {
            shared,
            reader: Mutex::new(Some(reader)),
            read_task: Mutex::new(None),
            peer_pid,
        }
    }

    /// Announce the connection and spawn its read loop. Idempotent.
    pub(crate) fn start(&self) {
        let Some(reader) = take(&self.reader) else {
            return;
        };
        if !self.shared.advance(ConnectionState::Connected) {
            return;
        }
        debug!(connection = %self.shared.id, pid = ?self.peer_pid, "connection established");
        self.shared.events.emit(Event::Connected {
            connection: self.shared.id,
        });

        let handle = tokio::spawn(read_loop(Arc::clone(&self.shared), reader));
        if let Ok(mut slot) = self.read_task.lock() {
            *slot = Some(handle);
        }
    }

    /// Serialize `value` and write it as one frame.
    pub async fn send(&self, value: &T, cancel: &CancellationToken) -> Result<()> {
        let payload = self
            .shared
            .formatter
            .serialize(value)
            .map_err(|e| {
                warn!(
                    connection = %self.shared.id,
                    format = self.shared.formatter.name(),
                    error = %e,
                    "failed to encode message"
                );
                self.shared.report(e.into())
            })?;
        self.write_raw(&payload, cancel).await
    }

    /// Write `payload` as one frame, bypassing the formatter.
    pub async fn write_raw(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        if !self.is_connected() {
            return Err(self.shared.report(PeerError::NotConnected));
        }
        let result = self.shared.writer.write(payload, cancel).await;
        self.finish_write(result)
    }

    /// Write `buffer[offset..offset + length]` as one frame.
    pub async fn write_raw_range(
        &self,
        buffer: &[u8],
        offset: usize,
        length: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(self.shared.report(PeerError::NotConnected));
        }
        let result = self
            .shared
            .writer
            .write_range(buffer, offset, length, cancel)
            .await;
        self.finish_write(result)
    }

    /// Wait until the peer has read everything written so far.
    ///
    /// A no-op on transports that cannot report it.
    pub async fn wait_for_drain(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.is_connected() {
            return Err(self.shared.report(PeerError::NotConnected));
        }
        self.shared
            .writer
            .wait_for_drain(cancel)
            .await
            .map_err(|e| self.shared.report(e.into()))
    }

    fn finish_write(&self, result: pipelink_frame::Result<()>) -> Result<()> {
        let Err(err) = result else {
            return Ok(());
        };
        let error = PeerError::from(err);
        // A write abandoned mid-frame closes the writer; the stream is unusable.
        if self.shared.writer.is_closed() && !self.shared.cancel.is_cancelled() {
            warn!(connection = %self.shared.id, error = %error, "write failed; closing connection");
            self.shared.advance(ConnectionState::Faulted);
            self.shared.cancel.cancel();
        }
        Err(self.shared.report(error))
    }

    /// Close gracefully: let an in-flight write finish, shut the write side
    /// down, then stop the read loop and wait for it.
    ///
    /// Falls back to [`Connection::abort`] if the in-flight write does not
    /// finish within the configured shutdown timeout.
    pub async fn shutdown(&self) {
        let limit = self.shared.options.shutdown_timeout;
        match tokio::time::timeout(limit, self.shared.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(connection = %self.shared.id, error = %err, "write side already broken")
            }
            Err(_) => {
                warn!(connection = %self.shared.id, ?limit, "graceful close timed out; aborting");
                self.shared.cancel.cancel();
                self.shared.writer.close_now();
            }
        }
        self.shared.cancel.cancel();

        // Never started: nobody else will emit the terminal events.
        if take(&self.reader).is_some() {
            self.shared.advance(ConnectionState::Disconnected);
        }

        let handle = self.read_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl<T> Connection<T> {
    /// Close immediately: pending writes fail with `Cancelled` and the read
    /// loop stops.
    pub fn abort(&self) {
        // Cancelled first so interrupted writes are not taken for faults.
        self.shared.cancel.cancel();
        self.shared.writer.close_now();
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Resolves once the connection has reached a terminal state.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }

    /// Process id of the peer, where the transport reports it.
    pub fn peer_process_id(&self) -> Option<u32> {
        self.peer_pid
    }
}

impl<T> Drop for Connection<T> {
    fn drop(&mut self) {
        self.shared.writer.close_now();
        self.shared.cancel.cancel();
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &*self.shared.state.borrow())
            .finish()
    }
}

async fn read_loop<T: Send + 'static>(shared: Arc<Shared<T>>, mut reader: FrameReader<IpcReadHalf>) {
    let id = shared.id;
    let terminal = loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break ConnectionState::Disconnected,
            frame = reader.read_frame() => frame,
        };

        match frame {
            Ok(Some(payload)) => {
                trace!(connection = %id, len = payload.len(), "frame received");
                match shared.formatter.deserialize(&payload) {
                    Ok(message) => shared.events.emit(Event::MessageReceived {
                        connection: id,
                        message,
                    }),
                    Err(err) => {
                        warn!(
                            connection = %id,
                            format = shared.formatter.name(),
                            error = %err,
                            "failed to decode message"
                        );
                        shared.events.exception(Some(id), err.into());
                        if shared.options.close_on_format_error {
                            break ConnectionState::Faulted;
                        }
                    }
                }
            }
            Ok(None) => {
                debug!(connection = %id, "peer closed the stream");
                break ConnectionState::Disconnected;
            }
            Err(err) => {
                let error = PeerError::from_read(err);
                warn!(connection = %id, error = %error, "read failed");
                shared.events.exception(Some(id), error);
                break ConnectionState::Faulted;
            }
        }
    };

    shared.writer.close();
    shared.cancel.cancel();
    shared.advance(terminal);
    debug!(connection = %id, state = ?*shared.state.borrow(), "connection closed");
    shared.events.emit(Event::Disconnected { connection: id });
}

fn take<V>(slot: &Mutex<Option<V>>) -> Option<V> {
    slot.lock().ok().and_then(|mut guard| guard.take())
}
