use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use pipelink_format::{Formatter, RawFormatter};
use pipelink_transport::IpcStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{PeerError, Result};
use crate::events::{self, EventSender, Events};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

struct ClientShared<T> {
    config: ClientConfig,
    formatter: Arc<dyn Formatter<T>>,
    events: EventSender<T>,
    current: RwLock<Option<Arc<Connection<T>>>>,
}

impl<T: Send + 'static> ClientShared<T> {
    fn current(&self) -> Option<Arc<Connection<T>>> {
        self.current.read().ok().and_then(|slot| slot.clone())
    }

    fn replace(&self, next: Option<Arc<Connection<T>>>) -> Option<Arc<Connection<T>>> {
        match self.current.write() {
            Ok(mut slot) => std::mem::replace(&mut *slot, next),
            Err(_) => None,
        }
    }

    /// The current connection if it is still usable, else report `NotConnected`.
    fn live(&self) -> Result<Arc<Connection<T>>> {
        match self.current() {
            Some(connection) if connection.is_connected() => Ok(connection),
            _ => {
                self.events.exception(None, PeerError::NotConnected);
                Err(PeerError::NotConnected)
            }
        }
    }

    /// Open a stream to the endpoint, retrying while no server is there
    /// yet, and wrap it in a connection that has not started reading.
    async fn establish(&self, cancel: &CancellationToken) -> Result<Arc<Connection<T>>> {
        let limit = self.config.connect_timeout;
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PeerError::Cancelled),
            attempt = tokio::time::timeout(limit, self.open()) => {
                attempt.map_err(|_| PeerError::Timeout(limit))??
            }
        };
        Ok(Arc::new(Connection::establish(
            stream,
            Arc::clone(&self.formatter),
            self.config.connection.clone(),
            self.events.clone(),
        )))
    }

    async fn open(&self) -> Result<IpcStream> {
        let endpoint = &self.config.endpoint;
        loop {
            match pipelink_transport::connect(endpoint).await {
                Ok(stream) => return Ok(stream),
                Err(err) if err.is_unavailable() => {
                    trace!(endpoint = %endpoint, "endpoint not available yet");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Connects to a server endpoint and keeps the link alive.
///
/// With reconnect enabled, a supervisor task notices when the connection
/// ends and replaces it with a fresh one after the configured delay, for as
/// long as the client is not disconnected. Writes never queue across a
/// gap: while no connection is live they fail with `NotConnected`.
pub struct Client<T> {
    shared: Arc<ClientShared<T>>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl<T: Send + 'static> Client<T> {
    pub fn new<F>(config: ClientConfig, formatter: F) -> (Self, Events<T>)
    where
        F: Formatter<T> + 'static,
    {
        Self::with_formatter(config, Arc::new(formatter))
    }

    pub fn with_formatter(config: ClientConfig, formatter: Arc<dyn Formatter<T>>) -> (Self, Events<T>) {
        let (tx, rx) = events::channel();
        let client = Self {
            shared: Arc::new(ClientShared {
                config,
                formatter,
                events: tx,
                current: RwLock::new(None),
            }),
            supervisor: Mutex::new(None),
        };
        (client, rx)
    }

    /// Connect to the server.
    ///
    /// Keeps retrying while the endpoint does not exist or refuses, until
    /// `connect_timeout` elapses. Cancelling `cancel` aborts the attempt and,
    /// later, stops reconnecting.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        let supervising = supervisor
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished());
        let connected = self.shared.current().is_some_and(|c| c.is_connected());
        if supervising || connected {
            return Err(PeerError::AlreadyRunning("client"));
        }

        let connection = match self.shared.establish(cancel).await {
            Ok(connection) => connection,
            Err(err) => {
                self.shared.events.exception(None, err.clone());
                return Err(err);
            }
        };
        self.shared.replace(Some(Arc::clone(&connection)));
        connection.start();
        info!(
            endpoint = %self.shared.config.endpoint,
            connection = %connection.id(),
            format = self.shared.formatter.name(),
            "connected"
        );

        if self.shared.config.reconnect.enabled {
            let supervisor_cancel = cancel.child_token();
            let handle = tokio::spawn(supervise(
                Arc::clone(&self.shared),
                connection,
                supervisor_cancel.clone(),
            ));
            *supervisor = Some(Supervisor {
                cancel: supervisor_cancel,
                handle,
            });
        }
        Ok(())
    }

    /// Stop reconnecting and close the current connection gracefully.
    pub async fn disconnect(&self) {
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            supervisor.cancel.cancel();
            let _ = supervisor.handle.await;
        }
        if let Some(connection) = self.shared.replace(None) {
            connection.shutdown().await;
            debug!(connection = %connection.id(), "disconnected");
        }
    }

    /// Serialize `value` and send it on the current connection.
    pub async fn send(&self, value: &T, cancel: &CancellationToken) -> Result<()> {
        self.shared.live()?.send(value, cancel).await
    }

    /// Send a raw payload, bypassing the formatter.
    pub async fn write_raw(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.shared.live()?.write_raw(payload, cancel).await
    }

    /// Send `buffer[offset..offset + length]` as one message.
    pub async fn write_raw_range(
        &self,
        buffer: &[u8],
        offset: usize,
        length: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.shared
            .live()?
            .write_raw_range(buffer, offset, length, cancel)
            .await
    }

    /// Wait until the server has read everything sent so far.
    pub async fn wait_for_drain(&self, cancel: &CancellationToken) -> Result<()> {
        self.shared.live()?.wait_for_drain(cancel).await
    }

    pub fn is_connected(&self) -> bool {
        self.shared.current().is_some_and(|c| c.is_connected())
    }

    /// Id of the current connection, live or not.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.shared.current().map(|c| c.id())
    }

    pub fn connection(&self) -> Option<Arc<Connection<T>>> {
        self.shared.current()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

impl Client<Bytes> {
    /// A client that hands payloads to the application unchanged.
    pub fn raw(config: ClientConfig) -> (Self, Events<Bytes>) {
        Self::new(config, RawFormatter)
    }
}

impl<T> Drop for Client<T> {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.cancel.cancel();
        }
        if let Ok(slot) = self.shared.current.read() {
            if let Some(connection) = slot.as_ref() {
                connection.abort();
            }
        }
    }
}

impl<T> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.shared.config.endpoint)
            .finish_non_exhaustive()
    }
}

async fn supervise<T: Send + 'static>(
    shared: Arc<ClientShared<T>>,
    mut connection: Arc<Connection<T>>,
    cancel: CancellationToken,
) {
    let delay = shared.config.reconnect.delay;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = connection.closed() => {}
        }
        debug!(connection = %connection.id(), ?delay, "connection lost; reconnecting");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match shared.establish(&cancel).await {
                Ok(next) => {
                    shared.replace(Some(Arc::clone(&next)));
                    next.start();
                    info!(connection = %next.id(), "reconnected");
                    connection = next;
                    break;
                }
                Err(PeerError::Cancelled) => return,
                Err(err) => {
                    debug!(error = %err, "reconnect attempt failed");
                    shared.events.exception(None, err);
                }
            }
        }
    }
}
