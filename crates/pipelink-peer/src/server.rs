use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use pipelink_format::{Formatter, RawFormatter};
use pipelink_transport::IpcListener;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, ServerMode};
use crate::connection::{Connection, ConnectionId};
use crate::error::{PeerError, Result};
use crate::events::{self, Event, EventSender, Events};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type ConnectionMap<T> = RwLock<HashMap<ConnectionId, Arc<Connection<T>>>>;

struct ServerInner<T> {
    config: ServerConfig,
    formatter: Arc<dyn Formatter<T>>,
    events: EventSender<T>,
    connections: ConnectionMap<T>,
}

impl<T: Send + 'static> ServerInner<T> {
    fn get(&self, id: ConnectionId) -> Option<Arc<Connection<T>>> {
        self.connections
            .read()
            .ok()
            .and_then(|map| map.get(&id).cloned())
    }

    fn insert(&self, connection: Arc<Connection<T>>) {
        if let Ok(mut map) = self.connections.write() {
            map.insert(connection.id(), connection);
        }
    }

    fn remove(&self, id: ConnectionId) -> Option<Arc<Connection<T>>> {
        self.connections
            .write()
            .ok()
            .and_then(|mut map| map.remove(&id))
    }

    fn snapshot(&self) -> Vec<Arc<Connection<T>>> {
        self.connections
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    fn drain(&self) -> Vec<Arc<Connection<T>>> {
        self.connections
            .write()
            .map(|mut map| map.drain().map(|(_, connection)| connection).collect())
            .unwrap_or_default()
    }

    /// Forward a connection event to the application, dropping the map
    /// entry of connections that ended.
    fn forward(&self, event: Event<T>) {
        if let Event::Disconnected { connection } = &event {
            self.remove(*connection);
        }
        self.events.emit(event);
    }
}

struct Running {
    accept_cancel: CancellationToken,
    dispatch_cancel: CancellationToken,
    accept: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

/// Listens on an endpoint and serves every client that connects.
///
/// Each client gets its own [`Connection`]; their events are merged into
/// the [`Events`] stream returned by [`Server::new`].
pub struct Server<T> {
    inner: Arc<ServerInner<T>>,
    running: Mutex<Option<Running>>,
}

impl<T: Send + 'static> Server<T> {
    pub fn new<F>(config: ServerConfig, formatter: F) -> (Self, Events<T>)
    where
        F: Formatter<T> + 'static,
    {
        Self::with_formatter(config, Arc::new(formatter))
    }

    pub fn with_formatter(config: ServerConfig, formatter: Arc<dyn Formatter<T>>) -> (Self, Events<T>) {
        let (tx, rx) = events::channel();
        let server = Self {
            inner: Arc::new(ServerInner {
                config,
                formatter,
                events: tx,
                connections: RwLock::new(HashMap::new()),
            }),
            running: Mutex::new(None),
        };
        (server, rx)
    }

    /// Bind the endpoint and start accepting clients.
    ///
    /// Returns once the endpoint is listening. Cancelling `cancel` aborts
    /// the bind, and later stops accepting new clients; connections that
    /// are already established stay up until [`Server::stop`].
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(PeerError::AlreadyRunning("server"));
        }

        let config = &self.inner.config;
        let options = config.listener_options();
        let listener = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PeerError::Cancelled),
            bound = IpcListener::bind(&config.endpoint, &options) => bound,
        }
        .map_err(|e| {
            let error = PeerError::from(e);
            self.inner.events.exception(None, error.clone());
            error
        })?;
        info!(
            endpoint = %config.endpoint,
            address = %config.endpoint.address(),
            mode = ?config.mode,
            format = self.inner.formatter.name(),
            transport = listener.transport_name(),
            "server listening"
        );

        let (internal_tx, internal_rx) = events::channel();
        let accept_cancel = cancel.child_token();
        let dispatch_cancel = CancellationToken::new();

        let accept = tokio::spawn(accept_loop(
            Arc::clone(&self.inner),
            listener,
            internal_tx,
            accept_cancel.clone(),
        ));
        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&self.inner),
            internal_rx,
            dispatch_cancel.clone(),
        ));

        *running = Some(Running {
            accept_cancel,
            dispatch_cancel,
            accept,
            dispatch,
        });
        Ok(())
    }

    /// Stop accepting, close every connection gracefully and wait for all
    /// of it to finish. Pending events are delivered before this returns.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.accept_cancel.cancel();
        let _ = running.accept.await;

        let mut closing = JoinSet::new();
        for connection in self.inner.drain() {
            closing.spawn(async move { connection.shutdown().await });
        }
        while closing.join_next().await.is_some() {}

        running.dispatch_cancel.cancel();
        let _ = running.dispatch.await;
        info!(endpoint = %self.inner.config.endpoint, "server stopped");
    }

    /// Send `value` to one client.
    pub async fn write_to(
        &self,
        id: ConnectionId,
        value: &T,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.lookup(id)?.send(value, cancel).await
    }

    /// Send a raw payload to one client, bypassing the formatter.
    pub async fn write_raw_to(
        &self,
        id: ConnectionId,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.lookup(id)?.write_raw(payload, cancel).await
    }

    /// Send `value` to every connected client.
    ///
    /// The value is serialized once. Delivery is attempted on every
    /// connection independently; one failing client does not affect the
    /// others. Results are ordered by connection id.
    pub async fn broadcast(
        &self,
        value: &T,
        cancel: &CancellationToken,
    ) -> Result<Vec<(ConnectionId, Result<()>)>> {
        let payload = self.inner.formatter.serialize(value).map_err(|e| {
            let error = PeerError::from(e);
            self.inner.events.exception(None, error.clone());
            error
        })?;
        Ok(self.broadcast_raw(payload, cancel).await)
    }

    /// Send a raw payload to every connected client.
    pub async fn broadcast_raw(
        &self,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Vec<(ConnectionId, Result<()>)> {
        let mut writes = JoinSet::new();
        for connection in self.inner.snapshot() {
            let payload = payload.clone();
            let cancel = cancel.clone();
            writes.spawn(async move {
                let result = connection.write_raw(&payload, &cancel).await;
                (connection.id(), result)
            });
        }

        let mut results = Vec::with_capacity(writes.len());
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "broadcast write task failed"),
            }
        }
        results.sort_by_key(|(id, _)| *id);
        results
    }

    /// Close one client's connection gracefully.
    pub async fn kick(&self, id: ConnectionId) -> Result<()> {
        let connection = self.inner.remove(id).ok_or_else(|| self.unknown(id))?;
        debug!(connection = %id, "closing connection on request");
        connection.shutdown().await;
        Ok(())
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection<T>>> {
        self.inner.get(id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .inner
            .snapshot()
            .iter()
            .map(|connection| connection.id())
            .collect();
        ids.sort();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .map(|map| map.len())
            .unwrap_or(0)
    }

    /// True between a successful [`Server::start`] and [`Server::stop`].
    pub fn is_running(&self) -> bool {
        self.running
            .try_lock()
            .map(|running| running.is_some())
            .unwrap_or(true)
    }

    /// True while the accept loop takes new clients.
    pub fn is_accepting(&self) -> bool {
        self.running
            .try_lock()
            .map(|running| running.as_ref().is_some_and(|r| !r.accept.is_finished()))
            .unwrap_or(false)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    fn lookup(&self, id: ConnectionId) -> Result<Arc<Connection<T>>> {
        self.inner.get(id).ok_or_else(|| self.unknown(id))
    }

    fn unknown(&self, id: ConnectionId) -> PeerError {
        let error = PeerError::UnknownConnection(id);
        self.inner.events.exception(Some(id), error.clone());
        error
    }
}

impl Server<Bytes> {
    /// A server that hands payloads to the application unchanged.
    pub fn raw(config: ServerConfig) -> (Self, Events<Bytes>) {
        Self::new(config, RawFormatter)
    }
}

impl<T> Drop for Server<T> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.accept_cancel.cancel();
            running.dispatch_cancel.cancel();
        }
        if let Ok(map) = self.inner.connections.read() {
            for connection in map.values() {
                connection.abort();
            }
        }
    }
}

impl<T> std::fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("endpoint", &self.inner.config.endpoint)
            .field("mode", &self.inner.config.mode)
            .finish_non_exhaustive()
    }
}

async fn accept_loop<T: Send + 'static>(
    inner: Arc<ServerInner<T>>,
    listener: IpcListener,
    events: EventSender<T>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(stream) => {
                let connection = Arc::new(Connection::establish(
                    stream,
                    Arc::clone(&inner.formatter),
                    inner.config.connection.clone(),
                    events.clone(),
                ));
                // Registered before Connected is emitted so the id is usable at once.
                inner.insert(Arc::clone(&connection));
                connection.start();
                info!(connection = %connection.id(), "client connected");

                if inner.config.mode == ServerMode::Single {
                    debug!("single-connection server; no longer accepting");
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                events.exception(None, err.into());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    drop(listener);
    debug!(endpoint = %inner.config.endpoint, "accept loop finished");
}

async fn dispatch_loop<T: Send + 'static>(
    inner: Arc<ServerInner<T>>,
    mut internal: Events<T>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = internal.recv() => event,
            _ = cancel.cancelled() => break,
        };
        match event {
            Some(event) => inner.forward(event),
            None => return,
        }
    }
    while let Some(event) = internal.try_recv() {
        inner.forward(event);
    }
}
