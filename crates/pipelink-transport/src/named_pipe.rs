use std::time::Duration;

use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};
use tokio::sync::Mutex;
use tracing::{debug, info};
use windows_sys::Win32::Foundation::{ERROR_ACCESS_DENIED, ERROR_PIPE_BUSY};

use crate::error::{Result, TransportError};
use crate::traits::IpcStream;

const BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Windows named pipe transport.
///
/// Keeps one pending server instance so that a client can always find a pipe
/// to open; each accepted connection is replaced by a fresh instance.
pub struct NamedPipeEndpoint {
    name: String,
    pending: Mutex<NamedPipeServer>,
}

impl NamedPipeEndpoint {
    /// Create the first instance of `name`.
    ///
    /// Fails with `AccessDenied` if another server already owns the name.
    pub fn bind(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&name)
            .map_err(|e| TransportError::Bind {
                endpoint: name.clone(),
                source: e,
            })?;
        info!(pipe = %name, "listening on named pipe");
        Ok(Self {
            name,
            pending: Mutex::new(server),
        })
    }

    /// True if some server currently owns `name`.
    ///
    /// Tries to claim the first instance instead of opening a client end,
    /// so a live server never sees a connection.
    pub fn is_live(name: &str) -> bool {
        match ServerOptions::new().first_pipe_instance(true).create(name) {
            Ok(_) => false,
            Err(e) => e.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32),
        }
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> Result<IpcStream> {
        let mut pending = self.pending.lock().await;
        pending.connect().await.map_err(TransportError::Accept)?;
        let next = ServerOptions::new()
            .create(&self.name)
            .map_err(TransportError::Accept)?;
        let connected = std::mem::replace(&mut *pending, next);
        debug!(pipe = %self.name, "accepted connection");
        Ok(IpcStream::from_pipe_server(connected))
    }

    /// Open a client end of `name`, waiting while all instances are busy.
    pub async fn connect(name: &str) -> Result<IpcStream> {
        loop {
            match ClientOptions::new().open(name) {
                Ok(client) => {
                    debug!(pipe = %name, "connected to named pipe");
                    return Ok(IpcStream::from_pipe_client(client));
                }
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) => {
                    tokio::time::sleep(BUSY_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(TransportError::Connect {
                        endpoint: name.to_string(),
                        source: e,
                    })
                }
            }
        }
    }

    /// The pipe path this endpoint serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "named-pipe"
    }
}

impl std::fmt::Debug for NamedPipeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedPipeEndpoint")
            .field("name", &self.name)
            .finish()
    }
}
