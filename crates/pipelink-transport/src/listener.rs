use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::traits::IpcStream;

const FREE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Options applied when binding an endpoint.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Permission bits for the socket file (Unix only).
    pub socket_mode: u32,
    /// When set, wait up to this long for a live server on the same name to
    /// go away before binding, instead of failing immediately.
    pub wait_free: Option<Duration>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            socket_mode: 0o600,
            wait_free: None,
        }
    }
}

impl ListenerOptions {
    pub fn with_socket_mode(mut self, mode: u32) -> Self {
        self.socket_mode = mode;
        self
    }

    pub fn with_wait_free(mut self, timeout: Duration) -> Self {
        self.wait_free = Some(timeout);
        self
    }
}

/// A bound endpoint accepting [`IpcStream`] connections.
#[derive(Debug)]
pub struct IpcListener {
    endpoint: Endpoint,
    #[cfg(unix)]
    inner: crate::uds::UnixDomainSocket,
    #[cfg(windows)]
    inner: crate::named_pipe::NamedPipeEndpoint,
}

impl IpcListener {
    /// Bind `endpoint`.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(endpoint: &Endpoint, options: &ListenerOptions) -> Result<Self> {
        if let Some(timeout) = options.wait_free {
            wait_until_free(endpoint, timeout).await;
        }

        #[cfg(unix)]
        let inner =
            crate::uds::UnixDomainSocket::bind_with_mode(endpoint.socket_path(), options.socket_mode)?;
        #[cfg(windows)]
        let inner = crate::named_pipe::NamedPipeEndpoint::bind(endpoint.pipe_name())?;

        Ok(Self {
            endpoint: endpoint.clone(),
            inner,
        })
    }

    /// Wait for the next client.
    pub async fn accept(&self) -> Result<IpcStream> {
        self.inner.accept().await
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        self.inner.transport_name()
    }
}

/// Connect to the server bound on `endpoint`.
pub async fn connect(endpoint: &Endpoint) -> Result<IpcStream> {
    #[cfg(unix)]
    {
        crate::uds::UnixDomainSocket::connect(endpoint.socket_path()).await
    }
    #[cfg(windows)]
    {
        crate::named_pipe::NamedPipeEndpoint::connect(&endpoint.pipe_name()).await
    }
    #[cfg(not(any(unix, windows)))]
    {
        Err(crate::error::TransportError::Connect {
            endpoint: endpoint.address(),
            source: std::io::Error::from(std::io::ErrorKind::Unsupported),
        })
    }
}

/// True if a server currently answers on `endpoint`.
pub fn is_live(endpoint: &Endpoint) -> bool {
    #[cfg(unix)]
    {
        crate::uds::UnixDomainSocket::is_live(endpoint.socket_path())
    }
    #[cfg(windows)]
    {
        crate::named_pipe::NamedPipeEndpoint::is_live(&endpoint.pipe_name())
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = endpoint;
        false
    }
}

async fn wait_until_free(endpoint: &Endpoint, timeout: Duration) {
    if !is_live(endpoint) {
        return;
    }
    debug!(endpoint = %endpoint, ?timeout, "endpoint in use, waiting for it to free up");
    let deadline = Instant::now() + timeout;
    loop {
        if Instant::now() >= deadline {
            // bind reports the conflict
            debug!(endpoint = %endpoint, "endpoint still in use after wait");
            return;
        }
        tokio::time::sleep(FREE_POLL_INTERVAL).await;
        if !is_live(endpoint) {
            return;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_endpoint(tag: &str) -> (Endpoint, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("pipelink-lst-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        (Endpoint::new("data_test_pipe").unwrap().in_directory(&dir), dir)
    }

    #[tokio::test]
    async fn bind_accept_connect_by_name() {
        let (endpoint, dir) = test_endpoint("basic");
        let listener = IpcListener::bind(&endpoint, &ListenerOptions::default())
            .await
            .unwrap();
        assert_eq!(listener.transport_name(), "unix-domain-socket");

        let ep = endpoint.clone();
        let client = tokio::spawn(async move {
            let mut stream = connect(&ep).await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        client.await.unwrap();

        assert!(is_live(&endpoint));
        drop(listener);
        assert!(!is_live(&endpoint));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn second_bind_fails_without_wait_free() {
        let (endpoint, dir) = test_endpoint("busy");
        let _first = IpcListener::bind(&endpoint, &ListenerOptions::default())
            .await
            .unwrap();
        let second = IpcListener::bind(&endpoint, &ListenerOptions::default()).await;
        assert!(matches!(second, Err(TransportError::Bind { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn wait_free_binds_after_previous_server_leaves() {
        let (endpoint, dir) = test_endpoint("wait-free");
        let first = IpcListener::bind(&endpoint, &ListenerOptions::default())
            .await
            .unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(first);
        });

        let options = ListenerOptions::default().with_wait_free(Duration::from_secs(5));
        let second = IpcListener::bind(&endpoint, &options).await;
        assert!(second.is_ok(), "bind should succeed once the name is free");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn wait_free_gives_up_after_timeout() {
        let (endpoint, dir) = test_endpoint("wait-timeout");
        let _first = IpcListener::bind(&endpoint, &ListenerOptions::default())
            .await
            .unwrap();

        let options = ListenerOptions::default().with_wait_free(Duration::from_millis(100));
        let second = IpcListener::bind(&endpoint, &options).await;
        assert!(matches!(second, Err(TransportError::Bind { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
