use std::time::Duration;

use pipelink_frame::FrameConfig;
use pipelink_transport::{Endpoint, ListenerOptions};

/// Default time allowed for a connect attempt, retries included.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default pause between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(100);
/// Default time a graceful close may wait for an in-flight write.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How many clients a server serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    /// Accept clients until stopped.
    #[default]
    Multi,
    /// Accept exactly one client, then stop listening.
    Single,
}

/// Behaviour of each individual connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub frame: FrameConfig,
    /// Close the connection when an incoming message fails to deserialize.
    pub close_on_format_error: bool,
    pub shutdown_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            close_on_format_error: false,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ConnectionOptions {
    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_close_on_format_error(mut self, close: bool) -> Self {
        self.close_on_format_error = close;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    pub mode: ServerMode,
    /// Wait for a previous server on the same name to go away before
    /// binding, instead of failing with "address in use".
    pub wait_free_endpoint: bool,
    /// Upper bound for the `wait_free_endpoint` wait.
    pub bind_wait_timeout: Duration,
    /// Permission bits of the socket file (Unix only).
    pub socket_mode: u32,
    pub connection: ConnectionOptions,
}

impl ServerConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            mode: ServerMode::Multi,
            wait_free_endpoint: false,
            bind_wait_timeout: DEFAULT_CONNECT_TIMEOUT,
            socket_mode: ListenerOptions::default().socket_mode,
            connection: ConnectionOptions::default(),
        }
    }

    /// A server that accepts exactly one client.
    pub fn single_connection(endpoint: Endpoint) -> Self {
        Self::new(endpoint).with_mode(ServerMode::Single)
    }

    pub fn with_mode(mut self, mode: ServerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_wait_free_endpoint(mut self, wait: bool) -> Self {
        self.wait_free_endpoint = wait;
        self
    }

    pub fn with_bind_wait_timeout(mut self, timeout: Duration) -> Self {
        self.bind_wait_timeout = timeout;
        self
    }

    pub fn with_socket_mode(mut self, mode: u32) -> Self {
        self.socket_mode = mode;
        self
    }

    pub fn with_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.connection.frame = frame;
        self
    }

    pub(crate) fn listener_options(&self) -> ListenerOptions {
        let options = ListenerOptions::default().with_socket_mode(self.socket_mode);
        if self.wait_free_endpoint {
            options.with_wait_free(self.bind_wait_timeout)
        } else {
            options
        }
    }
}

/// When and how a client re-establishes a dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub connection: ConnectionOptions,
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection: ConnectionOptions::default(),
        }
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn without_reconnect(self) -> Self {
        self.with_reconnect(ReconnectPolicy::disabled())
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }

    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.connection.frame = frame;
        self
    }
}
