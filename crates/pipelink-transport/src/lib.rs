//! Local IPC transport for pipelink.
//!
//! Resolves an endpoint name to a platform address and provides async
//! duplex streams over it:
//! - Unix domain sockets (Linux/macOS)
//! - Named pipes (Windows)
//!
//! This is the lowest layer of pipelink. Everything else builds on top of
//! the [`IpcStream`] type and its split halves.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod traits;

#[cfg(unix)]
pub mod uds;

#[cfg(windows)]
pub mod named_pipe;

pub use endpoint::{Endpoint, SOCKET_DIR_ENV};
pub use error::{Result, TransportError};
pub use listener::{connect, is_live, IpcListener, ListenerOptions};
pub use traits::{DrainStatus, IpcReadHalf, IpcStream, IpcWriteHalf};

#[cfg(unix)]
pub use uds::UnixDomainSocket;

#[cfg(windows)]
pub use named_pipe::NamedPipeEndpoint;
