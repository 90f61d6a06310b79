//! Framed, reconnecting local IPC.
//!
//! A server binds an endpoint name (a Unix domain socket, or a named pipe on
//! Windows) and serves any number of clients; each side exchanges discrete,
//! length-prefixed messages, and clients re-establish dropped links on their
//! own.
//!
//! # Crate Structure
//!
//! - [`transport`]: endpoint names, listeners and local streams
//! - [`frame`]: the length-prefixed wire format, frame reader and writer
//! - [`format`]: converting application values to and from payloads
//! - [`peer`]: connections, server and client (behind the `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use pipelink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use pipelink_frame::*;
}

/// Re-export formatter types.
pub mod format {
    pub use pipelink_format::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use pipelink_peer::*;
}
