//! Connection management for pipelink.
//!
//! A [`Server`] binds an endpoint name and serves any number of clients
//! (or exactly one, in [`ServerMode::Single`]); a [`Client`] connects to it
//! and transparently re-establishes the link when it drops. Both own
//! [`Connection`]s, each with one read task and a serialized writer, and
//! report everything that happens through an [`Events`] stream.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod server;

pub use client::Client;
pub use config::{ClientConfig, ConnectionOptions, ReconnectPolicy, ServerConfig, ServerMode};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{ErrorKind, PeerError, Result};
pub use events::{Event, Events};
pub use server::Server;

pub use pipelink_format::{FormatError, Formatter, JsonFormatter, RawFormatter};
pub use pipelink_transport::Endpoint;
pub use tokio_util::sync::CancellationToken;
