//! Conversion between application values and frame payloads.
//!
//! A [`Formatter`] is injected once when a server or client is built and is
//! used for every message on every connection it owns.

pub mod error;
pub mod json;
pub mod raw;

use bytes::Bytes;

pub use error::{FormatError, Result};
pub use json::JsonFormatter;
pub use raw::RawFormatter;

/// Serializes values of `T` into payload bytes and back.
///
/// Implementations must be usable from many connections at once.
pub trait Formatter<T>: Send + Sync {
    /// Encode `value` as a payload.
    fn serialize(&self, value: &T) -> Result<Bytes>;

    /// Decode a payload received from the peer.
    fn deserialize(&self, payload: &[u8]) -> Result<T>;

    /// Short name used in errors and logs.
    fn name(&self) -> &'static str;
}
