//! Length-prefixed message framing for IPC streams.
//!
//! Every message is framed with a 4-byte big-endian payload length followed
//! by exactly that many payload bytes. A zero-length payload is a valid frame.
//!
//! [`FrameWriter`] serializes concurrent writers so frames never interleave;
//! [`FrameReader`] always yields complete frames and tells a clean
//! end-of-stream apart from one that cut a frame short.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, FrameConfig, PipeCodec, DEFAULT_MAX_PAYLOAD, LENGTH_PREFIX_SIZE,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
