use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FrameError, Result};

/// Length prefix: a 4-byte big-endian payload length.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const WIRE_MAX_PAYLOAD: usize = u32::MAX as usize;

/// Encode a payload into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────────┐
/// │ Length       │ Payload          │
/// │ (4B BE)      │ (Length bytes)   │
/// └──────────────┴──────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > WIRE_MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: WIRE_MAX_PAYLOAD,
        });
    }
    dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    let Some(payload_len) = peek_length(src) else {
        return Ok(None);
    };

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = LENGTH_PREFIX_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(src.split_to(payload_len).freeze()))
}

fn peek_length(src: &[u8]) -> Option<usize> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = src.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(prefix) as usize)
}

/// Configuration for framing on one connection.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes, for both directions. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Upper bound on a single frame write, lock wait excluded.
    pub write_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            write_timeout: None,
        }
    }
}

impl FrameConfig {
    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max.min(WIRE_MAX_PAYLOAD);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// The effective payload limit, never above what the prefix can express.
    pub fn payload_limit(&self) -> usize {
        self.max_payload_size.min(WIRE_MAX_PAYLOAD)
    }
}

/// `tokio_util` codec for length-prefixed frames.
#[derive(Debug, Clone)]
pub struct PipeCodec {
    max_payload: usize,
}

impl PipeCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(WIRE_MAX_PAYLOAD),
        }
    }

    pub fn from_config(config: &FrameConfig) -> Self {
        Self::new(config.payload_limit())
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn encode_checked(&self, item: &[u8], dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: item.len(),
                max: self.max_payload,
            });
        }
        encode_frame(item, dst)
    }
}

impl Default for PipeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for PipeCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        decode_frame(src, self.max_payload)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let expected = match peek_length(src) {
            Some(payload_len) => LENGTH_PREFIX_SIZE + payload_len,
            None => LENGTH_PREFIX_SIZE,
        };
        let received = src.len();
        src.clear();
        Err(FrameError::Truncated { expected, received })
    }
}

impl Encoder<Bytes> for PipeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        self.encode_checked(&item, dst)
    }
}

impl Encoder<&[u8]> for PipeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<()> {
        self.encode_checked(item, dst)
    }
}
