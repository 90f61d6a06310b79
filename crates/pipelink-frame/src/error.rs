use std::time::Duration;

/// Errors that can occur during frame encoding, decoding, reading or writing.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The requested sub-range does not lie inside the buffer.
    #[error("invalid range: offset {offset}, length {length}, buffer length {buffer_len}")]
    InvalidRange {
        offset: usize,
        length: usize,
        buffer_len: usize,
    },

    /// The stream ended in the middle of a frame.
    #[error("stream ended inside a frame ({received} of {expected} bytes)")]
    Truncated { expected: usize, received: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The write did not complete within the configured timeout.
    #[error("write timed out after {0:?}")]
    TimedOut(Duration),

    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The writer has been closed.
    #[error("writer closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
