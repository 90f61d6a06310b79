use std::sync::Arc;
use std::time::Duration;

use pipelink_format::FormatError;
use pipelink_frame::FrameError;
use pipelink_transport::TransportError;

use crate::connection::ConnectionId;

/// Errors that can occur in peer operations.
///
/// Cloneable so that one failure can be returned to the caller and also
/// reported on the event stream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PeerError {
    /// Binding, connecting or accepting failed.
    #[error("transport error: {0}")]
    Transport(Arc<TransportError>),

    /// I/O error on an established stream.
    #[error("connection fault: {0}")]
    ConnectionFault(Arc<std::io::Error>),

    /// The peer sent something that is not a valid frame sequence.
    #[error("protocol violation: {0}")]
    ProtocolViolation(Arc<FrameError>),

    /// The formatter could not encode or decode a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] FormatError),

    /// There is no live connection to write to.
    #[error("not connected")]
    NotConnected,

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Connect or write did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Bad offset/length for a ranged write.
    #[error("invalid range: offset {offset}, length {length}, buffer length {buffer_len}")]
    InvalidRange {
        offset: usize,
        length: usize,
        buffer_len: usize,
    },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// `start` or `connect` called while already active.
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// No connection with this id is owned by the server.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

/// Coarse classification of a [`PeerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    ConnectionFault,
    ProtocolViolation,
    Serialization,
    NotConnected,
    Cancelled,
    Timeout,
    InvalidRange,
    PayloadTooLarge,
    AlreadyRunning,
    UnknownConnection,
}

impl PeerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeerError::Transport(_) => ErrorKind::Transport,
            PeerError::ConnectionFault(_) => ErrorKind::ConnectionFault,
            PeerError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            PeerError::Serialization(_) => ErrorKind::Serialization,
            PeerError::NotConnected => ErrorKind::NotConnected,
            PeerError::Cancelled => ErrorKind::Cancelled,
            PeerError::Timeout(_) => ErrorKind::Timeout,
            PeerError::InvalidRange { .. } => ErrorKind::InvalidRange,
            PeerError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            PeerError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            PeerError::UnknownConnection(_) => ErrorKind::UnknownConnection,
        }
    }

    /// Classify a failure of the read side. Anything that is not plain I/O
    /// means the byte stream no longer parses as frames.
    pub(crate) fn from_read(err: FrameError) -> Self {
        match err {
            FrameError::Io(source) => PeerError::ConnectionFault(Arc::new(source)),
            other => PeerError::ProtocolViolation(Arc::new(other)),
        }
    }
}

impl From<TransportError> for PeerError {
    fn from(err: TransportError) -> Self {
        PeerError::Transport(Arc::new(err))
    }
}

impl From<FrameError> for PeerError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(source) => PeerError::ConnectionFault(Arc::new(source)),
            FrameError::PayloadTooLarge { size, max } => PeerError::PayloadTooLarge { size, max },
            FrameError::InvalidRange {
                offset,
                length,
                buffer_len,
            } => PeerError::InvalidRange {
                offset,
                length,
                buffer_len,
            },
            FrameError::TimedOut(limit) => PeerError::Timeout(limit),
            FrameError::Cancelled => PeerError::Cancelled,
            FrameError::Closed => PeerError::NotConnected,
            truncated @ FrameError::Truncated { .. } => {
                PeerError::ProtocolViolation(Arc::new(truncated))
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
