use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::codec::{FrameConfig, PipeCodec};
use crate::error::Result;

/// Reads complete frames from any `AsyncRead` stream.
///
/// Handles partial reads internally; callers always get complete frames.
pub struct FrameReader<R> {
    inner: FramedRead<R, PipeCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: R) -> Self {
        Self::with_config(inner, &FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: R, config: &FrameConfig) -> Self {
        Self {
            inner: FramedRead::new(inner, PipeCodec::from_config(config)),
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` when the stream ends exactly at a frame boundary and
    /// `Err(FrameError::Truncated)` when it ends inside one. Cancel-safe:
    /// bytes received so far stay buffered for the next call.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        std::future::poll_fn(|cx| Pin::new(&mut self.inner).poll_next(cx))
            .await
            .transpose()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }

    /// Consume the reader, returning the underlying stream.
    ///
    /// Any buffered partial frame is discarded.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R: AsyncRead + Unpin> Stream for FrameReader<R> {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl<R> std::fmt::Debug for FrameReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("buffered", &self.inner.read_buffer().len())
            .finish()
    }
}
