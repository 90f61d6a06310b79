use std::future::Future;
use std::time::Duration;

use pipelink_transport::DrainStatus;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::codec::FrameConfig;
use crate::error::{FrameError, Result};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Writes complete frames to an `AsyncWrite` stream shared by many tasks.
///
/// Every frame (prefix, payload, flush) is written while holding one async
/// lock, so frames from concurrent callers never interleave and are written
/// in the order the callers acquired the lock. A write that is abandoned
/// part-way leaves the stream with an unknown framing position; the writer
/// then closes itself and every later call fails with [`FrameError::Closed`].
///
/// Calls already in progress when [`FrameWriter::close_now`] runs fail with
/// [`FrameError::Cancelled`] instead.
pub struct FrameWriter<W> {
    state: Mutex<Option<W>>,
    closed: CancellationToken,
    aborted: CancellationToken,
    config: FrameConfig,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: W) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: W, config: FrameConfig) -> Self {
        Self {
            state: Mutex::new(Some(inner)),
            closed: CancellationToken::new(),
            aborted: CancellationToken::new(),
            config,
        }
    }

    /// Write `payload` as one frame and flush it.
    pub async fn write(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        let limit = self.config.payload_limit();
        if payload.len() > limit {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: limit,
            });
        }
        if self.is_closed() {
            return Err(FrameError::Closed);
        }

        let mut state = self.lock(cancel).await?;
        let Some(stream) = state.as_mut() else {
            return Err(FrameError::Closed);
        };

        let prefix = (payload.len() as u32).to_be_bytes();
        let io = async {
            stream.write_all(&prefix).await?;
            stream.write_all(payload).await?;
            stream.flush().await
        };

        let outcome = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.interrupted()),
            _ = cancel.cancelled() => Err(FrameError::Cancelled),
            result = with_timeout(self.config.write_timeout, io) => result,
        };

        match outcome {
            Ok(()) => {
                trace!(len = payload.len(), "frame written");
                Ok(())
            }
            Err(err) => {
                debug!(error = %err, "frame write failed; closing writer");
                *state = None;
                self.closed.cancel();
                Err(err)
            }
        }
    }

    /// Write `buffer[offset..offset + length]` as one frame.
    ///
    /// For a non-empty buffer `offset` must point inside it, and the region
    /// must not run past its end. Nothing is written on a bad range.
    pub async fn write_range(
        &self,
        buffer: &[u8],
        offset: usize,
        length: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let region = checked_region(buffer, offset, length)?;
        self.write(region, cancel).await
    }

    /// Wait for any in-flight frame, then shut the stream down.
    ///
    /// The peer sees a clean end-of-stream after the last complete frame.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.closed.cancel();
        match state.take() {
            Some(mut stream) => stream.shutdown().await.map_err(FrameError::from),
            None => Ok(()),
        }
    }

    /// Close immediately, cancelling the in-flight and all waiting writes.
    pub fn close_now(&self) {
        self.aborted.cancel();
        self.close();
    }

    /// Close because the stream is gone; pending writes fail with `Closed`.
    pub fn close(&self) {
        self.closed.cancel();
        if let Ok(mut state) = self.state.try_lock() {
            state.take();
        }
    }

    /// True once the writer no longer accepts frames.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the writer is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Consume the writer, returning the stream if it is still open.
    pub fn into_inner(self) -> Option<W> {
        self.state.into_inner()
    }

    fn interrupted(&self) -> FrameError {
        if self.aborted.is_cancelled() {
            FrameError::Cancelled
        } else {
            FrameError::Closed
        }
    }

    async fn lock(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, Option<W>>> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.interrupted()),
            _ = cancel.cancelled() => Err(FrameError::Cancelled),
            guard = self.state.lock() => Ok(guard),
        }
    }
}

impl<W: AsyncWrite + DrainStatus + Unpin + Send> FrameWriter<W> {
    /// Wait until the peer has consumed every byte written so far.
    ///
    /// Returns immediately when the stream cannot report pending bytes.
    /// Holds the writer lock, so frames queued behind it wait as well.
    pub async fn wait_for_drain(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_closed() {
            return Err(FrameError::Closed);
        }
        let state = self.lock(cancel).await?;
        loop {
            let Some(stream) = state.as_ref() else {
                return Err(FrameError::Closed);
            };
            match stream.pending_write_bytes()? {
                None | Some(0) => return Ok(()),
                Some(pending) => trace!(pending, "waiting for peer to drain"),
            }
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(self.interrupted()),
                _ = cancel.cancelled() => return Err(FrameError::Cancelled),
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
            }
        }
    }
}

impl<W> std::fmt::Debug for FrameWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("closed", &self.closed.is_cancelled())
            .field("config", &self.config)
            .finish()
    }
}

fn checked_region(buffer: &[u8], offset: usize, length: usize) -> Result<&[u8]> {
    let invalid = || FrameError::InvalidRange {
        offset,
        length,
        buffer_len: buffer.len(),
    };
    if !buffer.is_empty() && offset >= buffer.len() {
        return Err(invalid());
    }
    let end = offset.checked_add(length).ok_or_else(invalid)?;
    buffer.get(offset..end).ok_or_else(invalid)
}

async fn with_timeout<F>(limit: Option<Duration>, io: F) -> Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, io).await {
            Ok(result) => result.map_err(FrameError::from),
            Err(_) => Err(FrameError::TimedOut(limit)),
        },
        None => io.await.map_err(FrameError::from),
    }
}
