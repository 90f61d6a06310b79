use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Result;

/// Reports how many written bytes the peer has not consumed yet.
///
/// Transports that cannot observe this return `Ok(None)`; callers treat that
/// as "nothing to wait for" rather than as an error.
pub trait DrainStatus {
    fn pending_write_bytes(&self) -> io::Result<Option<usize>>;
}

/// A connected IPC stream implementing `AsyncRead + AsyncWrite`.
///
/// This is the fundamental I/O type returned by transport operations.
/// On Unix, this wraps a Unix domain socket stream.
/// On Windows, this wraps a named pipe handle (server or client end).
pub struct IpcStream {
    inner: IpcStreamInner,
}

enum IpcStreamInner {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    #[cfg(windows)]
    PipeServer(tokio::net::windows::named_pipe::NamedPipeServer),
    #[cfg(windows)]
    PipeClient(tokio::net::windows::named_pipe::NamedPipeClient),
}

impl IpcStream {
    /// Create an IpcStream from a Unix domain socket stream.
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: tokio::net::UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_pipe_server(pipe: tokio::net::windows::named_pipe::NamedPipeServer) -> Self {
        Self {
            inner: IpcStreamInner::PipeServer(pipe),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_pipe_client(pipe: tokio::net::windows::named_pipe::NamedPipeClient) -> Self {
        Self {
            inner: IpcStreamInner::PipeClient(pipe),
        }
    }

    /// A connected pair of in-process streams.
    ///
    /// Must be called from within a tokio runtime.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = tokio::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (IpcReadHalf, IpcWriteHalf) {
        match self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => {
                let (read, write) = stream.into_split();
                (
                    IpcReadHalf {
                        inner: ReadHalfInner::Unix(read),
                    },
                    IpcWriteHalf {
                        inner: WriteHalfInner::Unix(write),
                    },
                )
            }
            #[cfg(windows)]
            inner => {
                let (read, write) = tokio::io::split(IpcStream { inner });
                (
                    IpcReadHalf {
                        inner: ReadHalfInner::Split(read),
                    },
                    IpcWriteHalf {
                        inner: WriteHalfInner::Split(write),
                    },
                )
            }
        }
    }

    /// Process id of the connected peer, when the platform exposes it.
    pub fn peer_process_id(&self) -> Option<u32> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream
                .peer_cred()
                .ok()
                .and_then(|cred| cred.pid())
                .and_then(|pid| u32::try_from(pid).ok()),
            #[cfg(windows)]
            _ => None,
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => "unix-domain-socket",
            #[cfg(windows)]
            _ => "named-pipe",
        }
    }
}

impl AsyncRead for IpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(windows)]
            IpcStreamInner::PipeServer(pipe) => Pin::new(pipe).poll_read(cx, buf),
            #[cfg(windows)]
            IpcStreamInner::PipeClient(pipe) => Pin::new(pipe).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(windows)]
            IpcStreamInner::PipeServer(pipe) => Pin::new(pipe).poll_write(cx, buf),
            #[cfg(windows)]
            IpcStreamInner::PipeClient(pipe) => Pin::new(pipe).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(windows)]
            IpcStreamInner::PipeServer(pipe) => Pin::new(pipe).poll_flush(cx),
            #[cfg(windows)]
            IpcStreamInner::PipeClient(pipe) => Pin::new(pipe).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(windows)]
            IpcStreamInner::PipeServer(pipe) => Pin::new(pipe).poll_shutdown(cx),
            #[cfg(windows)]
            IpcStreamInner::PipeClient(pipe) => Pin::new(pipe).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream")
            .field("type", &self.transport_name())
            .finish()
    }
}

/// Owned read half of an [`IpcStream`].
pub struct IpcReadHalf {
    inner: ReadHalfInner,
}

enum ReadHalfInner {
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedReadHalf),
    #[cfg(windows)]
    Split(tokio::io::ReadHalf<IpcStream>),
}

impl AsyncRead for IpcReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            ReadHalfInner::Unix(half) => Pin::new(half).poll_read(cx, buf),
            #[cfg(windows)]
            ReadHalfInner::Split(half) => Pin::new(half).poll_read(cx, buf),
        }
    }
}

impl std::fmt::Debug for IpcReadHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcReadHalf").finish_non_exhaustive()
    }
}

/// Owned write half of an [`IpcStream`].
///
/// Dropping or shutting down the write half signals end-of-stream to the peer.
pub struct IpcWriteHalf {
    inner: WriteHalfInner,
}

enum WriteHalfInner {
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedWriteHalf),
    #[cfg(windows)]
    Split(tokio::io::WriteHalf<IpcStream>),
}

impl AsyncWrite for IpcWriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            WriteHalfInner::Unix(half) => Pin::new(half).poll_write(cx, buf),
            #[cfg(windows)]
            WriteHalfInner::Split(half) => Pin::new(half).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            WriteHalfInner::Unix(half) => Pin::new(half).poll_flush(cx),
            #[cfg(windows)]
            WriteHalfInner::Split(half) => Pin::new(half).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            #[cfg(unix)]
            WriteHalfInner::Unix(half) => Pin::new(half).poll_shutdown(cx),
            #[cfg(windows)]
            WriteHalfInner::Split(half) => Pin::new(half).poll_shutdown(cx),
        }
    }
}

impl DrainStatus for IpcWriteHalf {
    /// On Linux this is the socket's unsent/unread byte count (`TIOCOUTQ`);
    /// other platforms cannot report it.
    fn pending_write_bytes(&self) -> io::Result<Option<usize>> {
        match &self.inner {
            #[cfg(target_os = "linux")]
            WriteHalfInner::Unix(half) => {
                use std::os::fd::AsRawFd;

                let stream: &tokio::net::UnixStream = half.as_ref();
                let fd = stream.as_raw_fd();
                let mut pending: libc::c_int = 0;

                // SAFETY: `fd` is an open socket owned by `half` for the duration of
                // this call, and `pending` is a valid writable `c_int` as TIOCOUTQ expects.
                let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut pending as *mut libc::c_int) };
                if rc == 0 {
                    Ok(Some(usize::try_from(pending).unwrap_or(0)))
                } else {
                    Err(io::Error::last_os_error())
                }
            }
            #[cfg(all(unix, not(target_os = "linux")))]
            WriteHalfInner::Unix(_) => Ok(None),
            #[cfg(windows)]
            WriteHalfInner::Split(_) => Ok(None),
        }
    }
}

impl std::fmt::Debug for IpcWriteHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcWriteHalf").finish_non_exhaustive()
    }
}
