use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// Where a channel listens or dials. A filesystem path selects a Unix-domain
/// socket, a `host:port` string selects TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Endpoint::Tcp(addr.into())
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(path.into())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// The byte stream a connection runs on. Encrypted transports stay out of
/// here, a TLS wrapper around the plain stream can be handed to the
/// connection by the application instead.
pub enum NetStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl NetStream {
    pub async fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => NetStream::tcp(TcpStream::connect(addr).await?),
            Endpoint::Unix(path) => Ok(NetStream::Unix(UnixStream::connect(path).await?)),
        }
    }

    /// Wraps an established TCP stream, applying the socket options every
    /// connection runs with: no Nagle buffering, and a zero linger so that
    /// dropping the stream without an orderly shutdown resets the peer.
    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_linger(Some(Duration::ZERO))?;
        Ok(NetStream::Tcp(stream))
    }

    pub fn peer_addr(&self) -> String {
        match self {
            NetStream::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            NetStream::Unix(stream) => stream
                .peer_addr()
                .map(|addr| format!("{:?}", addr))
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }

    pub fn local_addr(&self) -> String {
        match self {
            NetStream::Tcp(stream) => stream
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            NetStream::Unix(stream) => stream
                .local_addr()
                .map(|addr| format!("{:?}", addr))
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            NetStream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            NetStream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            NetStream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            NetStream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
