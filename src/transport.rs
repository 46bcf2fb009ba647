//! Transport abstraction for upgrade sockets
//!
//! Every raw connection that reaches the server is wrapped in a [`Socket`],
//! a type-erased `AsyncRead + AsyncWrite` stream that remembers whether the
//! underlying transport is encrypted. The secure flag is read from the
//! transport type itself, never from request headers.
//!
//! # Example
//!
//! ```ignore
//! use tokio::net::TcpStream;
//! use sockudo_ws_server::Socket;
//!
//! let tcp = TcpStream::connect("example.com:80").await?;
//! let socket = Socket::new(tcp);
//! assert!(!socket.is_secure());
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// A byte stream an upgrade request can arrive on
///
/// Implement this for custom stream types (for example a TLS stream from a
/// different TLS stack) and return `true` from [`is_secure`](Self::is_secure)
/// when the bytes on the wire are encrypted.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Whether the transport is encrypted
    fn is_secure(&self) -> bool {
        false
    }

    /// Remote address of the peer, if known
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Transport for tokio::net::TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpStream::peer_addr(self).ok()
    }
}

impl Transport for tokio::io::DuplexStream {}

#[cfg(unix)]
impl Transport for tokio::net::UnixStream {}

#[cfg(feature = "tls")]
impl<S: Transport> Transport for tokio_rustls::server::TlsStream<S> {
    fn is_secure(&self) -> bool {
        true
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr()
    }
}

/// Type-erased transport stream
///
/// The secure flag and peer address are captured when the socket is
/// created, so they stay available after the stream is handed to the
/// framing codec.
pub struct Socket {
    inner: Box<dyn Transport>,
    secure: bool,
    peer_addr: Option<SocketAddr>,
}

impl Socket {
    /// Wrap any transport
    pub fn new<S: Transport>(inner: S) -> Self {
        let secure = inner.is_secure();
        let peer_addr = inner.peer_addr();
        Self {
            inner: Box::new(inner),
            secure,
            peer_addr,
        }
    }

    /// Whether the underlying transport is encrypted
    #[inline]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Remote address of the peer, if known
    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Write a complete HTTP response and shut the write half down
    pub(crate) async fn respond_and_close(&mut self, response: &[u8]) -> io::Result<()> {
        self.write_all(response).await?;
        self.flush().await?;
        self.shutdown().await
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(self.inner.as_mut()).poll_read(cx, buf)
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(self.inner.as_mut()).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.inner.as_mut()).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.inner.as_mut()).poll_shutdown(cx)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("secure", &self.secure)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Duplex stream that claims to be encrypted
    pub(crate) struct Encrypted(pub tokio::io::DuplexStream);

    impl AsyncRead for Encrypted {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Encrypted {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    impl Transport for Encrypted {
        fn is_secure(&self) -> bool {
            true
        }
    }
}
